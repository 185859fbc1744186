//! # Marshaller Boundary
//!
//! Purpose: Convert keys and payloads to bytes before they are hashed for
//! routing or written to a transport.
//!
//! The wire format itself is owned by the caller; this module only fixes the
//! contract and ships the marshallers the client needs out of the box.

use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CacheError, CacheResult};

/// Object <-> bytes conversion used for keys and values.
pub trait Marshaller: Send + Sync {
    /// Type of object this marshaller understands.
    type Object;

    /// Serializes an object.
    ///
    /// # Errors
    /// Returns `CacheError::Serialization` when the object cannot be encoded.
    fn object_to_bytes(&self, object: &Self::Object) -> CacheResult<Bytes>;

    /// Deserializes an object previously produced by `object_to_bytes`.
    fn bytes_to_object(&self, bytes: &[u8]) -> CacheResult<Self::Object>;

    /// Returns true when `object_to_bytes` would succeed.
    fn is_marshallable(&self, object: &Self::Object) -> bool;
}

/// Identity marshaller for raw byte keys and values.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesMarshaller;

impl Marshaller for BytesMarshaller {
    type Object = Vec<u8>;

    fn object_to_bytes(&self, object: &Vec<u8>) -> CacheResult<Bytes> {
        Ok(Bytes::copy_from_slice(object))
    }

    fn bytes_to_object(&self, bytes: &[u8]) -> CacheResult<Vec<u8>> {
        Ok(bytes.to_vec())
    }

    fn is_marshallable(&self, _object: &Vec<u8>) -> bool {
        true
    }
}

/// UTF-8 string marshaller.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringMarshaller;

impl Marshaller for StringMarshaller {
    type Object = String;

    fn object_to_bytes(&self, object: &String) -> CacheResult<Bytes> {
        Ok(Bytes::copy_from_slice(object.as_bytes()))
    }

    fn bytes_to_object(&self, bytes: &[u8]) -> CacheResult<String> {
        String::from_utf8(bytes.to_vec()).map_err(|err| CacheError::Serialization(err.to_string()))
    }

    fn is_marshallable(&self, _object: &String) -> bool {
        true
    }
}

/// JSON marshaller for any serde type.
pub struct JsonMarshaller<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonMarshaller<T> {
    pub fn new() -> Self {
        JsonMarshaller {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonMarshaller<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Marshaller for JsonMarshaller<T>
where
    T: Serialize + DeserializeOwned,
{
    type Object = T;

    fn object_to_bytes(&self, object: &T) -> CacheResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(object)?))
    }

    fn bytes_to_object(&self, bytes: &[u8]) -> CacheResult<T> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn is_marshallable(&self, object: &T) -> bool {
        serde_json::to_vec(object).is_ok()
    }
}
