//! # Remote Cache Facade
//!
//! Purpose: Expose a compact, blocking key/value API on top of the transport
//! factory, with keys and values converted by injected marshallers.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `RemoteCache` hides routing, pooling and framing.
//! 2. **Route By Key Bytes**: The marshalled key is both the routing input and the
//!    wire argument, so every client hashes exactly what the server stores.
//! 3. **One Fresh Retry**: A transport failure destroys the lease and the command is
//!    retried once on a freshly leased transport; a second failure is surfaced.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use ckv_common::{CacheError, CacheResult, Marshaller};

use crate::factory::TransportFactory;
use crate::resp::RespValue;

/// Blocking key/value client over a shared `TransportFactory`.
pub struct RemoteCache<K, V> {
    factory: Arc<TransportFactory>,
    keys: K,
    values: V,
}

impl<K, V> RemoteCache<K, V>
where
    K: Marshaller,
    V: Marshaller,
{
    pub fn new(factory: Arc<TransportFactory>, keys: K, values: V) -> Self {
        RemoteCache { factory, keys, values }
    }

    pub fn factory(&self) -> &Arc<TransportFactory> {
        &self.factory
    }

    /// Fetches a value. Returns `Ok(None)` when the key is missing.
    pub fn get(&self, key: &K::Object) -> CacheResult<Option<V::Object>> {
        let key_buf = self.key_bytes(key)?;
        let key: &[u8] = &key_buf;
        match self.execute_keyed(key, &[b"GET", key])? {
            RespValue::Bulk(Some(data)) => Ok(Some(self.values.bytes_to_object(&data)?)),
            RespValue::Bulk(None) => Ok(None),
            _ => Err(CacheError::UnexpectedResponse),
        }
    }

    /// Stores a value without expiration.
    pub fn put(&self, key: &K::Object, value: &V::Object) -> CacheResult<()> {
        let key_buf = self.key_bytes(key)?;
        let value_buf = self.value_bytes(value)?;
        let key: &[u8] = &key_buf;
        expect_ok(self.execute_keyed(key, &[b"SET", key, &value_buf[..]])?)
    }

    /// Stores a value that expires after `ttl` (rounded up to whole seconds).
    pub fn put_with_ttl(&self, key: &K::Object, value: &V::Object, ttl: Duration) -> CacheResult<()> {
        let key_buf = self.key_bytes(key)?;
        let value_buf = self.value_bytes(value)?;
        let key: &[u8] = &key_buf;
        let seconds = ttl_seconds(ttl).to_string();
        expect_ok(self.execute_keyed(key, &[b"SET", key, &value_buf[..], b"EX", seconds.as_bytes()])?)
    }

    /// Removes a key. Returns true when something was removed.
    pub fn remove(&self, key: &K::Object) -> CacheResult<bool> {
        let key_buf = self.key_bytes(key)?;
        let key: &[u8] = &key_buf;
        match self.execute_keyed(key, &[b"DEL", key])? {
            RespValue::Integer(count) => Ok(count > 0),
            _ => Err(CacheError::UnexpectedResponse),
        }
    }

    /// Pings a balancer-selected server.
    pub fn ping(&self) -> CacheResult<()> {
        let mut lease = self.factory.get_transport()?;
        let reply = lease.exec(&[b"PING"]);
        self.factory.release_transport(lease);
        match reply?.into_result()? {
            RespValue::Simple(_) | RespValue::Bulk(Some(_)) => Ok(()),
            _ => Err(CacheError::UnexpectedResponse),
        }
    }

    fn key_bytes(&self, key: &K::Object) -> CacheResult<bytes::Bytes> {
        if !self.keys.is_marshallable(key) {
            return Err(CacheError::Serialization("key is not marshallable".into()));
        }
        self.keys.object_to_bytes(key)
    }

    fn value_bytes(&self, value: &V::Object) -> CacheResult<bytes::Bytes> {
        if !self.values.is_marshallable(value) {
            return Err(CacheError::Serialization("value is not marshallable".into()));
        }
        self.values.object_to_bytes(value)
    }

    fn execute_keyed(&self, key: &[u8], args: &[&[u8]]) -> CacheResult<RespValue> {
        let mut retried = false;
        loop {
            let mut lease = self.factory.get_transport_for_key(key)?;
            let server = lease.server().clone();
            let reply = lease.exec(args);
            // Failed leases were marked by `exec` and are destroyed here.
            self.factory.release_transport(lease);

            match reply {
                Ok(value) => return value.into_result(),
                Err(err) if err.is_transport_failure() && !retried => {
                    warn!(server = %server, error = %err, "transport failed, retrying on a fresh lease");
                    retried = true;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn expect_ok(reply: RespValue) -> CacheResult<()> {
    match reply {
        RespValue::Simple(_) => Ok(()),
        _ => Err(CacheError::UnexpectedResponse),
    }
}

fn ttl_seconds(ttl: Duration) -> u64 {
    let secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 || secs == 0 {
        secs + 1
    } else {
        secs
    }
}
