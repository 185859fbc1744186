//! Test doubles for running the routing layer without a live cluster.
//!
//! `MockConnector` hands out `MockTransport`s that read a scripted reply
//! stream and record everything written to them, per server.

use std::collections::{HashMap, HashSet};
use std::io::{self, BufRead, Cursor, Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use ckv_common::{CacheError, CacheResult, Marshaller, ServerAddress};

use crate::config::PoolConfig;
use crate::transport::{Connector, Transport};

#[derive(Default)]
struct MockState {
    script: Vec<u8>,
    scripts: HashMap<ServerAddress, Vec<u8>>,
    failing: HashSet<ServerAddress>,
    connects: HashMap<ServerAddress, usize>,
    written: HashMap<ServerAddress, Vec<u8>>,
    closed: usize,
}

/// Connector producing in-memory transports.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply bytes every new transport starts with.
    pub fn set_script(&self, script: Vec<u8>) {
        self.state.lock().script = script;
    }

    /// Reply bytes for new transports to one server, overriding the default.
    pub fn set_server_script(&self, server: ServerAddress, script: Vec<u8>) {
        self.state.lock().scripts.insert(server, script);
    }

    /// Makes connects to `server` fail with a connection-refused error.
    pub fn fail(&self, server: ServerAddress) {
        self.state.lock().failing.insert(server);
    }

    pub fn recover(&self, server: &ServerAddress) {
        self.state.lock().failing.remove(server);
    }

    /// Successful connects made to `server`.
    pub fn connects(&self, server: &ServerAddress) -> usize {
        self.state.lock().connects.get(server).copied().unwrap_or(0)
    }

    pub fn total_connects(&self) -> usize {
        self.state.lock().connects.values().sum()
    }

    /// Transports closed by their pool.
    pub fn closed(&self) -> usize {
        self.state.lock().closed
    }

    /// Everything written to transports of `server`, in write order.
    pub fn written(&self, server: &ServerAddress) -> Vec<u8> {
        self.state.lock().written.get(server).cloned().unwrap_or_default()
    }
}

impl Connector for MockConnector {
    fn connect(&self, config: &PoolConfig) -> CacheResult<Box<dyn Transport>> {
        let mut state = self.state.lock();
        if state.failing.contains(&config.server) {
            return Err(CacheError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("mock refused {}", config.server),
            )));
        }
        *state.connects.entry(config.server.clone()).or_insert(0) += 1;
        let script = state
            .scripts
            .get(&config.server)
            .cloned()
            .unwrap_or_else(|| state.script.clone());

        Ok(Box::new(MockTransport {
            server: config.server.clone(),
            input: Cursor::new(script),
            state: self.state.clone(),
        }))
    }
}

/// In-memory transport created by `MockConnector`.
pub struct MockTransport {
    server: ServerAddress,
    input: Cursor<Vec<u8>>,
    state: Arc<Mutex<MockState>>,
}

impl Read for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }
}

impl BufRead for MockTransport {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.input.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.input.consume(amt)
    }
}

impl Write for MockTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.state
            .lock()
            .written
            .entry(self.server.clone())
            .or_default()
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MockTransport {
    fn server(&self) -> &ServerAddress {
        &self.server
    }

    fn close(&mut self) {
        self.state.lock().closed += 1;
    }
}

/// Marshaller stand-in that accepts nothing and produces empty output.
pub struct NullMarshaller<T> {
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> Default for NullMarshaller<T> {
    fn default() -> Self {
        NullMarshaller {
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Default> Marshaller for NullMarshaller<T> {
    type Object = T;

    fn object_to_bytes(&self, _object: &T) -> CacheResult<Bytes> {
        Ok(Bytes::new())
    }

    fn bytes_to_object(&self, _bytes: &[u8]) -> CacheResult<T> {
        Ok(T::default())
    }

    fn is_marshallable(&self, _object: &T) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_writes_per_server() {
        let connector = MockConnector::new();
        connector.set_server_script(ServerAddress::new("b", 2), b"+B\r\n".to_vec());
        let a = PoolConfig::for_server(ServerAddress::new("a", 1));
        let b = PoolConfig::for_server(ServerAddress::new("b", 2));

        let mut ta = connector.connect(&a).unwrap();
        let mut tb = connector.connect(&b).unwrap();
        ta.write_all(b"one").unwrap();
        tb.write_all(b"two").unwrap();
        let mut line = String::new();
        tb.read_line(&mut line).unwrap();

        assert_eq!(line, "+B\r\n");
        assert_eq!(connector.written(&ServerAddress::new("a", 1)), b"one".to_vec());
        assert_eq!(connector.total_connects(), 2);
    }

    #[test]
    fn null_marshaller_refuses_everything() {
        let m = NullMarshaller::<String>::default();
        assert!(!m.is_marshallable(&"x".to_string()));
        assert!(m.object_to_bytes(&"x".to_string()).unwrap().is_empty());
        assert_eq!(m.bytes_to_object(b"abc").unwrap(), "");
    }
}
