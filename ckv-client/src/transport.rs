//! # Transports
//!
//! Purpose: Abstract one live connection to a cache server as a buffered
//! byte stream, and the factory function that opens such connections.
//!
//! ## Design Principles
//! 1. **Capability Traits**: Pools only need `Connector` + `Transport`, so tests can
//!    substitute in-memory doubles without a live cluster.
//! 2. **Buffered Reads**: `Transport: BufRead` lets framing code parse lines
//!    without extra copies.
//! 3. **Direct Writes**: Writes go straight to the socket; callers flush once per request.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};

use tracing::{debug, trace};

use ckv_common::{CacheResult, ServerAddress};

use crate::config::PoolConfig;

/// Byte-stream view over one connection.
pub trait Transport: BufRead + Write + Send {
    /// Server this transport is connected to.
    fn server(&self) -> &ServerAddress;

    /// Tears the connection down. Called exactly once when the pool destroys it.
    fn close(&mut self) {}
}

/// Opens new transports on behalf of a connection pool.
pub trait Connector: Send + Sync {
    /// Opens one connection to `config.server`.
    fn connect(&self, config: &PoolConfig) -> CacheResult<Box<dyn Transport>>;
}

/// TCP transport with a buffered reader.
pub struct TcpTransport {
    server: ServerAddress,
    // Buffered reader reduces syscalls while still allowing direct writes.
    reader: BufReader<TcpStream>,
}

impl TcpTransport {
    /// Connects using the socket options from `config`.
    pub fn connect(config: &PoolConfig) -> CacheResult<Self> {
        let addr = config.server.resolve()?;
        let stream = match config.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout)?,
            None => TcpStream::connect(addr)?,
        };
        stream.set_read_timeout(config.read_timeout)?;
        stream.set_write_timeout(config.write_timeout)?;
        stream.set_nodelay(config.tcp_no_delay)?;
        debug!(server = %config.server, peer = %addr, "opened tcp transport");

        Ok(TcpTransport {
            server: config.server.clone(),
            reader: BufReader::new(stream),
        })
    }
}

impl Read for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl BufRead for TcpTransport {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.reader.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.reader.consume(amt)
    }
}

impl Write for TcpTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.reader.get_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.reader.get_mut().flush()
    }
}

impl Transport for TcpTransport {
    fn server(&self) -> &ServerAddress {
        &self.server
    }

    fn close(&mut self) {
        // Peer may already be gone.
        let _ = self.reader.get_ref().shutdown(Shutdown::Both);
        trace!(server = %self.server, "closed tcp transport");
    }
}

/// Connector producing `TcpTransport`s.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, config: &PoolConfig) -> CacheResult<Box<dyn Transport>> {
        Ok(Box::new(TcpTransport::connect(config)?))
    }
}
