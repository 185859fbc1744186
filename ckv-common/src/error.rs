//! # Error Taxonomy
//!
//! Purpose: One error type for every failure the transport and routing layer
//! can surface to a caller.
//!
//! ## Design Principles
//! 1. **Single Enum**: Callers match on one type regardless of which component failed.
//! 2. **Fail Fast**: Configuration and lifecycle misuse are reported at the call site.
//! 3. **Classifiable**: `is_transport_failure` tells the pool whether a lease is still usable.

use std::time::Duration;

use thiserror::Error;

use crate::types::ServerAddress;

/// Result alias used across the workspace.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors surfaced by the client transport layer.
#[derive(Debug, Error)]
pub enum CacheError {
    /// `start` was called on a factory that is already started (or was stopped).
    #[error("transport factory already started")]
    AlreadyStarted,

    /// The factory was used before `start`.
    #[error("transport factory not started")]
    NotStarted,

    /// The factory was destroyed; no further transports are handed out.
    #[error("transport factory closed")]
    FactoryClosed,

    /// The server set is empty, or every candidate server failed.
    #[error("no available server")]
    NoAvailableServer,

    /// The balancing strategy has no candidates.
    #[error("no servers configured for request balancing")]
    NoServersConfigured,

    /// Pool stayed at capacity for the whole acquire timeout.
    #[error("connection pool for {server} exhausted after {waited:?}")]
    PoolExhausted { server: ServerAddress, waited: Duration },

    /// Pool was drained because its server left the topology.
    #[error("connection pool for {0} is closed")]
    PoolClosed(ServerAddress),

    /// Marshaller could not convert between objects and bytes.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Server address could not be parsed or resolved.
    #[error("invalid server address: {0}")]
    InvalidAddress(String),

    /// Missing or inconsistent configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Topology update could not be turned into a routing table.
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// Network failure while connecting, reading or writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing violation on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server answered with an error reply.
    #[error("server error: {0}")]
    Server(String),

    /// Reply type did not match the issued command.
    #[error("unexpected response")]
    UnexpectedResponse,
}

impl CacheError {
    /// Returns true when the connection that produced this error can no
    /// longer be trusted and must not go back to its pool.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, CacheError::Io(_) | CacheError::Protocol(_))
    }

    /// Returns true when another server may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::Io(_) | CacheError::Protocol(_) | CacheError::PoolClosed(_)
        )
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transport_failures() {
        let io = CacheError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"));
        assert!(io.is_transport_failure());
        assert!(io.is_retryable());

        let protocol = CacheError::Protocol("bad frame".into());
        assert!(protocol.is_transport_failure());

        assert!(!CacheError::Server("ERR".into()).is_transport_failure());
        assert!(!CacheError::NoAvailableServer.is_retryable());
    }

    #[test]
    fn pool_exhausted_is_not_retried() {
        let err = CacheError::PoolExhausted {
            server: ServerAddress::new("a", 1),
            waited: Duration::from_millis(5),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "connection pool for a:1 exhausted after 5ms");
    }
}
