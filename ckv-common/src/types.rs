//! # Routing Value Types
//!
//! Immutable value types shared by the pool, the router and the topology
//! manager.
//!
//! ## Design Principles
//!
//! 1. **Value Semantics**: `ServerAddress` compares and hashes by host + port, so it
//!    can key pool maps and ring entries directly.
//! 2. **Total Order**: Addresses are `Ord` so ring ties and diffs are deterministic
//!    on every client in the cluster.
//! 3. **Newtype Versions**: `TopologyId` wraps a `u64` so it cannot be confused
//!    with hash codes or hash-function versions.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

/// Host + port identifying one cache node.
///
/// Serialized as the `host:port` string form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    /// Creates an address from its parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ServerAddress {
            host: host.into(),
            port,
        }
    }

    /// Host name or IP literal (without IPv6 brackets).
    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolves the address to the first matching socket address.
    ///
    /// # Errors
    /// Returns `CacheError::InvalidAddress` when resolution yields nothing.
    pub fn resolve(&self) -> CacheResult<SocketAddr> {
        let mut addrs = (self.host.as_str(), self.port).to_socket_addrs()?;
        addrs
            .next()
            .ok_or_else(|| CacheError::InvalidAddress(self.to_string()))
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ServerAddress {
    type Err = CacheError;

    /// Parses `host:port` or `[v6]:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CacheError::InvalidAddress(s.to_string());
        let (host, port) = s.trim().rsplit_once(':').ok_or_else(invalid)?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(ServerAddress::new(host, port))
    }
}

impl TryFrom<String> for ServerAddress {
    type Error = CacheError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ServerAddress> for String {
    fn from(addr: ServerAddress) -> Self {
        addr.to_string()
    }
}

impl From<SocketAddr> for ServerAddress {
    fn from(addr: SocketAddr) -> Self {
        ServerAddress::new(addr.ip().to_string(), addr.port())
    }
}

/// Identifier of an accepted topology version.
///
/// Monotonically increasing; an update is accepted only when its id is
/// strictly greater than the active one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct TopologyId(pub u64);

impl TopologyId {
    /// Baseline id before the cluster has pushed any topology.
    pub const ZERO: TopologyId = TopologyId(0);

    #[inline]
    pub const fn new(id: u64) -> Self {
        TopologyId(id)
    }

    #[inline]
    pub const fn get(&self) -> u64 {
        self.0
    }

    /// Returns the next id without modifying self.
    #[inline]
    pub const fn next(&self) -> TopologyId {
        TopologyId(self.0.wrapping_add(1))
    }

    /// Returns true when `self` should replace `active`.
    #[inline]
    pub fn supersedes(&self, active: TopologyId) -> bool {
        self.0 > active.0
    }
}

impl fmt::Display for TopologyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
