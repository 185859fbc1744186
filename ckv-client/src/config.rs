//! # Factory Configuration
//!
//! Purpose: Describe the cluster entry points and the pool/timeout knobs that
//! every per-server connection pool is built from.
//!
//! Durations are expressed in milliseconds so the struct maps one-to-one to a
//! JSON document; `0` means "no timeout" for socket timeouts and "fail fast"
//! for `acquire_timeout_ms`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use ckv_common::{CacheError, CacheResult, ServerAddress};

/// Configuration for the transport factory and its pools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
    /// Initial cluster entry points.
    pub servers: Vec<ServerAddress>,
    /// Maximum connections per server (idle + leased).
    pub max_total: usize,
    /// Maximum idle connections kept per server.
    pub max_idle: usize,
    /// How long `acquire` waits for a connection when the pool is full.
    pub acquire_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Disable Nagle on new sockets.
    pub tcp_no_delay: bool,
    /// Route keyed operations to their owner instead of round-robin.
    pub key_aware_routing: bool,
    /// Idle connections older than this are closed by `evict_idle`; `0` keeps them.
    pub max_idle_time_ms: u64,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        FactoryConfig {
            servers: Vec::new(),
            max_total: 8,
            max_idle: 8,
            acquire_timeout_ms: 1_000,
            connect_timeout_ms: 1_000,
            read_timeout_ms: 0,
            write_timeout_ms: 0,
            tcp_no_delay: true,
            key_aware_routing: true,
            max_idle_time_ms: 0,
        }
    }
}

impl FactoryConfig {
    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> CacheResult<Self> {
        let config: FactoryConfig =
            serde_json::from_str(json).map_err(|err| CacheError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings that would make every acquire fail.
    pub fn validate(&self) -> CacheResult<()> {
        if self.max_total == 0 {
            return Err(CacheError::Config("max_total must be at least 1".into()));
        }
        if self.max_idle > self.max_total {
            return Err(CacheError::Config(format!(
                "max_idle ({}) exceeds max_total ({})",
                self.max_idle, self.max_total
            )));
        }
        Ok(())
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn max_idle_time(&self) -> Option<Duration> {
        millis(self.max_idle_time_ms)
    }

    /// Builds the pool configuration for one server.
    pub fn pool_config(&self, server: ServerAddress) -> PoolConfig {
        PoolConfig {
            server,
            max_idle: self.max_idle,
            max_total: self.max_total,
            acquire_timeout: self.acquire_timeout(),
            read_timeout: millis(self.read_timeout_ms),
            write_timeout: millis(self.write_timeout_ms),
            connect_timeout: millis(self.connect_timeout_ms),
            tcp_no_delay: self.tcp_no_delay,
        }
    }
}

/// Settings for a single server's connection pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Server every connection of this pool talks to.
    pub server: ServerAddress,
    /// Maximum number of idle connections to keep.
    pub max_idle: usize,
    /// Maximum total connections (idle + leased).
    pub max_total: usize,
    /// Maximum wait for a free slot; zero fails immediately.
    pub acquire_timeout: Duration,
    /// Optional TCP read timeout.
    pub read_timeout: Option<Duration>,
    /// Optional TCP write timeout.
    pub write_timeout: Option<Duration>,
    /// Optional TCP connect timeout.
    pub connect_timeout: Option<Duration>,
    pub tcp_no_delay: bool,
}

impl PoolConfig {
    /// Pool settings with `FactoryConfig` defaults for the given server.
    pub fn for_server(server: ServerAddress) -> Self {
        FactoryConfig::default().pool_config(server)
    }
}

fn millis(value: u64) -> Option<Duration> {
    if value == 0 {
        None
    } else {
        Some(Duration::from_millis(value))
    }
}
