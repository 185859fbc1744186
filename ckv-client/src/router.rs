//! # Consistent Hash Router
//!
//! Purpose: Map a key to the server(s) owning it under a given hash topology.
//!
//! ## Design Principles
//! 1. **Immutable Snapshots**: A `HashTopology` is built once and never mutated;
//!    topology changes build a new one and swap the `Arc`.
//! 2. **Pure Lookup**: `locate` depends only on (key, topology), so every client in
//!    the cluster agrees on ownership without coordination.
//! 3. **Sorted Ring**: Entries are kept in a sorted `Vec` so lookups are a binary
//!    search followed by a short clockwise walk.
//!
//! ## Ring Walk
//!
//! ```text
//!  position = hash_v(key) mod hash_space
//!
//!  ring:  [ 120:A ][ 900:B ][ 4100:C ][ 7000:A ][ 9100:B ]
//!                              ^ first code >= 3000  -> primary C
//!  owners (num_key_owners = 2): C, then A (next distinct server clockwise)
//! ```
//!
//! Entries with equal hash codes are ordered by `ServerAddress`.

use std::collections::{BTreeSet, HashMap};

use ckv_common::{CacheError, CacheResult, ServerAddress};

use crate::hash::HashFunction;

/// Immutable routing table for key-addressed operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashTopology {
    ring: Vec<(u32, ServerAddress)>,
    servers: Vec<ServerAddress>,
    num_key_owners: usize,
    hash_function: HashFunction,
    hash_space: u32,
}

impl HashTopology {
    /// Builds a topology from server -> hash codes as pushed by the cluster.
    ///
    /// Codes are reduced modulo `hash_space`. A server may own several codes
    /// (virtual nodes).
    ///
    /// # Errors
    /// `CacheError::InvalidTopology` for a zero hash space, zero key owners, or
    /// an unknown hash function version.
    pub fn new(
        server_hash_codes: &HashMap<ServerAddress, Vec<u32>>,
        num_key_owners: usize,
        hash_function_version: u8,
        hash_space: u32,
    ) -> CacheResult<Self> {
        let hash_function = HashFunction::from_version(hash_function_version)?;
        if hash_space == 0 {
            return Err(CacheError::InvalidTopology("hash space must be non-zero".into()));
        }
        if num_key_owners == 0 {
            return Err(CacheError::InvalidTopology("num_key_owners must be at least 1".into()));
        }

        let mut ring: Vec<(u32, ServerAddress)> = server_hash_codes
            .iter()
            .flat_map(|(server, codes)| codes.iter().map(move |code| (code % hash_space, server.clone())))
            .collect();
        ring.sort();
        ring.dedup();

        let servers: BTreeSet<ServerAddress> = ring.iter().map(|(_, server)| server.clone()).collect();

        Ok(HashTopology {
            ring,
            servers: servers.into_iter().collect(),
            num_key_owners,
            hash_function,
            hash_space,
        })
    }

    /// Builds a topology locally by hashing `"host:port#i"` for each of
    /// `vnodes` virtual nodes per server.
    pub fn with_virtual_nodes(
        servers: &[ServerAddress],
        vnodes: usize,
        num_key_owners: usize,
        hash_function_version: u8,
        hash_space: u32,
    ) -> CacheResult<Self> {
        let hash_function = HashFunction::from_version(hash_function_version)?;
        let codes: HashMap<ServerAddress, Vec<u32>> = servers
            .iter()
            .map(|server| {
                let codes = (0..vnodes.max(1))
                    .map(|i| hash_function.hash(format!("{}#{}", server, i).as_bytes()))
                    .collect();
                (server.clone(), codes)
            })
            .collect();
        Self::new(&codes, num_key_owners, hash_function_version, hash_space)
    }

    pub fn num_key_owners(&self) -> usize {
        self.num_key_owners
    }

    pub fn hash_function(&self) -> HashFunction {
        self.hash_function
    }

    pub fn hash_function_version(&self) -> u8 {
        self.hash_function.version()
    }

    pub fn hash_space(&self) -> u32 {
        self.hash_space
    }

    /// Distinct servers present on the ring, sorted.
    pub fn servers(&self) -> &[ServerAddress] {
        &self.servers
    }

    /// Number of ring entries (virtual nodes included).
    pub fn ring_len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

/// Key -> owner resolution over a `HashTopology`.
pub struct ConsistentHashRouter;

impl ConsistentHashRouter {
    /// Position of `key` in the topology's hash space.
    pub fn position(key: &[u8], topology: &HashTopology) -> u32 {
        topology.hash_function.hash(key) % topology.hash_space
    }

    /// Returns up to `num_key_owners` distinct owners of `key`, primary first.
    ///
    /// Empty only when the ring is empty.
    pub fn locate(key: &[u8], topology: &HashTopology) -> Vec<ServerAddress> {
        let ring = &topology.ring;
        if ring.is_empty() {
            return Vec::new();
        }

        let position = Self::position(key, topology);
        let start = ring.partition_point(|(code, _)| *code < position) % ring.len();
        let wanted = topology.num_key_owners.min(topology.servers.len());

        let mut owners: Vec<ServerAddress> = Vec::with_capacity(wanted);
        for step in 0..ring.len() {
            let (_, server) = &ring[(start + step) % ring.len()];
            if !owners.contains(server) {
                owners.push(server.clone());
                if owners.len() == wanted {
                    break;
                }
            }
        }
        owners
    }

    /// First owner of `key`, if the ring has any entry.
    pub fn primary_owner(key: &[u8], topology: &HashTopology) -> Option<ServerAddress> {
        let ring = &topology.ring;
        if ring.is_empty() {
            return None;
        }
        let position = Self::position(key, topology);
        let start = ring.partition_point(|(code, _)| *code < position) % ring.len();
        Some(ring[start].1.clone())
    }
}
