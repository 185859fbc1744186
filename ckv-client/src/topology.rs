//! # Topology Manager
//!
//! Purpose: Own the routing state (server set, hash topology, active topology
//! id) and replace it atomically when the cluster announces a change.
//!
//! ## Design Principles
//! 1. **Snapshot Swap**: Readers clone an `Arc<RoutingSnapshot>` under a short read
//!    lock and keep using it after the lock is gone; writers build a complete new
//!    snapshot and swap the `Arc`. Nobody ever observes a half-applied update.
//! 2. **Last Writer By Id**: An update is applied only when its id is strictly
//!    greater than the active one, so arrival order does not matter.
//! 3. **Balancer In Lockstep**: The balancer's candidate list is replaced under the
//!    same write lock as the snapshot, and picks are made under the read lock, so a
//!    pick always belongs to the snapshot handed out with it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use ckv_common::{CacheError, CacheResult, ServerAddress, TopologyId};

use crate::balancer::RequestBalancingStrategy;
use crate::router::HashTopology;

/// Topology change pushed by the cluster.
///
/// The server set of the new topology is the key set of `server_hash_codes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyUpdate {
    pub topology_id: TopologyId,
    pub server_hash_codes: HashMap<ServerAddress, Vec<u32>>,
    pub num_key_owners: usize,
    pub hash_function_version: u8,
    pub hash_space: u32,
}

/// Immutable routing state shared with readers.
#[derive(Debug, Clone, Default)]
pub struct RoutingSnapshot {
    topology_id: TopologyId,
    // Sorted and de-duplicated.
    servers: Vec<ServerAddress>,
    hash: Option<Arc<HashTopology>>,
}

impl RoutingSnapshot {
    fn new(topology_id: TopologyId, servers: Vec<ServerAddress>, hash: Option<Arc<HashTopology>>) -> Self {
        RoutingSnapshot {
            topology_id,
            servers: normalize(servers),
            hash,
        }
    }

    pub fn topology_id(&self) -> TopologyId {
        self.topology_id
    }

    pub fn servers(&self) -> &[ServerAddress] {
        &self.servers
    }

    pub fn hash_topology(&self) -> Option<&Arc<HashTopology>> {
        self.hash.as_ref()
    }

    pub fn contains(&self, server: &ServerAddress) -> bool {
        self.servers.binary_search(server).is_ok()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

/// Servers that joined and left in one server-set replacement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerDiff {
    pub added: Vec<ServerAddress>,
    pub removed: Vec<ServerAddress>,
}

impl ServerDiff {
    fn between(old: &[ServerAddress], new: &[ServerAddress]) -> Self {
        let old_set: BTreeSet<&ServerAddress> = old.iter().collect();
        let new_set: BTreeSet<&ServerAddress> = new.iter().collect();
        ServerDiff {
            added: new_set.difference(&old_set).map(|s| (*s).clone()).collect(),
            removed: old_set.difference(&new_set).map(|s| (*s).clone()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Outcome of a versioned update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyChange {
    /// The update became the active topology.
    Applied(ServerDiff),
    /// The update was not newer than the active topology and was dropped.
    Stale { active: TopologyId, received: TopologyId },
}

impl TopologyChange {
    pub fn is_applied(&self) -> bool {
        matches!(self, TopologyChange::Applied(_))
    }
}

/// Owner of the routing snapshot and the balancing strategy.
pub struct TopologyManager {
    routing: RwLock<Arc<RoutingSnapshot>>,
    balancer: Box<dyn RequestBalancingStrategy>,
}

impl TopologyManager {
    pub fn new(balancer: Box<dyn RequestBalancingStrategy>) -> Self {
        balancer.set_servers(&[]);
        TopologyManager {
            routing: RwLock::new(Arc::new(RoutingSnapshot::default())),
            balancer,
        }
    }

    /// Current snapshot; stays valid for as long as the caller holds it.
    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.routing.read().clone()
    }

    pub fn active_id(&self) -> TopologyId {
        self.routing.read().topology_id
    }

    /// Installs a baseline without any id check (used on start).
    pub fn reset(&self, servers: Vec<ServerAddress>, topology_id: TopologyId) -> ServerDiff {
        let mut routing = self.routing.write();
        let next = RoutingSnapshot::new(topology_id, servers, None);
        let diff = ServerDiff::between(&routing.servers, &next.servers);
        self.balancer.set_servers(&next.servers);
        *routing = Arc::new(next);
        diff
    }

    /// Picks a server for a non-keyed operation together with the snapshot
    /// the pick was made against.
    ///
    /// # Errors
    /// `CacheError::NoAvailableServer` when the server set is empty.
    pub fn select_server(&self) -> CacheResult<(Arc<RoutingSnapshot>, ServerAddress)> {
        let routing = self.routing.read();
        if routing.is_empty() {
            return Err(CacheError::NoAvailableServer);
        }
        let server = self.balancer.next_server().map_err(|err| match err {
            CacheError::NoServersConfigured => CacheError::NoAvailableServer,
            other => other,
        })?;
        Ok((routing.clone(), server))
    }

    /// Applies a full topology update if it supersedes the active one.
    ///
    /// # Errors
    /// `CacheError::InvalidTopology` when the update cannot be turned into a
    /// hash topology; the active topology is left untouched.
    pub fn apply(&self, update: &TopologyUpdate) -> CacheResult<TopologyChange> {
        let hash = HashTopology::new(
            &update.server_hash_codes,
            update.num_key_owners,
            update.hash_function_version,
            update.hash_space,
        )?;
        let servers: Vec<ServerAddress> = update.server_hash_codes.keys().cloned().collect();

        let mut routing = self.routing.write();
        if !update.topology_id.supersedes(routing.topology_id) {
            debug!(
                active = %routing.topology_id,
                received = %update.topology_id,
                "ignoring stale topology update"
            );
            return Ok(TopologyChange::Stale {
                active: routing.topology_id,
                received: update.topology_id,
            });
        }

        let next = RoutingSnapshot::new(update.topology_id, servers, Some(Arc::new(hash)));
        let diff = ServerDiff::between(&routing.servers, &next.servers);
        self.balancer.set_servers(&next.servers);
        *routing = Arc::new(next);

        info!(
            topology_id = %update.topology_id,
            servers = routing.servers.len(),
            added = diff.added.len(),
            removed = diff.removed.len(),
            num_key_owners = update.num_key_owners,
            hash_function_version = update.hash_function_version,
            "applied topology update"
        );
        Ok(TopologyChange::Applied(diff))
    }

    /// Replaces the server set, keeping the active id and hash topology.
    ///
    /// Hash owners missing from the new set are skipped by key routing.
    pub fn replace_servers(&self, servers: Vec<ServerAddress>) -> ServerDiff {
        let mut routing = self.routing.write();
        let next = RoutingSnapshot::new(routing.topology_id, servers, routing.hash.clone());
        let diff = ServerDiff::between(&routing.servers, &next.servers);
        if diff.is_empty() {
            return diff;
        }
        self.balancer.set_servers(&next.servers);
        *routing = Arc::new(next);

        info!(
            servers = routing.servers.len(),
            added = diff.added.len(),
            removed = diff.removed.len(),
            "replaced server set"
        );
        diff
    }

    /// Replaces only the hash topology, if `topology_id` supersedes the active id.
    pub fn replace_hash_topology(&self, topology_id: TopologyId, hash: HashTopology) -> TopologyChange {
        let mut routing = self.routing.write();
        if !topology_id.supersedes(routing.topology_id) {
            debug!(active = %routing.topology_id, received = %topology_id, "ignoring stale hash topology");
            return TopologyChange::Stale {
                active: routing.topology_id,
                received: topology_id,
            };
        }

        let next = RoutingSnapshot {
            topology_id,
            servers: routing.servers.clone(),
            hash: Some(Arc::new(hash)),
        };
        *routing = Arc::new(next);
        info!(topology_id = %topology_id, "replaced hash topology");
        TopologyChange::Applied(ServerDiff::default())
    }
}

fn normalize(servers: Vec<ServerAddress>) -> Vec<ServerAddress> {
    let set: BTreeSet<ServerAddress> = servers.into_iter().collect();
    set.into_iter().collect()
}
