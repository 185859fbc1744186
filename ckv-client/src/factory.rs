//! # Transport Factory
//!
//! Purpose: Hand out transports to the right server for every operation, and
//! keep the per-server pools in step with the cluster topology.
//!
//! ## Design Principles
//! 1. **Explicit Ownership**: The factory is an ordinary value (usually behind an
//!    `Arc`); connector and balancer are injected, nothing is global.
//! 2. **Lazy Pools**: Initial servers get an empty pool on `start`; servers added
//!    later get one on their first lease. Pools are drained when their server
//!    leaves the topology.
//! 3. **Local Recovery**: Failed connects move on to the next candidate; errors
//!    reach the caller only when no candidate is left. Exhausted pools are
//!    reported immediately.
//!
//! ## Lease Path
//!
//! ```text
//! get_transport_for_key(key)
//!   ├── key routing on + hash topology active
//!   │     └── owners = locate(key) ∩ server set ── pool(owner).acquire()
//!   └── otherwise / no reachable owner
//!         └── balancer.next_server() ── walk the snapshot from that pick,
//!             each server not yet tried once ── pool(server).acquire()
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use ckv_common::{CacheError, CacheResult, ServerAddress, TopologyId};

use crate::balancer::{RequestBalancingStrategy, RoundRobinBalancer};
use crate::config::FactoryConfig;
use crate::pool::{ConnectionPool, LeasedTransport, PoolStats};
use crate::router::{ConsistentHashRouter, HashTopology};
use crate::topology::{ServerDiff, TopologyChange, TopologyManager, TopologyUpdate};
use crate::transport::{Connector, TcpConnector};

enum Lifecycle {
    Created,
    Started(Arc<FactoryConfig>),
    Closed,
}

/// Creates, routes and recycles transports for one cluster.
pub struct TransportFactory {
    connector: Arc<dyn Connector>,
    topology: TopologyManager,
    pools: RwLock<HashMap<ServerAddress, ConnectionPool>>,
    lifecycle: RwLock<Lifecycle>,
}

impl TransportFactory {
    /// Creates an unstarted factory with injected collaborators.
    pub fn new(connector: Arc<dyn Connector>, balancer: Box<dyn RequestBalancingStrategy>) -> Self {
        TransportFactory {
            connector,
            topology: TopologyManager::new(balancer),
            pools: RwLock::new(HashMap::new()),
            lifecycle: RwLock::new(Lifecycle::Created),
        }
    }

    /// Round-robin factory over the given connector.
    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self::new(connector, Box::new(RoundRobinBalancer::new()))
    }

    /// Round-robin factory opening plain TCP transports.
    pub fn tcp() -> Self {
        Self::with_connector(Arc::new(TcpConnector))
    }

    /// Starts the factory with its baseline server set and topology id.
    ///
    /// When `initial_servers` is empty, `config.servers` is used.
    ///
    /// # Errors
    /// - `CacheError::Config` when the configuration is invalid.
    /// - `CacheError::AlreadyStarted` on any call after the first.
    pub fn start(
        &self,
        config: FactoryConfig,
        initial_servers: Vec<ServerAddress>,
        topology_id: TopologyId,
    ) -> CacheResult<()> {
        let mut lifecycle = self.lifecycle.write();
        if !matches!(*lifecycle, Lifecycle::Created) {
            return Err(CacheError::AlreadyStarted);
        }
        config.validate()?;

        let servers = if initial_servers.is_empty() {
            config.servers.clone()
        } else {
            initial_servers
        };
        self.topology.reset(servers, topology_id);
        let snapshot = self.topology.snapshot();
        {
            // Empty pools; transports are still opened on first acquire.
            let mut pools = self.pools.write();
            for server in snapshot.servers() {
                pools
                    .entry(server.clone())
                    .or_insert_with(|| ConnectionPool::new(config.pool_config(server.clone()), self.connector.clone()));
            }
        }
        info!(
            servers = snapshot.servers().len(),
            topology_id = %topology_id,
            key_aware_routing = config.key_aware_routing,
            "transport factory started"
        );
        *lifecycle = Lifecycle::Started(Arc::new(config));
        Ok(())
    }

    /// Lifecycle alias for `destroy`; a no-op before `start`.
    pub fn stop(&self) {
        self.destroy();
    }

    /// Drains every pool; later `get_transport*` calls fail with `FactoryClosed`.
    pub fn destroy(&self) {
        {
            let mut lifecycle = self.lifecycle.write();
            match *lifecycle {
                Lifecycle::Created => {
                    debug!("stop before start ignored");
                    return;
                }
                Lifecycle::Closed => return,
                Lifecycle::Started(_) => *lifecycle = Lifecycle::Closed,
            }
        }

        let pools: Vec<ConnectionPool> = self.pools.write().drain().map(|(_, pool)| pool).collect();
        for pool in &pools {
            pool.drain();
        }
        info!(pools = pools.len(), "transport factory destroyed");
    }

    pub fn is_started(&self) -> bool {
        matches!(*self.lifecycle.read(), Lifecycle::Started(_))
    }

    fn started_config(&self) -> CacheResult<Arc<FactoryConfig>> {
        match &*self.lifecycle.read() {
            Lifecycle::Created => Err(CacheError::NotStarted),
            Lifecycle::Started(config) => Ok(config.clone()),
            Lifecycle::Closed => Err(CacheError::FactoryClosed),
        }
    }

    /// Leases a transport to a balancer-selected server.
    ///
    /// # Errors
    /// - `CacheError::NoAvailableServer` when the server set is empty.
    /// - `CacheError::PoolExhausted` when the selected pool stayed full.
    /// - The last connect error when every server failed.
    pub fn get_transport(&self) -> CacheResult<LeasedTransport> {
        let config = self.started_config()?;
        self.lease_balanced(&config, HashSet::new(), None)
    }

    /// Leases a transport to the owner of `key`.
    ///
    /// Tries the owners in ring order and falls back to the balancer when
    /// key routing is off, no hash topology is active, or none of the owners
    /// is in the current server set.
    pub fn get_transport_for_key(&self, key: &[u8]) -> CacheResult<LeasedTransport> {
        let config = self.started_config()?;
        let mut tried = HashSet::new();
        let mut last_err = None;
        if config.key_aware_routing {
            let snapshot = self.topology.snapshot();
            if let Some(hash) = snapshot.hash_topology() {
                let owners = ConsistentHashRouter::locate(key, hash);
                for owner in owners.iter().filter(|owner| snapshot.contains(owner)) {
                    tried.insert(owner.clone());
                    match self.lease_from(&config, owner) {
                        Ok(lease) => return Ok(lease),
                        Err(err) if err.is_retryable() => {
                            warn!(server = %owner, error = %err, "key owner unavailable");
                            last_err = Some(err);
                        }
                        Err(err) => return Err(err),
                    }
                }
                trace!(owners = owners.len(), "no reachable key owner, using balancer");
            }
        }
        self.lease_balanced(&config, tried, last_err)
    }

    /// Starts at the balancer's pick and walks the rest of the same snapshot,
    /// trying each server not in `tried` once.
    fn lease_balanced(
        &self,
        config: &FactoryConfig,
        mut tried: HashSet<ServerAddress>,
        mut last_err: Option<CacheError>,
    ) -> CacheResult<LeasedTransport> {
        let (snapshot, first) = self.topology.select_server()?;
        let servers = snapshot.servers();
        let start = servers.binary_search(&first).unwrap_or(0);

        for step in 0..servers.len() {
            let server = &servers[(start + step) % servers.len()];
            if !tried.insert(server.clone()) {
                continue;
            }
            match self.lease_from(config, server) {
                Ok(lease) => return Ok(lease),
                Err(err) if err.is_retryable() => {
                    warn!(server = %server, error = %err, "server unavailable, trying next");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or(CacheError::NoAvailableServer))
    }

    fn lease_from(&self, config: &FactoryConfig, server: &ServerAddress) -> CacheResult<LeasedTransport> {
        self.pool_for(config, server)?.acquire()
    }

    fn pool_for(&self, config: &FactoryConfig, server: &ServerAddress) -> CacheResult<ConnectionPool> {
        if let Some(pool) = self.pools.read().get(server) {
            return Ok(pool.clone());
        }

        let mut pools = self.pools.write();
        if let Some(pool) = pools.get(server) {
            return Ok(pool.clone());
        }
        // Checked under the pools lock so destroy/retire cannot miss a new pool.
        if matches!(*self.lifecycle.read(), Lifecycle::Closed) {
            return Err(CacheError::FactoryClosed);
        }
        if !self.topology.snapshot().contains(server) {
            return Err(CacheError::PoolClosed(server.clone()));
        }

        let pool = ConnectionPool::new(config.pool_config(server.clone()), self.connector.clone());
        pools.insert(server.clone(), pool.clone());
        debug!(server = %server, "created connection pool");
        Ok(pool)
    }

    /// Returns a lease to its pool; failed leases are destroyed.
    pub fn release_transport(&self, lease: LeasedTransport) {
        trace!(server = %lease.server(), id = lease.id(), healthy = lease.is_healthy(), "releasing transport");
        drop(lease);
    }

    /// Replaces the server set; pools of removed servers are drained.
    pub fn update_servers(&self, servers: Vec<ServerAddress>) -> CacheResult<ServerDiff> {
        self.started_config()?;
        let diff = self.topology.replace_servers(servers);
        self.retire(&diff.removed);
        Ok(diff)
    }

    /// Swaps in a new hash topology if `topology_id` supersedes the active one.
    ///
    /// The server set is left unchanged.
    pub fn update_hash_function(
        &self,
        topology_id: TopologyId,
        server_hash_codes: &HashMap<ServerAddress, Vec<u32>>,
        num_key_owners: usize,
        hash_function_version: u8,
        hash_space: u32,
    ) -> CacheResult<TopologyChange> {
        self.started_config()?;
        let hash = HashTopology::new(server_hash_codes, num_key_owners, hash_function_version, hash_space)?;
        Ok(self.topology.replace_hash_topology(topology_id, hash))
    }

    /// Entry point for topology notifications from the cluster.
    pub fn on_topology_changed(&self, update: &TopologyUpdate) -> CacheResult<TopologyChange> {
        self.started_config()?;
        let change = self.topology.apply(update)?;
        if let TopologyChange::Applied(diff) = &change {
            self.retire(&diff.removed);
        }
        Ok(change)
    }

    fn retire(&self, removed: &[ServerAddress]) {
        if removed.is_empty() {
            return;
        }
        let retired: Vec<ConnectionPool> = {
            let mut pools = self.pools.write();
            removed.iter().filter_map(|server| pools.remove(server)).collect()
        };
        for pool in retired {
            pool.drain();
        }
    }

    /// Closes idle transports older than `max_idle_time_ms` across all pools.
    pub fn evict_idle(&self) -> usize {
        let max_idle_time = match self.started_config().ok().and_then(|c| c.max_idle_time()) {
            Some(duration) => duration,
            None => return 0,
        };
        let pools: Vec<ConnectionPool> = self.pools.read().values().cloned().collect();
        pools.iter().map(|pool| pool.evict_idle(max_idle_time)).sum()
    }

    /// Current server set.
    pub fn servers(&self) -> Vec<ServerAddress> {
        self.topology.snapshot().servers().to_vec()
    }

    pub fn topology_id(&self) -> TopologyId {
        self.topology.active_id()
    }

    pub fn hash_topology(&self) -> Option<Arc<HashTopology>> {
        self.topology.snapshot().hash_topology().cloned()
    }

    /// Accounting for a server's pool, if one has been created.
    pub fn pool_stats(&self, server: &ServerAddress) -> Option<PoolStats> {
        self.pools.read().get(server).map(ConnectionPool::stats)
    }

    /// Servers that currently have a pool.
    pub fn pooled_servers(&self) -> Vec<ServerAddress> {
        let mut servers: Vec<ServerAddress> = self.pools.read().keys().cloned().collect();
        servers.sort();
        servers
    }
}
