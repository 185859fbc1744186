//! # Request Balancing
//!
//! Picks the server for operations that carry no routing key, or whose key
//! has no known owner yet.

use parking_lot::Mutex;

use ckv_common::{CacheError, CacheResult, ServerAddress};

/// Server selection for non-key-addressed operations.
pub trait RequestBalancingStrategy: Send + Sync {
    /// Replaces the candidate list.
    fn set_servers(&self, servers: &[ServerAddress]);

    /// Returns the next candidate.
    ///
    /// # Errors
    /// `CacheError::NoServersConfigured` when the candidate list is empty.
    fn next_server(&self) -> CacheResult<ServerAddress>;
}

struct RoundRobinState {
    servers: Vec<ServerAddress>,
    cursor: usize,
}

/// Round-robin over the current server list.
///
/// The cursor lives under the same lock as the list, so every call advances
/// it exactly once and a shrinking list can never be indexed out of range.
pub struct RoundRobinBalancer {
    state: Mutex<RoundRobinState>,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        RoundRobinBalancer {
            state: Mutex::new(RoundRobinState {
                servers: Vec::new(),
                cursor: 0,
            }),
        }
    }

    pub fn servers(&self) -> Vec<ServerAddress> {
        self.state.lock().servers.clone()
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestBalancingStrategy for RoundRobinBalancer {
    fn set_servers(&self, servers: &[ServerAddress]) {
        let mut state = self.state.lock();
        state.servers = servers.to_vec();
        state.cursor = 0;
    }

    fn next_server(&self) -> CacheResult<ServerAddress> {
        let mut state = self.state.lock();
        if state.servers.is_empty() {
            return Err(CacheError::NoServersConfigured);
        }
        let idx = state.cursor % state.servers.len();
        state.cursor = (idx + 1) % state.servers.len();
        Ok(state.servers[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn servers(n: usize) -> Vec<ServerAddress> {
        (0..n).map(|i| ServerAddress::new("node", 7000 + i as u16)).collect()
    }

    #[test]
    fn empty_list_fails() {
        let balancer = RoundRobinBalancer::new();
        assert!(matches!(balancer.next_server(), Err(CacheError::NoServersConfigured)));
    }

    #[test]
    fn rotates_in_order_and_wraps() {
        let balancer = RoundRobinBalancer::new();
        let list = servers(3);
        balancer.set_servers(&list);
        let picked: Vec<_> = (0..4).map(|_| balancer.next_server().unwrap()).collect();
        assert_eq!(picked, vec![list[0].clone(), list[1].clone(), list[2].clone(), list[0].clone()]);
    }

    #[test]
    fn set_servers_resets_cursor_after_shrink() {
        let balancer = RoundRobinBalancer::new();
        balancer.set_servers(&servers(5));
        for _ in 0..4 {
            balancer.next_server().unwrap();
        }
        let shrunk = servers(2);
        balancer.set_servers(&shrunk);
        assert_eq!(balancer.next_server().unwrap(), shrunk[0]);
    }

    #[test]
    fn concurrent_callers_split_rotation_evenly() {
        const THREADS: usize = 4;
        const CALLS: usize = 300;
        let balancer = Arc::new(RoundRobinBalancer::new());
        let list = servers(3);
        balancer.set_servers(&list);

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let balancer = balancer.clone();
                thread::spawn(move || {
                    (0..CALLS).map(|_| balancer.next_server().unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut counts = std::collections::HashMap::new();
        for handle in handles {
            for server in handle.join().unwrap() {
                *counts.entry(server).or_insert(0usize) += 1;
            }
        }
        // Each step hands out one index exactly once, so the split is exact.
        for server in &list {
            assert_eq!(counts[server], THREADS * CALLS / list.len());
        }
    }

    proptest! {
        #[test]
        fn full_rotation_visits_every_server_once(n in 1usize..32, warmup in 0usize..64) {
            let balancer = RoundRobinBalancer::new();
            let list = servers(n);
            balancer.set_servers(&list);
            for _ in 0..warmup {
                balancer.next_server().unwrap();
            }
            let seen: HashSet<_> = (0..n).map(|_| balancer.next_server().unwrap()).collect();
            prop_assert_eq!(seen.len(), n);
        }
    }
}
