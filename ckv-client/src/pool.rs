//! # Connection Pool
//!
//! Purpose: Keep a bounded set of reusable transports per server and hand
//! each one to at most one caller at a time.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Transports are reused; new ones are opened on demand
//!    up to `max_total`.
//! 2. **Minimal Locking**: The mutex guards only bookkeeping; connects and closes
//!    happen outside it.
//! 3. **Bounded Waiting**: A full pool parks callers on a condvar until a slot frees
//!    up or `acquire_timeout` expires.
//! 4. **RAII Leases**: `LeasedTransport` returns itself on drop, so an early return
//!    in caller code can never leak a slot.
//!
//! ## Transport Lifecycle
//!
//! ```text
//!            acquire()               release(healthy)
//!   (new) ─────────────> LEASED ─────────────────────> IDLE ──┐
//!                          │  ▲                                │
//!                          │  └──────── acquire() ─────────────┘
//!                          │ release(failed) / pool closed
//!                          ▼
//!                      DESTROYED
//! ```

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use ckv_common::{CacheError, CacheResult, ServerAddress};

use crate::config::PoolConfig;
use crate::resp::{encode_command, read_response, RespValue};
use crate::transport::{Connector, Transport};

/// Point-in-time view of a pool's accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub leased: usize,
    /// Idle + leased (+ connects in progress).
    pub total: usize,
    pub closed: bool,
}

/// Transport plus the scratch buffers reused by every request on it.
struct PooledTransport {
    id: u64,
    transport: Box<dyn Transport>,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
}

impl PooledTransport {
    fn new(id: u64, transport: Box<dyn Transport>) -> Self {
        PooledTransport {
            id,
            transport,
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
        }
    }

    fn exec(&mut self, args: &[&[u8]]) -> CacheResult<RespValue> {
        self.write_buf.clear();
        encode_command(args, &mut self.write_buf);
        self.transport.write_all(&self.write_buf)?;
        self.transport.flush()?;
        read_response(&mut *self.transport, &mut self.line_buf)
    }

    fn destroy(mut self) {
        self.transport.close();
        trace!(server = %self.transport.server(), id = self.id, "destroyed transport");
    }
}

struct IdleTransport {
    transport: PooledTransport,
    since: Instant,
}

struct PoolState {
    // Oldest at the front; acquire takes from the back so hot transports stay hot.
    idle: VecDeque<IdleTransport>,
    leased: usize,
    total: usize,
    closed: bool,
    next_id: u64,
}

struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Pool of transports to a single server.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates an empty pool; transports are opened lazily by `acquire`.
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        let state = PoolState {
            idle: VecDeque::with_capacity(config.max_idle),
            leased: 0,
            total: 0,
            closed: false,
            next_id: 1,
        };
        ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                connector,
                state: Mutex::new(state),
                available: Condvar::new(),
            }),
        }
    }

    /// Server every transport of this pool is connected to.
    pub fn server(&self) -> &ServerAddress {
        &self.inner.config.server
    }

    /// Leases a transport.
    ///
    /// Reuses an idle transport when possible, opens a new one while the pool
    /// is below `max_total`, and otherwise waits up to `acquire_timeout`.
    ///
    /// # Errors
    /// - `CacheError::PoolExhausted` when no slot freed up in time.
    /// - `CacheError::PoolClosed` once the pool has been drained.
    /// - Connector errors when opening a new transport fails.
    pub fn acquire(&self) -> CacheResult<LeasedTransport> {
        let config = &self.inner.config;
        let started = Instant::now();
        let deadline = started + config.acquire_timeout;
        let mut state = self.inner.state.lock();

        loop {
            if state.closed {
                return Err(CacheError::PoolClosed(config.server.clone()));
            }

            if let Some(idle) = state.idle.pop_back() {
                state.leased += 1;
                return Ok(LeasedTransport::new(self.clone(), idle.transport));
            }

            if state.total < config.max_total {
                // Reserve the slot before connecting so concurrent callers see it.
                state.total += 1;
                state.leased += 1;
                let id = state.next_id;
                state.next_id += 1;
                drop(state);
                return self.open(id);
            }

            if Instant::now() >= deadline {
                debug!(server = %config.server, max_total = config.max_total, "pool exhausted");
                return Err(CacheError::PoolExhausted {
                    server: config.server.clone(),
                    waited: started.elapsed(),
                });
            }

            self.inner.available.wait_until(&mut state, deadline);
        }
    }

    fn open(&self, id: u64) -> CacheResult<LeasedTransport> {
        match self.inner.connector.connect(&self.inner.config) {
            Ok(transport) => {
                trace!(server = %self.server(), id, "opened pooled transport");
                Ok(LeasedTransport::new(self.clone(), PooledTransport::new(id, transport)))
            }
            Err(err) => {
                {
                    let mut state = self.inner.state.lock();
                    state.total = state.total.saturating_sub(1);
                    state.leased = state.leased.saturating_sub(1);
                }
                self.inner.available.notify_one();
                warn!(server = %self.server(), error = %err, "failed to open transport");
                Err(err)
            }
        }
    }

    /// Returns a lease to its origin pool, destroying it when `healthy` is false.
    pub fn release(&self, mut lease: LeasedTransport, healthy: bool) {
        if !healthy {
            lease.mark_failed();
        }
        drop(lease);
    }

    fn return_transport(&self, transport: PooledTransport, healthy: bool) {
        let doomed = {
            let mut state = self.inner.state.lock();
            state.leased = state.leased.saturating_sub(1);
            if healthy && !state.closed && state.idle.len() < self.inner.config.max_idle {
                state.idle.push_back(IdleTransport {
                    transport,
                    since: Instant::now(),
                });
                None
            } else {
                state.total = state.total.saturating_sub(1);
                Some(transport)
            }
        };
        self.inner.available.notify_one();

        if let Some(transport) = doomed {
            if !healthy {
                debug!(server = %self.server(), id = transport.id, "discarding failed transport");
            }
            transport.destroy();
        }
    }

    /// Closes the pool: idle transports are destroyed now, leased ones when
    /// they come back, and every waiter is woken with `PoolClosed`.
    pub fn drain(&self) {
        let (idle, leased) = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            let idle: Vec<IdleTransport> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(idle.len());
            (idle, state.leased)
        };
        self.inner.available.notify_all();

        info!(server = %self.server(), destroyed = idle.len(), leased, "drained connection pool");
        for entry in idle {
            entry.transport.destroy();
        }
    }

    /// Destroys idle transports unused for longer than `max_idle_time`.
    ///
    /// Returns how many were destroyed.
    pub fn evict_idle(&self, max_idle_time: Duration) -> usize {
        let now = Instant::now();
        let expired = {
            let mut state = self.inner.state.lock();
            let mut expired = Vec::new();
            while let Some(front) = state.idle.front() {
                if now.duration_since(front.since) <= max_idle_time {
                    break;
                }
                if let Some(entry) = state.idle.pop_front() {
                    expired.push(entry.transport);
                }
            }
            state.total = state.total.saturating_sub(expired.len());
            expired
        };

        let count = expired.len();
        if count > 0 {
            self.inner.available.notify_all();
            debug!(server = %self.server(), count, "evicted idle transports");
        }
        for transport in expired {
            transport.destroy();
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            idle: state.idle.len(),
            leased: state.leased,
            total: state.total,
            closed: state.closed,
        }
    }
}

/// RAII lease on a pooled transport.
///
/// Dropping the lease returns the transport to its pool, or destroys it when
/// it was marked failed.
pub struct LeasedTransport {
    pool: ConnectionPool,
    // `Some` for the whole life of the lease; only `Drop` takes it.
    transport: Option<PooledTransport>,
    healthy: bool,
}

impl LeasedTransport {
    fn new(pool: ConnectionPool, transport: PooledTransport) -> Self {
        LeasedTransport {
            pool,
            transport: Some(transport),
            healthy: true,
        }
    }

    // Never `None` here: the lease is only reachable before `Drop` runs.
    fn pooled(&mut self) -> &mut PooledTransport {
        self.transport.as_mut().expect("transport present until drop")
    }

    /// Pool-unique id of the underlying transport.
    pub fn id(&self) -> u64 {
        self.transport.as_ref().map(|t| t.id).unwrap_or_default()
    }

    pub fn server(&self) -> &ServerAddress {
        self.pool.server()
    }

    /// Prevents the transport from going back to the pool.
    pub fn mark_failed(&mut self) {
        self.healthy = false;
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Raw byte stream, for callers that do their own framing.
    pub fn transport(&mut self) -> &mut dyn Transport {
        &mut *self.pooled().transport
    }

    /// Sends one RESP2 command and reads its reply.
    ///
    /// I/O and framing failures mark the lease failed.
    pub fn exec(&mut self, args: &[&[u8]]) -> CacheResult<RespValue> {
        let result = self.pooled().exec(args);
        if let Err(err) = &result {
            if err.is_transport_failure() {
                self.healthy = false;
            }
        }
        result
    }
}

impl Drop for LeasedTransport {
    fn drop(&mut self) {
        if let Some(transport) = self.transport.take() {
            self.pool.return_transport(transport, self.healthy);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnector;
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::thread;

    fn pool_with(max_total: usize, timeout: Duration) -> (ConnectionPool, MockConnector) {
        let connector = MockConnector::new();
        let mut config = PoolConfig::for_server(ServerAddress::new("a", 1));
        config.max_total = max_total;
        config.max_idle = max_total;
        config.acquire_timeout = timeout;
        (ConnectionPool::new(config, Arc::new(connector.clone())), connector)
    }

    #[test]
    fn reuses_idle_transport() {
        let (pool, connector) = pool_with(2, Duration::ZERO);
        let first = pool.acquire().unwrap();
        let id = first.id();
        drop(first);

        let second = pool.acquire().unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(connector.connects(&ServerAddress::new("a", 1)), 1);
    }

    #[test]
    fn failed_lease_is_destroyed() {
        let (pool, connector) = pool_with(2, Duration::ZERO);
        let lease = pool.acquire().unwrap();
        pool.release(lease, false);

        assert_eq!(
            pool.stats(),
            PoolStats { idle: 0, leased: 0, total: 0, closed: false }
        );
        assert_eq!(connector.closed(), 1);
    }

    #[test]
    fn exhausted_pool_times_out() {
        let (pool, _) = pool_with(1, Duration::from_millis(50));
        let _held = pool.acquire().unwrap();

        let started = Instant::now();
        let err = pool.acquire().err().expect("second acquire must fail");
        assert!(matches!(err, CacheError::PoolExhausted { .. }));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn waiter_gets_released_transport() {
        let (pool, _) = pool_with(1, Duration::from_secs(5));
        let held = pool.acquire().unwrap();
        let id = held.id();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire().map(|lease| lease.id()))
        };
        thread::sleep(Duration::from_millis(20));
        drop(held);

        assert_eq!(waiter.join().unwrap().unwrap(), id);
    }

    #[test]
    fn drain_closes_idle_and_returning_transports() {
        let (pool, connector) = pool_with(2, Duration::ZERO);
        let held = pool.acquire().unwrap();
        drop(pool.acquire().unwrap());
        assert_eq!(pool.stats().idle, 1);

        pool.drain();
        assert_eq!(connector.closed(), 1);
        assert!(matches!(pool.acquire(), Err(CacheError::PoolClosed(_))));

        drop(held);
        assert_eq!(connector.closed(), 2);
        assert_eq!(
            pool.stats(),
            PoolStats { idle: 0, leased: 0, total: 0, closed: true }
        );
    }

    #[test]
    fn drain_wakes_waiters() {
        let (pool, _) = pool_with(1, Duration::from_secs(5));
        let _held = pool.acquire().unwrap();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire().err())
        };
        thread::sleep(Duration::from_millis(20));
        pool.drain();

        let err = waiter.join().unwrap().expect("waiter must fail");
        assert!(matches!(err, CacheError::PoolClosed(_)));
    }

    #[test]
    fn connect_failure_frees_slot() {
        let (pool, connector) = pool_with(1, Duration::ZERO);
        connector.fail(ServerAddress::new("a", 1));
        assert!(pool.acquire().is_err());
        assert_eq!(pool.stats().total, 0);

        connector.recover(&ServerAddress::new("a", 1));
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn evicts_only_expired_idle() {
        let (pool, connector) = pool_with(2, Duration::ZERO);
        drop(pool.acquire().unwrap());
        thread::sleep(Duration::from_millis(30));

        assert_eq!(pool.evict_idle(Duration::from_secs(60)), 0);
        assert_eq!(pool.evict_idle(Duration::from_millis(10)), 1);
        assert_eq!(pool.stats().total, 0);
        assert_eq!(connector.closed(), 1);
    }

    #[test]
    fn exec_failure_marks_lease_failed() {
        let (pool, connector) = pool_with(1, Duration::ZERO);
        connector.set_script(b"+PONG\r\n".to_vec());

        let mut lease = pool.acquire().unwrap();
        assert_eq!(lease.exec(&[b"PING"]).unwrap(), RespValue::Simple(b"PONG".to_vec()));
        assert!(lease.is_healthy());
        // Script exhausted: the next read hits EOF.
        assert!(lease.exec(&[b"PING"]).is_err());
        assert!(!lease.is_healthy());
        drop(lease);

        assert_eq!(pool.stats().total, 0);
        assert_eq!(connector.written(&ServerAddress::new("a", 1)), b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n".to_vec());
    }

    #[test]
    fn lease_stays_usable_until_released() {
        let (pool, connector) = pool_with(1, Duration::ZERO);
        connector.set_script(b"+A\r\n+B\r\n".to_vec());

        let mut lease = pool.acquire().unwrap();
        let id = lease.id();
        assert_eq!(lease.exec(&[b"PING"]).unwrap(), RespValue::Simple(b"A".to_vec()));
        lease.transport().write_all(b"raw").unwrap();
        assert_eq!(lease.exec(&[b"PING"]).unwrap(), RespValue::Simple(b"B".to_vec()));
        assert_eq!(lease.id(), id);
        assert_eq!(lease.server(), &ServerAddress::new("a", 1));
        pool.release(lease, true);

        assert_eq!(pool.stats(), PoolStats { idle: 1, leased: 0, total: 1, closed: false });
        assert_eq!(pool.acquire().unwrap().id(), id);
    }

    #[test]
    fn concurrent_acquire_never_shares_a_transport() {
        const THREADS: usize = 8;
        let (pool, _) = pool_with(3, Duration::from_secs(5));
        let barrier = Arc::new(Barrier::new(THREADS));
        let in_use = Arc::new(Mutex::new(HashSet::new()));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let pool = pool.clone();
                let barrier = barrier.clone();
                let in_use = in_use.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..50 {
                        let lease = pool.acquire().unwrap();
                        assert!(in_use.lock().insert(lease.id()), "transport leased twice");
                        thread::yield_now();
                        assert!(in_use.lock().remove(&lease.id()));
                        drop(lease);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.leased, 0);
        assert!(stats.total <= 3);
    }
}
