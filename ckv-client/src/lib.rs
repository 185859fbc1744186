//! # ClusterKV Routing Client
//!
//! Purpose: Route cache operations across a cluster of RESP servers, pooling
//! transports per server and following topology changes pushed by the cluster.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: One bounded pool per server; leases return to
//!    their pool on drop and failed transports are destroyed.
//! 2. **Consistent Hashing**: Keyed operations go to the owner of the key on the
//!    hash ring; everything else is spread round-robin.
//! 3. **Versioned Topology**: Routing state is an immutable snapshot replaced only
//!    by strictly newer topology ids.
//! 4. **Pluggable Edges**: Connector, balancer and marshallers are traits, so the
//!    routing core runs against in-memory transports in tests.

pub mod balancer;
pub mod client;
pub mod config;
pub mod factory;
pub mod hash;
pub mod mock;
pub mod pool;
pub mod resp;
pub mod router;
pub mod topology;
pub mod transport;

pub use balancer::{RequestBalancingStrategy, RoundRobinBalancer};
pub use client::RemoteCache;
pub use config::{FactoryConfig, PoolConfig};
pub use factory::TransportFactory;
pub use hash::HashFunction;
pub use pool::{ConnectionPool, LeasedTransport, PoolStats};
pub use resp::RespValue;
pub use router::{ConsistentHashRouter, HashTopology};
pub use topology::{RoutingSnapshot, ServerDiff, TopologyChange, TopologyManager, TopologyUpdate};
pub use transport::{Connector, TcpConnector, TcpTransport, Transport};

pub use ckv_common::{CacheError, CacheResult, Marshaller, ServerAddress, TopologyId};
