//! Sticky-routing worker pool: a supervisor that distributes per-user
//! requests across a fixed-size fleet of sandboxed child processes,
//! guaranteeing that a given user is served by the same worker for as long
//! as that worker is healthy.

pub mod config;
pub mod errors;
pub mod gateway;
pub mod hash_ring;
pub mod http;
pub mod ipc;
pub mod logging;
pub mod metrics;
pub mod router;
pub mod sandbox;
pub mod supervisor;
pub mod worker;

pub use config::{PoolConfig, WorkerConfig};
pub use errors::{PoolError, PoolResult};
pub use gateway::{Gateway, GatewayRequest, GatewayResponse};
pub use router::{RouteDecision, StickyRouter};
pub use supervisor::{PoolRequest, PoolStatus, WorkerPool};
