//! Supervisor: owns the worker pool lifecycle, the sliding-window restart
//! policy, and request dispatch against the sticky router.

mod env_filter;
mod pool;
mod record;

pub use pool::{PoolRequest, PoolStatus, WorkerHealthEntry, WorkerPool};
pub use record::WorkerSlot;
