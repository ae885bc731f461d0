//! Crate-wide error type.
//!
//! Every row of the error table in the design spec gets its own variant so
//! callers can match on failure mode instead of parsing strings. IO and
//! serialization failures are wrapped rather than re-described.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no workers available")]
    NoWorkersAvailable,

    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    #[error("pool has not been started")]
    PoolNotStarted,

    #[error("pool is already started")]
    PoolAlreadyStarted,

    #[error("worker {0} did not become ready within the startup timeout")]
    WorkerStartupTimeout(String),

    #[error("worker {0} crashed during startup: {1}")]
    WorkerStartupFailure(String, String),

    #[error("request {0} timed out")]
    RequestTimeout(String),

    #[error("worker {0} exited while request {1} was pending")]
    WorkerExited(String, String),

    #[error("no healthy workers available to serve request")]
    NoHealthyWorkers,

    #[error("worker handler error: {0}")]
    HandlerError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Configuration(String),
}

pub type PoolResult<T> = std::result::Result<T, PoolError>;
