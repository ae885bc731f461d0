//! Worker runtime: the code that runs inside a spawned child process.
//!
//! The supervisor side never imports this module's internals directly — it
//! only knows about `WorkerConfig` and the IPC envelope types. This module is
//! linked into the `moltbot-worker` binary.

pub mod handler;
mod runtime;

pub use handler::{HandlerError, NullHandler, RequestHandler};
pub use runtime::run;
