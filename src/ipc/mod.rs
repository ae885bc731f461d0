//! Bidirectional IPC protocol between the supervisor and a worker child
//! process: tagged envelopes over a framed NDJSON stream, one stream per
//! child (the child's stdin for supervisor -> worker, stdout for the reverse).
//!
//! The message-dispatch shape here (tag, match, handle) mirrors the worker
//! message loop in the pack's process-worker examples, generalized from a
//! ZeroMQ multipart frame to a newline-delimited JSON object — the spec
//! requires only "one stream per child", not a particular wire format, and
//! NDJSON keeps the supervisor and worker binaries free of a second
//! serialization dependency.

pub mod channel;
pub mod message;

pub use channel::IpcChannel;
pub use message::{ToSupervisor, ToWorker};
