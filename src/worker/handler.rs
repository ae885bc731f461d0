//! The seam where application-level request handling plugs into the worker
//! runtime. `AgentMessage`/`AgentCommand` are the request kinds the design
//! spec calls out as external collaborators (agent logic, chat providers);
//! this crate only defines the trait they implement against.

use async_trait::async_trait;
use serde_json::Value;

use crate::ipc::message::RequestKind;
use crate::sandbox::Sandbox;

#[derive(Debug, Clone)]
pub struct HandlerError {
    pub message: String,
    pub code: Option<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
        }
    }
}

/// Handles the request kinds the worker runtime does not implement itself
/// (`AgentMessage`, `AgentCommand`). Session, health, and shutdown requests
/// never reach this trait — the runtime answers those directly.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        kind: RequestKind,
        payload: Value,
        sandbox: &Sandbox,
    ) -> Result<Value, HandlerError>;
}

/// Rejects every request it sees. The default for a worker binary started
/// without an application handler wired in.
pub struct NullHandler;

#[async_trait]
impl RequestHandler for NullHandler {
    async fn handle(
        &self,
        kind: RequestKind,
        _payload: Value,
        _sandbox: &Sandbox,
    ) -> Result<Value, HandlerError> {
        Err(HandlerError::with_code(
            format!("no application handler configured for {kind}"),
            "NO_HANDLER",
        ))
    }
}
