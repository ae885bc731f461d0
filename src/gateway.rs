//! Thin facade presented to external request ingresses: user-id extraction,
//! request-type mapping, and error translation into a flat response shape.
//! The outer transport (HTTP/WebSocket/chat ingress) that calls this facade
//! is itself out of scope for this crate.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::PoolResult;
use crate::ipc::message::RequestKind;
use crate::supervisor::{PoolRequest, PoolStatus, WorkerPool};

/// Raw inbound shape a caller hands to `route()`. `request_type` is the
/// caller's own vocabulary (`"agent"`, `"command"`, `"session"`, ...); it is
/// mapped to a `RequestKind` before dispatch.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayRequest {
    pub user_id: Option<String>,
    pub session_key: Option<String>,
    #[serde(default)]
    pub request_type: Option<String>,
    #[serde(default)]
    pub session_op: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub request_id: String,
}

pub struct Gateway {
    pool: Arc<WorkerPool>,
}

impl Gateway {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self { pool }
    }

    pub async fn start(&self) -> PoolResult<()> {
        self.pool.clone().start().await
    }

    pub async fn stop(&self, grace: Duration) -> PoolResult<()> {
        self.pool.stop(grace).await
    }

    pub fn get_status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub fn get_worker_for_user(&self, user_id: &str) -> Option<String> {
        self.pool.router().peek(user_id)
    }

    pub async fn route(&self, request: GatewayRequest) -> GatewayResponse {
        let request_id = Uuid::new_v4().to_string();
        let user_id = extract_user_id(&request);
        let kind = map_request_kind(&request);

        let pool_request = PoolRequest {
            user_id,
            kind,
            payload: request.payload,
            timeout_ms: request.timeout_ms,
        };

        match self.pool.dispatch(pool_request).await {
            Ok(payload) => GatewayResponse {
                success: true,
                payload: Some(payload),
                error: None,
                request_id,
            },
            Err(e) => GatewayResponse {
                success: false,
                payload: None,
                error: Some(e.to_string()),
                request_id,
            },
        }
    }
}

/// `request.userId ?? request.sessionKey ?? "anon:<fresh uuid>"`. The
/// anonymous fallback is intentionally non-sticky: a fresh id each call
/// never hits the assignment cache twice.
fn extract_user_id(request: &GatewayRequest) -> String {
    request
        .user_id
        .clone()
        .or_else(|| request.session_key.clone())
        .unwrap_or_else(|| format!("anon:{}", Uuid::new_v4()))
}

fn map_request_kind(request: &GatewayRequest) -> RequestKind {
    match request.request_type.as_deref() {
        Some("agent") => RequestKind::AgentMessage,
        Some("command") => RequestKind::AgentCommand,
        Some("session") => match request.session_op.as_deref() {
            Some("set") => RequestKind::SessionSet,
            Some("delete") => RequestKind::SessionDelete,
            Some("list") => RequestKind::SessionList,
            _ => RequestKind::SessionGet,
        },
        Some("health") => RequestKind::HealthCheck,
        Some("shutdown") => RequestKind::Shutdown,
        _ => RequestKind::AgentMessage,
    }
}
