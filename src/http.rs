//! Axum wiring for the demo gateway binary. Kept separate from
//! `gateway.rs` so the facade itself stays free of any particular outer
//! transport — this module is demo wiring around it, not part of the
//! core's surface, mirroring the teacher's own split between its router
//! core and `server.rs`'s HTTP plumbing.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::gateway::{Gateway, GatewayRequest, GatewayResponse};

/// Builds the axum app exercising the facade: `POST /route`, `GET /status`,
/// `GET /workers/{user_id}`, `GET /healthz`.
pub fn build_router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/route", post(route_handler))
        .route("/status", get(status_handler))
        .route("/workers/{user_id}", get(worker_for_user_handler))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(gateway)
}

async fn route_handler(
    State(gateway): State<Arc<Gateway>>,
    Json(request): Json<GatewayRequest>,
) -> Json<GatewayResponse> {
    Json(gateway.route(request).await)
}

async fn status_handler(State(gateway): State<Arc<Gateway>>) -> Json<serde_json::Value> {
    let status = gateway.get_status();
    Json(serde_json::json!({
        "totalWorkers": status.total_workers,
        "healthyWorkers": status.healthy_workers,
        "busyWorkers": status.busy_workers,
        "queuedRequests": status.queued_requests,
        "routingTableSize": status.routing_table_size,
        "workers": status.workers.iter().map(|w| serde_json::json!({
            "workerId": w.worker_id,
            "health": w.health,
        })).collect::<Vec<_>>(),
    }))
}

async fn worker_for_user_handler(
    State(gateway): State<Arc<Gateway>>,
    Path(user_id): Path<String>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "userId": user_id.clone(),
        "workerId": gateway.get_worker_for_user(&user_id),
    }))
}

async fn healthz() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::supervisor::WorkerPool;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_gateway() -> Arc<Gateway> {
        let pool = Arc::new(WorkerPool::new(PoolConfig {
            worker_count: 0,
            ..Default::default()
        }));
        Arc::new(Gateway::new(pool))
    }

    #[tokio::test]
    async fn healthz_responds_ok_without_a_running_pool() {
        let app = build_router(test_gateway());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/healthz")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn status_reports_zero_workers_before_start() {
        let app = build_router(test_gateway());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/status")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["totalWorkers"], 0);
    }
}
