//! End-to-end tests that spawn the real `moltbot-worker` binary and drive
//! it through the supervisor, exercising sticky routing, session state,
//! and the crash/restart policy across real process boundaries.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use moltbot_pool_rs::config::PoolConfig;
use moltbot_pool_rs::ipc::message::{RequestKind, WorkerState};
use moltbot_pool_rs::supervisor::{PoolRequest, WorkerPool};
use tempfile::tempdir;

fn test_config(base_dir: &Path, worker_count: usize) -> PoolConfig {
    PoolConfig {
        worker_count,
        sandbox_base_dir: base_dir.to_path_buf(),
        heartbeat_interval_ms: 200,
        restart_delay_ms: 200,
        request_timeout_ms: 5_000,
        worker_binary: Some(std::path::PathBuf::from(env!(
            "CARGO_BIN_EXE_moltbot-worker"
        ))),
        ..Default::default()
    }
}

#[tokio::test]
async fn sticky_routing_survives_repeated_dispatch() {
    let dir = tempdir().unwrap();
    let pool = Arc::new(WorkerPool::new(test_config(dir.path(), 3)));
    pool.clone().start().await.unwrap();

    let users = ["user-a", "user-b", "user-c"];
    let mut assigned: HashMap<&str, String> = HashMap::new();
    for user in users {
        let decision = pool.router().route(user).unwrap();
        assigned.insert(user, decision.worker_id);
    }

    for _ in 0..10 {
        for user in users {
            let decision = pool.router().route(user).unwrap();
            assert_eq!(&decision.worker_id, assigned.get(user).unwrap());
            assert!(!decision.is_new_assignment);
        }
    }

    pool.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn session_set_get_delete_round_trip_through_real_worker() {
    let dir = tempdir().unwrap();
    let pool = Arc::new(WorkerPool::new(test_config(dir.path(), 1)));
    pool.clone().start().await.unwrap();

    pool.dispatch(PoolRequest {
        user_id: "user-a".to_string(),
        kind: RequestKind::SessionSet,
        payload: serde_json::json!({"name": "prefs", "value": {"theme": "dark"}}),
        timeout_ms: Some(5_000),
    })
    .await
    .unwrap();

    let got = pool
        .dispatch(PoolRequest {
            user_id: "user-a".to_string(),
            kind: RequestKind::SessionGet,
            payload: serde_json::json!({"name": "prefs"}),
            timeout_ms: Some(5_000),
        })
        .await
        .unwrap();
    assert_eq!(got["theme"], "dark");

    pool.dispatch(PoolRequest {
        user_id: "user-a".to_string(),
        kind: RequestKind::SessionDelete,
        payload: serde_json::json!({"name": "prefs"}),
        timeout_ms: Some(5_000),
    })
    .await
    .unwrap();

    let after_delete = pool
        .dispatch(PoolRequest {
            user_id: "user-a".to_string(),
            kind: RequestKind::SessionGet,
            payload: serde_json::json!({"name": "prefs"}),
            timeout_ms: Some(5_000),
        })
        .await
        .unwrap();
    assert!(after_delete.is_null());

    pool.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn unknown_request_kind_from_application_handler_is_rejected() {
    let dir = tempdir().unwrap();
    let pool = Arc::new(WorkerPool::new(test_config(dir.path(), 1)));
    pool.clone().start().await.unwrap();

    // NullHandler is what the default worker binary boots with; any
    // AgentMessage/AgentCommand must surface as a failed dispatch, not a
    // hang or a crash.
    let result = pool
        .dispatch(PoolRequest {
            user_id: "user-a".to_string(),
            kind: RequestKind::AgentMessage,
            payload: serde_json::json!({"text": "hello"}),
            timeout_ms: Some(5_000),
        })
        .await;
    assert!(result.is_err());

    assert_eq!(
        pool.worker_state(&pool.router().route("user-a").unwrap().worker_id),
        Some(WorkerState::Ready)
    );

    pool.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn worker_restarts_after_self_initiated_shutdown() {
    let dir = tempdir().unwrap();
    let pool = Arc::new(WorkerPool::new(test_config(dir.path(), 1)));
    pool.clone().start().await.unwrap();

    let worker_id = pool.router().route("user-a").unwrap().worker_id;

    // The Shutdown request kind asks the worker to begin its own graceful
    // exit; the supervisor's exit-watch/restart policy should bring the
    // same slot back to Ready without disturbing the sticky assignment.
    let _ = pool
        .dispatch(PoolRequest {
            user_id: "user-a".to_string(),
            kind: RequestKind::Shutdown,
            payload: serde_json::Value::Null,
            timeout_ms: Some(2_000),
        })
        .await;

    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(pool.worker_state(&worker_id), Some(WorkerState::Ready));
    assert_eq!(pool.router().route("user-a").unwrap().worker_id, worker_id);

    pool.stop(Duration::from_secs(2)).await.unwrap();
}
