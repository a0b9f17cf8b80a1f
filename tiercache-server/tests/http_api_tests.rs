//! HTTP API Tests
//!
//! Drive the router in-process with tower's oneshot

mod common;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode, header},
};
use common::memory_cache;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tiercache_server::backup::{BackupConfig, BackupManager, LocalStorage};
use tiercache_server::cache::{MemoryL2, TieredCacheConfig};
use tiercache_server::cluster::{ClusterConfig, NodeConfig};
use tiercache_server::{AppState, FailoverCoordinator, create_router, init_metrics};
use tower::ServiceExt;

struct TestApp {
    router: Router,
    l2: Arc<MemoryL2>,
    _backup_dir: TempDir,
}

async fn app() -> TestApp {
    let (l2, cache) = memory_cache(TieredCacheConfig::default());

    let backup_dir = TempDir::new().unwrap();
    let storage = Arc::new(LocalStorage::open(backup_dir.path()).await.unwrap());
    let backups = Arc::new(BackupManager::new(
        BackupConfig::default(),
        cache.clone(),
        storage,
    ));

    let coordinator = Arc::new(
        FailoverCoordinator::new(ClusterConfig {
            enabled: true,
            monitors: vec!["local".into(), "m2".into(), "m3".into()],
            quorum: 2,
            nodes: vec![
                NodeConfig {
                    id: "redis-a".into(),
                    address: "10.0.0.1:6379".into(),
                    priority: 0,
                },
                NodeConfig {
                    id: "redis-b".into(),
                    address: "10.0.0.2:6379".into(),
                    priority: 1,
                },
            ],
            ..Default::default()
        })
        .unwrap(),
    );

    let state = AppState::new(cache)
        .with_backups(backups)
        .with_cluster(coordinator);
    TestApp {
        router: create_router(state, Duration::from_secs(5), 1024 * 1024),
        l2,
        _backup_dir: backup_dir,
    }
}

async fn send(router: &Router, method: Method, uri: &str, body: Body) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body)
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

async fn send_json(router: &Router, method: Method, uri: &str, body: Value) -> (StatusCode, Value) {
    let (status, bytes) = send(router, method, uri, Body::from(body.to_string())).await;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_cache_roundtrip_over_http() {
    let app = app().await;

    let (status, _) = send(
        &app.router,
        Method::PUT,
        "/cache/course:42?ttl_secs=60",
        Body::from("rust ownership"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app.router, Method::GET, "/cache/course:42", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"rust ownership");

    let (status, body) =
        send_json(&app.router, Method::DELETE, "/cache/course:42", Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], true);

    let (status, _) = send(&app.router, Method::GET, "/cache/course:42", Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_prefix_invalidation_requires_prefix() {
    let app = app().await;
    for key in ["user:1", "user:2", "course:1"] {
        send(&app.router, Method::PUT, &format!("/cache/{}", key), Body::from("v")).await;
    }

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        "/cache/invalidate",
        json!({ "prefix": "user:" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], 2);

    let (status, _) = send_json(&app.router, Method::POST, "/cache/invalidate", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app.router, Method::GET, "/cache/course:1", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_health_reports_degraded_l2() {
    let app = app().await;

    let (status, body) = send_json(&app.router, Method::GET, "/health", Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["cluster"]["primary"], "redis-a");
    assert_eq!(body["backup"]["backups"], 0);

    app.l2.set_available(false);
    let (status, _) = send(&app.router, Method::PUT, "/cache/k", Body::from("v")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send_json(&app.router, Method::GET, "/health", Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
    assert!(body["journal_pending"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn test_backup_and_restore_over_http() {
    let app = app().await;
    send(&app.router, Method::PUT, "/cache/a", Body::from("1")).await;

    let (status, manifest) =
        send_json(&app.router, Method::POST, "/backups", json!({ "kind": "full" })).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(manifest["kind"], "full");
    let id = manifest["id"].as_str().unwrap().to_string();

    send(&app.router, Method::PUT, "/cache/a", Body::from("2")).await;

    let (status, list) = send_json(&app.router, Method::GET, "/backups", Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, report) = send_json(
        &app.router,
        Method::POST,
        "/backups/restore",
        json!({ "backup_id": id }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["restored_entries"], 1);

    let (_, body) = send(&app.router, Method::GET, "/cache/a", Body::empty()).await;
    assert_eq!(body, b"1");

    let (status, _) = send_json(
        &app.router,
        Method::POST,
        "/backups/restore",
        json!({ "backup_id": "missing-backup" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cluster_observations() {
    let app = app().await;

    let (status, snapshot) = send_json(&app.router, Method::GET, "/cluster", Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["epoch"], 0);
    assert_eq!(snapshot["primary"], "redis-a");

    let (status, _) = send_json(
        &app.router,
        Method::POST,
        "/cluster/observations",
        json!({ "monitor_id": "m2", "node_id": "redis-a", "reachable": false }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send_json(
        &app.router,
        Method::POST,
        "/cluster/observations",
        json!({ "monitor_id": "intruder", "node_id": "redis-a", "reachable": false }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    init_metrics();
    let app = app().await;
    send(&app.router, Method::PUT, "/cache/m", Body::from("v")).await;
    send(&app.router, Method::GET, "/cache/m", Body::empty()).await;

    let (status, body) = send(&app.router, Method::GET, "/metrics", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("tiercache_"));
}
