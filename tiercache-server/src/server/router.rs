use super::handlers::{self, AppState};
use super::metrics_handler::{metrics_handler, track_http_metrics};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
};
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

/// Create the Axum router with all endpoints
pub fn create_router(state: AppState, request_timeout: Duration, max_body_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Cache data plane
        .route(
            "/cache/{key}",
            get(handlers::cache_get)
                .put(handlers::cache_set)
                .delete(handlers::cache_delete),
        )
        .route("/cache/invalidate", post(handlers::cache_invalidate))
        .route("/cache/warm", post(handlers::cache_warm))
        // Observability
        .route("/health", get(handlers::health))
        .route("/stats", get(handlers::stats))
        .route("/metrics", get(metrics_handler))
        .route("/slowlog", get(handlers::slowlog))
        .route("/alerts", get(handlers::alerts))
        // Backups
        .route(
            "/backups",
            get(handlers::backup_list).post(handlers::backup_create),
        )
        .route("/backups/restore", post(handlers::backup_restore))
        // Cluster
        .route("/cluster", get(handlers::cluster_status))
        .route("/cluster/observations", post(handlers::cluster_observe))
        .with_state(state)
        .layer(middleware::from_fn(track_http_metrics))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
