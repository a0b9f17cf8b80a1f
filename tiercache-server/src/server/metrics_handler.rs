//! Prometheus Metrics HTTP Handler

use axum::{
    extract::{MatchedPath, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::time::Instant;

use super::handlers::AppState;

/// GET /metrics - Prometheus metrics endpoint
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.monitoring.refresh_gauges();

    match crate::metrics::encode_metrics() {
        Ok(metrics) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            metrics,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

/// Record count and latency per route template
pub async fn track_http_metrics(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    // Route template keeps cache keys out of label values
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;
    crate::metrics::record_http_request(
        &method,
        &path,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Force registration so every family shows up on the first scrape
pub fn init_metrics() {
    let _ = &*crate::metrics::CACHE_OPS_TOTAL;
    let _ = &*crate::metrics::CACHE_OP_DURATION;
    let _ = &*crate::metrics::CACHE_STATUS;
    let _ = &*crate::metrics::CACHE_COALESCED_TOTAL;
    let _ = &*crate::metrics::COMPRESSION_BYTES_TOTAL;
    let _ = &*crate::metrics::COMPRESSION_BENCHMARKS_TOTAL;
    let _ = &*crate::metrics::COMPRESSION_ERRORS_TOTAL;
    let _ = &*crate::metrics::BACKUPS_TOTAL;
    let _ = &*crate::metrics::BACKUP_DURATION;
    let _ = &*crate::metrics::BACKUP_LAST_SUCCESS;
    let _ = &*crate::metrics::RESTORES_TOTAL;
    let _ = &*crate::metrics::FAILOVER_EVENTS_TOTAL;
    let _ = &*crate::metrics::CLUSTER_EPOCH;
    let _ = &*crate::metrics::ALERTS_TOTAL;
    let _ = &*crate::metrics::HTTP_REQUESTS_TOTAL;
    let _ = &*crate::metrics::HTTP_REQUEST_DURATION;
    let _ = &*crate::metrics::L1_ENTRIES;
    let _ = &*crate::metrics::L1_BYTES;

    tracing::info!("Prometheus metrics initialized");
}
