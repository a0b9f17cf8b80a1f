//! Prometheus Metrics for tiercache
//!
//! - Cache operations and latency per layer
//! - Degraded-mode status
//! - Compression throughput
//! - Backup and restore outcomes
//! - Failover events
//! - HTTP server

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, TextEncoder,
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec,
};

const CACHE_STATES: [&str; 3] = ["healthy", "degraded", "restoring"];

lazy_static! {
    // ============================================================================
    // Cache Metrics
    // ============================================================================

    /// Cache operations by type and outcome (l1_hit, l2_hit, miss, ok, error)
    pub static ref CACHE_OPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tiercache_cache_operations_total",
        "Total number of cache operations by type and outcome",
        &["operation", "outcome"]
    ).unwrap();

    /// Cache operation latency in seconds
    pub static ref CACHE_OP_DURATION: HistogramVec = register_histogram_vec!(
        "tiercache_cache_operation_duration_seconds",
        "Cache operation latency in seconds",
        &["operation"],
        vec![0.00001, 0.0001, 0.001, 0.01, 0.1, 1.0]
    ).unwrap();

    /// 1 for the current serving mode, 0 otherwise
    pub static ref CACHE_STATUS: IntGaugeVec = register_int_gauge_vec!(
        "tiercache_cache_status",
        "Current cache serving mode",
        &["state"]
    ).unwrap();

    /// Misses that joined an in-flight fetch
    pub static ref CACHE_COALESCED_TOTAL: IntCounter = register_int_counter!(
        "tiercache_cache_coalesced_total",
        "Cache misses served by an already running fetch"
    ).unwrap();

    // ============================================================================
    // Compression Metrics
    // ============================================================================

    pub static ref COMPRESSION_BYTES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tiercache_compression_bytes_total",
        "Bytes before and after compression by algorithm",
        &["algorithm", "direction"]
    ).unwrap();

    pub static ref COMPRESSION_BENCHMARKS_TOTAL: IntCounter = register_int_counter!(
        "tiercache_compression_benchmarks_total",
        "Adaptive compression benchmark runs"
    ).unwrap();

    /// Stored values that failed to decode
    pub static ref COMPRESSION_ERRORS_TOTAL: IntCounter = register_int_counter!(
        "tiercache_compression_errors_total",
        "Stored values that could not be decoded"
    ).unwrap();

    // ============================================================================
    // Backup Metrics
    // ============================================================================

    pub static ref BACKUPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tiercache_backups_total",
        "Backup runs by kind and outcome",
        &["kind", "outcome"]
    ).unwrap();

    pub static ref BACKUP_DURATION: HistogramVec = register_histogram_vec!(
        "tiercache_backup_duration_seconds",
        "Backup duration in seconds",
        &["kind"],
        vec![0.01, 0.1, 1.0, 10.0, 60.0, 600.0]
    ).unwrap();

    pub static ref BACKUP_LAST_SUCCESS: IntGauge = register_int_gauge!(
        "tiercache_backup_last_success_timestamp_seconds",
        "Unix time of the last successful backup"
    ).unwrap();

    pub static ref RESTORES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tiercache_restores_total",
        "Restore runs by outcome",
        &["outcome"]
    ).unwrap();

    // ============================================================================
    // Cluster Metrics
    // ============================================================================

    pub static ref FAILOVER_EVENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tiercache_failover_events_total",
        "Failover events by kind",
        &["event"]
    ).unwrap();

    pub static ref CLUSTER_EPOCH: IntGauge = register_int_gauge!(
        "tiercache_cluster_epoch",
        "Current failover epoch"
    ).unwrap();

    pub static ref ALERTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tiercache_alerts_total",
        "Alerts raised by severity",
        &["severity"]
    ).unwrap();

    // ============================================================================
    // HTTP Server Metrics
    // ============================================================================

    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tiercache_http_requests_total",
        "Total HTTP requests",
        &["method", "path", "status"]
    ).unwrap();

    pub static ref HTTP_REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "tiercache_http_request_duration_seconds",
        "HTTP request latency in seconds",
        &["method", "path"],
        vec![0.001, 0.01, 0.1, 1.0, 10.0]
    ).unwrap();

    // ============================================================================
    // L1 Gauges (refreshed on scrape)
    // ============================================================================

    pub static ref L1_ENTRIES: IntGauge = register_int_gauge!(
        "tiercache_l1_entries",
        "Entries currently held in L1"
    ).unwrap();

    pub static ref L1_BYTES: IntGauge = register_int_gauge!(
        "tiercache_l1_bytes",
        "Value bytes currently held in L1"
    ).unwrap();
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

pub fn record_cache_op(operation: &str, outcome: &str) {
    CACHE_OPS_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
}

pub fn observe_cache_latency(operation: &str, duration_secs: f64) {
    CACHE_OP_DURATION
        .with_label_values(&[operation])
        .observe(duration_secs);
}

/// Flip the status gauge to `state`
pub fn set_cache_status(state: &str) {
    for candidate in CACHE_STATES {
        CACHE_STATUS
            .with_label_values(&[candidate])
            .set(i64::from(candidate == state));
    }
}

pub fn record_coalesced() {
    CACHE_COALESCED_TOTAL.inc();
}

pub fn record_compression(algorithm: &str, bytes_in: usize, bytes_out: usize) {
    COMPRESSION_BYTES_TOTAL
        .with_label_values(&[algorithm, "in"])
        .inc_by(bytes_in as u64);
    COMPRESSION_BYTES_TOTAL
        .with_label_values(&[algorithm, "out"])
        .inc_by(bytes_out as u64);
}

pub fn record_compression_benchmark() {
    COMPRESSION_BENCHMARKS_TOTAL.inc();
}

pub fn record_compression_error() {
    COMPRESSION_ERRORS_TOTAL.inc();
}

/// Record a backup run
pub fn record_backup(kind: &str, outcome: &str, duration_secs: f64) {
    BACKUPS_TOTAL.with_label_values(&[kind, outcome]).inc();
    BACKUP_DURATION
        .with_label_values(&[kind])
        .observe(duration_secs);
    if outcome == "success" {
        BACKUP_LAST_SUCCESS.set(chrono::Utc::now().timestamp());
    }
}

pub fn record_restore(outcome: &str) {
    RESTORES_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_failover_event(event: &str) {
    FAILOVER_EVENTS_TOTAL.with_label_values(&[event]).inc();
}

pub fn set_cluster_epoch(epoch: u64) {
    CLUSTER_EPOCH.set(epoch as i64);
}

pub fn record_alert(severity: &str) {
    ALERTS_TOTAL.with_label_values(&[severity]).inc();
}

/// Record HTTP request
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();
    HTTP_REQUEST_DURATION
        .with_label_values(&[method, path])
        .observe(duration_secs);
}

pub fn update_l1_gauges(entries: usize, bytes: usize) {
    L1_ENTRIES.set(entries as i64);
    L1_BYTES.set(bytes as i64);
}
