use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::backup::{BackupKind, BackupManager, BackupManifest, RestoreReport, RestoreTarget};
use crate::cache::{TieredCache, TieredCacheStats};
use crate::cluster::{ClusterSnapshot, FailoverCoordinator, FailoverEvent, Observation};
use crate::core::{CacheError, Result, now_millis};
use crate::monitoring::{Alert, HealthLevel, HealthReport, MonitoringManager, SlowLog};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<TieredCache>,
    pub monitoring: MonitoringManager,
    pub backups: Option<Arc<BackupManager>>,
    pub cluster: Option<Arc<FailoverCoordinator>>,
}

impl AppState {
    pub fn new(cache: Arc<TieredCache>) -> Self {
        Self {
            monitoring: MonitoringManager::new(cache.clone()),
            cache,
            backups: None,
            cluster: None,
        }
    }

    pub fn with_backups(mut self, backups: Arc<BackupManager>) -> Self {
        self.monitoring = self.monitoring.with_backups(backups.clone());
        self.backups = Some(backups);
        self
    }

    pub fn with_cluster(mut self, coordinator: Arc<FailoverCoordinator>) -> Self {
        self.monitoring = self.monitoring.with_cluster(coordinator.clone());
        self.cluster = Some(coordinator);
        self
    }

    fn backups(&self) -> Result<&Arc<BackupManager>> {
        self.backups
            .as_ref()
            .ok_or_else(|| CacheError::Unavailable("backups are not configured".to_string()))
    }

    fn cluster(&self) -> Result<&Arc<FailoverCoordinator>> {
        self.cluster
            .as_ref()
            .ok_or_else(|| CacheError::Unavailable("cluster mode is disabled".to_string()))
    }
}

// ---- cache ----

#[derive(Debug, Deserialize)]
pub struct SetParams {
    /// Omitted: configured default TTL
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct SetResponse {
    pub key: String,
    pub stored: bool,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub key: String,
    pub deleted: bool,
}

#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    #[serde(default)]
    pub prefix: Option<String>,
    /// Empty both layers; `prefix` is ignored
    #[serde(default)]
    pub all: bool,
}

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub prefix: Option<String>,
    pub removed: u64,
}

#[derive(Debug, Deserialize)]
pub struct WarmRequest {
    pub keys: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct WarmResponse {
    pub requested: usize,
    pub loaded: usize,
}

/// GET /cache/{key} - raw value bytes
pub async fn cache_get(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response> {
    debug!("HTTP GET key={}", key);
    match state.cache.get(&key).await? {
        Some(value) => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            value,
        )
            .into_response()),
        None => Err(CacheError::KeyNotFound(key)),
    }
}

/// PUT /cache/{key}?ttl_secs=N - body is stored verbatim
pub async fn cache_set(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<SetParams>,
    body: Bytes,
) -> Result<Json<SetResponse>> {
    debug!("HTTP PUT key={} ({} bytes)", key, body.len());
    let ttl = params.ttl_secs.map(Duration::from_secs);
    state.cache.set(&key, body.to_vec(), ttl).await?;
    Ok(Json(SetResponse { key, stored: true }))
}

/// DELETE /cache/{key}
pub async fn cache_delete(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<DeleteResponse>> {
    debug!("HTTP DELETE key={}", key);
    let deleted = state.cache.invalidate(&key).await?;
    Ok(Json(DeleteResponse { key, deleted }))
}

/// POST /cache/invalidate
pub async fn cache_invalidate(
    State(state): State<AppState>,
    Json(req): Json<InvalidateRequest>,
) -> Result<Json<InvalidateResponse>> {
    if req.all {
        let before = state.cache.l1().len() as u64;
        state.cache.clear().await?;
        return Ok(Json(InvalidateResponse {
            prefix: None,
            removed: before,
        }));
    }

    let prefix = req
        .prefix
        .filter(|p| !p.is_empty())
        .ok_or_else(|| CacheError::InvalidRequest("prefix or all=true required".to_string()))?;
    let removed = state.cache.invalidate_prefix(&prefix).await?;
    Ok(Json(InvalidateResponse {
        prefix: Some(prefix),
        removed,
    }))
}

/// POST /cache/warm - pull existing L2 entries into L1
pub async fn cache_warm(
    State(state): State<AppState>,
    Json(req): Json<WarmRequest>,
) -> Result<Json<WarmResponse>> {
    let loaded = state.cache.warm_from_l2(&req.keys).await?;
    Ok(Json(WarmResponse {
        requested: req.keys.len(),
        loaded,
    }))
}

// ---- observability ----

/// GET /health - 503 when critical
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = state.monitoring.health_report().await;
    let status = match report.status {
        HealthLevel::Critical => StatusCode::SERVICE_UNAVAILABLE,
        HealthLevel::Ok | HealthLevel::Degraded => StatusCode::OK,
    };
    (status, Json(report))
}

/// GET /stats
pub async fn stats(State(state): State<AppState>) -> Json<TieredCacheStats> {
    Json(state.cache.stats())
}

#[derive(Debug, Deserialize)]
pub struct SlowLogParams {
    pub count: Option<usize>,
}

/// GET /slowlog
pub async fn slowlog(
    State(state): State<AppState>,
    Query(params): Query<SlowLogParams>,
) -> Json<SlowLog> {
    let log = state.monitoring.slow_log();
    Json(SlowLog {
        entries: log.get(params.count).await,
        total: log.len().await,
    })
}

#[derive(Debug, Deserialize)]
pub struct AlertParams {
    pub limit: Option<usize>,
    #[serde(default)]
    pub active: bool,
}

/// GET /alerts
pub async fn alerts(
    State(state): State<AppState>,
    Query(params): Query<AlertParams>,
) -> Json<Vec<Alert>> {
    let log = state.monitoring.alerts();
    if params.active {
        Json(log.active())
    } else {
        Json(log.recent(params.limit))
    }
}

// ---- backups ----

#[derive(Debug, Deserialize)]
pub struct CreateBackupRequest {
    #[serde(default = "default_backup_kind")]
    pub kind: BackupKind,
}

fn default_backup_kind() -> BackupKind {
    BackupKind::Full
}

#[derive(Debug, Default, Deserialize)]
pub struct RestoreRequest {
    /// Restore this manifest
    pub backup_id: Option<String>,
    /// Restore the newest backup at or before this instant
    pub at: Option<DateTime<Utc>>,
}

impl RestoreRequest {
    fn target(self) -> Result<RestoreTarget> {
        match (self.backup_id, self.at) {
            (Some(_), Some(_)) => Err(CacheError::InvalidRequest(
                "give backup_id or at, not both".to_string(),
            )),
            (Some(id), None) => Ok(RestoreTarget::Manifest(id)),
            (None, Some(at)) => Ok(RestoreTarget::PointInTime(at)),
            (None, None) => Ok(RestoreTarget::Latest),
        }
    }
}

/// POST /backups
pub async fn backup_create(
    State(state): State<AppState>,
    Json(req): Json<CreateBackupRequest>,
) -> Result<(StatusCode, Json<BackupManifest>)> {
    info!("HTTP backup request ({})", req.kind.as_str());
    let manifest = state.backups()?.create_backup(req.kind).await?;
    Ok((StatusCode::CREATED, Json(manifest)))
}

/// GET /backups
pub async fn backup_list(State(state): State<AppState>) -> Result<Json<Vec<BackupManifest>>> {
    Ok(Json(state.backups()?.list().await?))
}

/// POST /backups/restore
pub async fn backup_restore(
    State(state): State<AppState>,
    Json(req): Json<RestoreRequest>,
) -> Result<Json<RestoreReport>> {
    let target = req.target()?;
    info!("HTTP restore request ({:?})", target);
    Ok(Json(state.backups()?.restore(target).await?))
}

// ---- cluster ----

/// Observation from a remote monitor; timestamp defaults to receipt time
#[derive(Debug, Deserialize)]
pub struct ObservationRequest {
    pub monitor_id: String,
    pub node_id: String,
    pub reachable: bool,
    pub observed_at_ms: Option<u64>,
    pub replication_offset: Option<u64>,
}

/// GET /cluster
pub async fn cluster_status(State(state): State<AppState>) -> Result<Json<ClusterSnapshot>> {
    Ok(Json(state.cluster()?.snapshot()))
}

/// POST /cluster/observations
pub async fn cluster_observe(
    State(state): State<AppState>,
    Json(req): Json<ObservationRequest>,
) -> Result<Json<Vec<FailoverEvent>>> {
    let coordinator = state.cluster()?;
    let events = coordinator.report(Observation {
        monitor_id: req.monitor_id,
        node_id: req.node_id,
        reachable: req.reachable,
        observed_at_ms: req.observed_at_ms.unwrap_or_else(now_millis),
        replication_offset: req.replication_offset,
    })?;
    Ok(Json(events))
}
