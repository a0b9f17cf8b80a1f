use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::backup::BackupError;
use crate::cluster::ClusterError;

/// Main error type for cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("L2 connection error: {0}")]
    Connection(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Upstream fetch failed: {0}")]
    Upstream(String),

    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::KeyNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) | Self::Config(_) => StatusCode::BAD_REQUEST,
            Self::Connection(_) | Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Backup(BackupError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Backup(BackupError::InProgress) => StatusCode::CONFLICT,
            Self::Backup(BackupError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Cluster(ClusterError::QuorumNotReached { .. }) => StatusCode::CONFLICT,
            Self::Cluster(ClusterError::FutureObservation { .. }) => StatusCode::BAD_REQUEST,
            Self::Cluster(ClusterError::NodeNotFound(_) | ClusterError::UnknownMonitor(_)) => {
                StatusCode::NOT_FOUND
            }
            Self::Compression(_)
            | Self::Serialization(_)
            | Self::Backup(_)
            | Self::Cluster(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error means the distributed layer could not be reached
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error()
            || e.is_connection_dropped()
            || e.is_connection_refusal()
            || e.is_timeout()
        {
            CacheError::Connection(e.to_string())
        } else {
            CacheError::Internal(format!("redis: {}", e))
        }
    }
}

/// Implement IntoResponse for Axum integration
impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "code": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;
