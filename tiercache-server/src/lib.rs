pub mod backup;
pub mod cache;
pub mod cluster;
pub mod compression;
pub mod config;
pub mod core;
pub mod logging;
pub mod metrics;
pub mod monitoring;
pub mod server;

// Re-export commonly used types
pub use backup::{
    BackupConfig, BackupError, BackupKind, BackupManager, BackupManifest, BackupStorage,
    LocalStorage, RestoreTarget,
};
pub use cache::{L2Backend, MemoryL2, RedisL2, TieredCache, TieredCacheConfig};
pub use cluster::{ClusterConfig, FailoverCoordinator, FailoverEvent, NodeRole};
pub use compression::{CompressionAlgorithm, CompressionConfig, Compressor};
pub use config::ServerConfig;
pub use core::{CacheError, CacheStatus, Result};
pub use monitoring::{AlertLog, MonitoringManager, SlowLogManager};
pub use server::{AppState, create_router, init_metrics};
