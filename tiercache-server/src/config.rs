use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

use crate::backup::{BackupConfig, StorageKind};
use crate::cache::{L2Kind, RedisL2Config, TieredCacheConfig};
use crate::cluster::{ClusterConfig, parse_nodes};
use crate::compression::{AlgorithmChoice, CompressionConfig};
use crate::core::{CacheError, Result};
use crate::monitoring::SlowLogConfig;

/// Default config file picked up from the working directory
pub const DEFAULT_CONFIG_FILE: &str = "config.yml";

/// Main server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: Server,
    pub cache: TieredCacheConfig,
    pub l2: L2Config,
    pub compression: CompressionConfig,
    pub cluster: ClusterConfig,
    pub backup: BackupConfig,
    pub logging: LoggingConfig,
    pub slowlog: SlowLogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Server {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    /// Largest accepted request body (cache values included)
    pub max_body_bytes: usize,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 15600,
            request_timeout_secs: 30,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct L2Config {
    pub backend: L2Kind,
    pub redis: RedisL2Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl ServerConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: ServerConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// File (explicit path, else `config.yml` when present, else defaults),
    /// then environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(DEFAULT_CONFIG_FILE)?,
            None => {
                info!("No config file, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides()?;
        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply `TIERCACHE_*` overrides using `lookup` to read variables
    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("TIERCACHE_HOST") {
            self.server.host = v;
        }
        if let Some(v) = get("TIERCACHE_PORT") {
            self.server.port = parse_var("TIERCACHE_PORT", &v)?;
        }
        if let Some(v) = get("TIERCACHE_DEFAULT_TTL_SECS") {
            self.cache.default_ttl_secs = parse_var("TIERCACHE_DEFAULT_TTL_SECS", &v)?;
        }
        if let Some(v) = get("TIERCACHE_L1_TTL_SECS") {
            self.cache.l1_ttl_secs = parse_var("TIERCACHE_L1_TTL_SECS", &v)?;
        }
        if let Some(v) = get("TIERCACHE_L1_MAX_ENTRIES") {
            self.cache.l1_max_entries = parse_var("TIERCACHE_L1_MAX_ENTRIES", &v)?;
        }
        if let Some(v) = get("TIERCACHE_L2_BACKEND") {
            self.l2.backend = L2Kind::parse(&v)
                .with_context(|| format!("TIERCACHE_L2_BACKEND: unknown backend '{}'", v))?;
        }
        if let Some(v) = get("TIERCACHE_REDIS_URL") {
            self.l2.redis.url = v;
        }
        if let Some(v) = get("TIERCACHE_REDIS_PASSWORD") {
            self.l2.redis.password = Some(v.clone());
            self.cluster.password = Some(v);
        }
        if let Some(v) = get("TIERCACHE_REDIS_KEY_PREFIX") {
            self.l2.redis.key_prefix = v;
        }
        if let Some(v) = get("TIERCACHE_CLUSTER_NODES") {
            self.cluster.nodes = parse_nodes(&v).context("TIERCACHE_CLUSTER_NODES")?;
            self.cluster.enabled = !self.cluster.nodes.is_empty();
        }
        if let Some(v) = get("TIERCACHE_CLUSTER_QUORUM") {
            self.cluster.quorum = parse_var("TIERCACHE_CLUSTER_QUORUM", &v)?;
        }
        if let Some(v) = get("TIERCACHE_COMPRESSION_ENABLED") {
            self.compression.enabled = parse_bool("TIERCACHE_COMPRESSION_ENABLED", &v)?;
        }
        if let Some(v) = get("TIERCACHE_COMPRESSION_ALGORITHM") {
            self.compression.algorithm = AlgorithmChoice::parse(&v).with_context(|| {
                format!("TIERCACHE_COMPRESSION_ALGORITHM: unknown algorithm '{}'", v)
            })?;
        }
        if let Some(v) = get("TIERCACHE_COMPRESSION_MIN_SIZE") {
            self.compression.min_payload_size = parse_var("TIERCACHE_COMPRESSION_MIN_SIZE", &v)?;
        }
        if let Some(v) = get("TIERCACHE_COMPRESSION_BENCHMARK") {
            self.compression.benchmark.enabled =
                parse_bool("TIERCACHE_COMPRESSION_BENCHMARK", &v)?;
        }
        if let Some(v) = get("TIERCACHE_BACKUP_ENABLED") {
            self.backup.enabled = parse_bool("TIERCACHE_BACKUP_ENABLED", &v)?;
        }
        if let Some(v) = get("TIERCACHE_BACKUP_INTERVAL_SECS") {
            self.backup.interval_secs = parse_var("TIERCACHE_BACKUP_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("TIERCACHE_BACKUP_RETENTION_DAYS") {
            self.backup.retention_days = parse_var("TIERCACHE_BACKUP_RETENTION_DAYS", &v)?;
        }
        if let Some(v) = get("TIERCACHE_BACKUP_STORAGE") {
            self.backup.storage = StorageKind::parse(&v)
                .with_context(|| format!("TIERCACHE_BACKUP_STORAGE: unknown storage '{}'", v))?;
        }
        if let Some(v) = get("TIERCACHE_BACKUP_DIR") {
            self.backup.directory = PathBuf::from(v);
        }
        if let Some(v) = get("TIERCACHE_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = get("TIERCACHE_LOG_FORMAT") {
            self.logging.format = match v.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" | "text" => LogFormat::Pretty,
                other => anyhow::bail!("TIERCACHE_LOG_FORMAT: unknown format '{}'", other),
            };
        }
        Ok(())
    }

    /// Reject settings the components cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(config_error("server.port must be non-zero"));
        }
        if self.cache.l1_max_entries == 0 {
            return Err(config_error("cache.l1_max_entries must be at least 1"));
        }
        if self.cache.health_check_interval_ms == 0 {
            return Err(config_error("cache.health_check_interval_ms must be non-zero"));
        }
        if self.cache.backoff.multiplier < 1.0 {
            return Err(config_error("cache.backoff.multiplier must be >= 1.0"));
        }
        if self.compression.high_ratio_threshold < self.compression.min_payload_size {
            return Err(config_error(
                "compression.high_ratio_threshold must be >= min_payload_size",
            ));
        }
        if !(1..=22).contains(&self.compression.zstd_level) {
            return Err(config_error("compression.zstd_level must be within 1..=22"));
        }
        if self.l2.backend == L2Kind::Redis && self.l2.redis.url.trim().is_empty() {
            return Err(config_error("l2.redis.url is required for the redis backend"));
        }
        if self.cluster.enabled {
            self.cluster.validate()?;
        }
        if self.backup.enabled {
            if self.backup.interval_secs == 0 {
                return Err(config_error("backup.interval_secs must be non-zero"));
            }
            if self.backup.full_every == 0 {
                return Err(config_error("backup.full_every must be at least 1"));
            }
        }
        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn config_error(message: &str) -> CacheError {
    CacheError::Config(message.to_string())
}

fn parse_var<T>(name: &str, value: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("{}: invalid value '{}'", name, value))
}

fn parse_bool(name: &str, value: &str) -> anyhow::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("{}: expected a boolean, got '{}'", name, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn apply(vars: &[(&str, &str)]) -> anyhow::Result<ServerConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut config = ServerConfig::default();
        config.apply_overrides(|name| vars.get(name).cloned())?;
        Ok(config)
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.server_addr(), "0.0.0.0:15600");
        assert_eq!(config.l2.backend, L2Kind::Redis);
    }

    #[test]
    fn test_env_overrides() {
        let config = apply(&[
            ("TIERCACHE_PORT", "9000"),
            ("TIERCACHE_L2_BACKEND", "memory"),
            ("TIERCACHE_COMPRESSION_ALGORITHM", "zstd"),
            ("TIERCACHE_COMPRESSION_BENCHMARK", "true"),
            ("TIERCACHE_CLUSTER_NODES", "a=10.0.0.1:6379,b=10.0.0.2:6379"),
            ("TIERCACHE_BACKUP_DIR", "/tmp/backups"),
            ("TIERCACHE_LOG_FORMAT", "json"),
        ])
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.l2.backend, L2Kind::Memory);
        assert_eq!(config.compression.algorithm, AlgorithmChoice::Zstd);
        assert!(config.compression.benchmark.enabled);
        assert!(config.cluster.enabled);
        assert_eq!(config.cluster.nodes.len(), 2);
        assert_eq!(config.backup.directory, PathBuf::from("/tmp/backups"));
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_bad_env_values() {
        assert!(apply(&[("TIERCACHE_PORT", "not-a-port")]).is_err());
        assert!(apply(&[("TIERCACHE_L2_BACKEND", "memcached")]).is_err());
        assert!(apply(&[("TIERCACHE_BACKUP_ENABLED", "maybe")]).is_err());
    }

    #[test]
    fn test_yaml_sections() {
        let yaml = r#"
server:
  port: 7000
cache:
  default_ttl_secs: 60
l2:
  backend: memory
compression:
  algorithm: lz4
backup:
  enabled: true
  full_every: 12
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.cache.default_ttl_secs, 60);
        assert_eq!(config.cache.l1_max_entries, 10_000);
        assert_eq!(config.l2.backend, L2Kind::Memory);
        assert_eq!(config.compression.algorithm, AlgorithmChoice::Lz4);
        assert_eq!(config.backup.full_every, 12);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = ServerConfig::default();
        config.compression.high_ratio_threshold = 10;
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));

        let mut config = ServerConfig::default();
        config.cluster.enabled = true;
        config.cluster.monitors = vec!["a".into(), "b".into(), "c".into()];
        config.cluster.quorum = 1;
        assert!(config.validate().is_err());
    }
}
