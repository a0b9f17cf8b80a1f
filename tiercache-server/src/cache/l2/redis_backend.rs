use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ConnectionAddr, ConnectionInfo, IntoConnectionInfo, RedisResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

use super::{L2Backend, L2Entry};
use crate::core::{CacheError, Result};

/// Redis L2 configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisL2Config {
    pub url: String,
    pub password: Option<String>,
    /// Prefix applied to every key owned by this cache
    pub key_prefix: String,
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    /// SCAN page size
    pub scan_count: usize,
}

impl Default for RedisL2Config {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            password: None,
            key_prefix: "tc:".to_string(),
            connect_timeout_ms: 5000,
            command_timeout_ms: 2000,
            scan_count: 200,
        }
    }
}

/// Redis-backed L2 using a reconnecting connection manager.
///
/// The connection is opened on first use, so a server that is down at
/// startup only fails commands until it comes back.
pub struct RedisL2 {
    config: RedisL2Config,
    info: RwLock<ConnectionInfo>,
    manager: RwLock<Option<ConnectionManager>>,
}

impl RedisL2 {
    /// Build without connecting; only an invalid URL fails
    pub fn new(config: RedisL2Config) -> Result<Self> {
        let mut info = config
            .url
            .as_str()
            .into_connection_info()
            .map_err(|e| CacheError::Config(format!("invalid redis url: {}", e)))?;
        if let Some(password) = &config.password {
            info.redis.password = Some(password.clone());
        }

        Ok(Self {
            config,
            info: RwLock::new(info),
            manager: RwLock::new(None),
        })
    }

    /// Connect to the configured Redis primary, failing if it is unreachable
    pub async fn connect(config: RedisL2Config) -> Result<Self> {
        let l2 = Self::new(config)?;
        l2.connection().await?;
        Ok(l2)
    }

    async fn open(info: &ConnectionInfo, config: &RedisL2Config) -> Result<ConnectionManager> {
        let client = redis::Client::open(info.clone())?;
        let timeout = Duration::from_millis(config.connect_timeout_ms);
        match tokio::time::timeout(timeout, ConnectionManager::new(client)).await {
            Ok(manager) => Ok(manager?),
            Err(_) => Err(CacheError::Connection(format!(
                "redis connect to {} timed out after {:?}",
                info.addr, timeout
            ))),
        }
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let existing = self.manager.read().clone();
        if let Some(manager) = existing {
            return Ok(manager);
        }

        let info = self.info.read().clone();
        let manager = Self::open(&info, &self.config).await?;
        info!("Redis L2 connected to {}", info.addr);
        *self.manager.write() = Some(manager.clone());
        Ok(manager)
    }

    /// Whether a connection has been established
    pub fn is_connected(&self) -> bool {
        self.manager.read().is_some()
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    fn strip<'a>(&self, full_key: &'a str) -> &'a str {
        full_key
            .strip_prefix(self.config.key_prefix.as_str())
            .unwrap_or(full_key)
    }

    /// Run a command future under the command timeout
    async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        let timeout = Duration::from_millis(self.config.command_timeout_ms);
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result.map_err(CacheError::from),
            Err(_) => Err(CacheError::Connection(format!(
                "redis command timed out after {:?}",
                timeout
            ))),
        }
    }

    /// Full keys matching `prefix` (already including the cache key prefix)
    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}*", escape_glob(&self.full_key(prefix)));
        let mut conn = self.connection().await?;
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(self.config.scan_count);
            let (next, page): (u64, Vec<String>) = self.run(cmd.query_async(&mut conn)).await?;
            keys.extend(page);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

/// Keys, values and TTLs of the whole keyspace, read in one script run so
/// the result reflects a single instant. Replies `key, value, pttl` triples.
const SNAPSHOT_SCRIPT: &str = r#"
local out = {}
for _, key in ipairs(redis.call('KEYS', ARGV[1])) do
    local value = redis.call('GET', key)
    if value then
        out[#out + 1] = key
        out[#out + 1] = value
        out[#out + 1] = redis.call('PTTL', key)
    end
end
return out
"#;

/// Delete every key matching `ARGV[1]`, replying with the count
const CLEAR_SCRIPT: &str = r#"
local keys = redis.call('KEYS', ARGV[1])
for i = 1, #keys, 500 do
    redis.call('DEL', unpack(keys, i, math.min(i + 499, #keys)))
end
return #keys
"#;

/// Decode the flat reply of [`SNAPSHOT_SCRIPT`]
fn parse_snapshot(reply: Vec<redis::Value>, key_prefix: &str) -> Result<Vec<L2Entry>> {
    if reply.len() % 3 != 0 {
        return Err(CacheError::Internal(format!(
            "snapshot reply has {} items, expected triples",
            reply.len()
        )));
    }

    let mut entries = Vec::with_capacity(reply.len() / 3);
    for triple in reply.chunks(3) {
        let key: String = redis::from_redis_value(&triple[0])?;
        let value: Vec<u8> = redis::from_redis_value(&triple[1])?;
        let ttl_ms: i64 = redis::from_redis_value(&triple[2])?;
        // -2: key vanished, -1: no expiry
        let ttl = match ttl_ms {
            -2 => continue,
            ms if ms < 0 => None,
            ms => Some(Duration::from_millis(ms as u64)),
        };
        entries.push(L2Entry {
            key: key.strip_prefix(key_prefix).unwrap_or(&key).to_string(),
            value,
            ttl,
        });
    }
    Ok(entries)
}

/// Escape Redis glob metacharacters
fn escape_glob(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn parse_address(address: &str) -> Result<ConnectionAddr> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| CacheError::Config(format!("address '{}' is not host:port", address)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| CacheError::Config(format!("invalid port in '{}'", address)))?;
    Ok(ConnectionAddr::Tcp(host.to_string(), port))
}

#[async_trait]
impl L2Backend for RedisL2 {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;
        let full_key = self.full_key(key);
        self.run(conn.get(&full_key)).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection().await?;
        let full_key = self.full_key(key);
        debug!("L2 redis SET key={} size={}", full_key, value.len());

        let mut cmd = redis::cmd("SET");
        cmd.arg(&full_key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        self.run(cmd.query_async::<()>(&mut conn)).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let full_key = self.full_key(key);
        let removed: i64 = self.run(conn.del(&full_key)).await?;
        Ok(removed > 0)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let keys = self.scan(prefix).await?;
        Ok(keys.iter().map(|k| self.strip(k).to_string()).collect())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let keys = self.scan(prefix).await?;
        let mut conn = self.connection().await?;
        let mut removed = 0u64;
        for chunk in keys.chunks(self.config.scan_count.max(1)) {
            let n: i64 = self.run(conn.del(chunk)).await?;
            removed += n.max(0) as u64;
        }
        Ok(removed)
    }

    async fn snapshot(&self) -> Result<Vec<L2Entry>> {
        let pattern = format!("{}*", escape_glob(&self.config.key_prefix));
        let mut conn = self.connection().await?;
        let reply: Vec<redis::Value> = self
            .run(
                redis::Script::new(SNAPSHOT_SCRIPT)
                    .arg(&pattern)
                    .invoke_async(&mut conn),
            )
            .await?;
        let entries = parse_snapshot(reply, &self.config.key_prefix)?;
        debug!("Redis L2 snapshot captured {} keys", entries.len());
        Ok(entries)
    }

    async fn replace_all(&self, entries: Vec<L2Entry>) -> Result<()> {
        let pattern = format!("{}*", escape_glob(&self.config.key_prefix));
        let mut conn = self.connection().await?;

        // Clearing inside the transaction leaves no gap for other writers
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("EVAL").arg(CLEAR_SCRIPT).arg(0).arg(&pattern);
        for entry in &entries {
            let cmd = pipe.cmd("SET").arg(self.full_key(&entry.key)).arg(&entry.value);
            if let Some(ttl) = entry.ttl {
                cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
            }
            cmd.ignore();
        }

        let (removed,): (u64,) = self.run(pipe.query_async(&mut conn)).await?;
        info!(
            "Redis L2 keyspace replaced: {} removed, {} written",
            removed,
            entries.len()
        );
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = self.run(redis::cmd("PING").query_async(&mut conn)).await?;
        Ok(())
    }

    async fn len(&self) -> Result<u64> {
        Ok(self.scan("").await?.len() as u64)
    }

    async fn switch_primary(&self, address: &str) -> Result<()> {
        let mut info = self.info.read().clone();
        info.addr = parse_address(address)?;
        let manager = Self::open(&info, &self.config).await?;

        info!("Redis L2 re-pointed to new primary {}", info.addr);
        *self.manager.write() = Some(manager);
        *self.info.write() = info;
        Ok(())
    }
}
