//! Redis Cache - Distributed Remote Backend
//!
//! Redis-based implementation of the remote tier, shared by every process that
//! points at the same server and database.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{debug, info};

use crate::config::RemoteConfig;
use crate::traits::{RemoteBackend, ServerStats};

/// Redis remote backend with `ConnectionManager` for automatic reconnection
///
/// Provides:
/// - Distributed caching across multiple instances
/// - Automatic reconnection via `ConnectionManager`
/// - Pattern-based key scanning (SCAN, never KEYS)
/// - Memory and keyspace introspection for monitoring
pub struct RedisBackend {
    /// Redis connection manager - handles reconnection automatically
    conn_manager: ConnectionManager,
}

impl RedisBackend {
    /// Connect using the configured connection parameters
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis client cannot be created or connection fails.
    pub async fn connect(config: &RemoteConfig) -> Result<Self> {
        Self::with_url(&config.connection_url()).await
    }

    /// Connect with an explicit URL
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection string (e.g., `<redis://localhost:6379/0>`)
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis client cannot be created or connection fails.
    pub async fn with_url(redis_url: &str) -> Result<Self> {
        info!(redis_url = %redact(redis_url), "Initializing Redis backend with ConnectionManager");

        let client = Client::open(redis_url)
            .with_context(|| format!("Failed to create Redis client with URL: {}", redact(redis_url)))?;

        let conn_manager = ConnectionManager::new(client)
            .await
            .context("Failed to establish Redis connection manager")?;

        let mut conn = conn_manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis PING health check failed")?;

        info!(redis_url = %redact(redis_url), "Redis backend connected successfully");

        Ok(Self { conn_manager })
    }

    /// Scan keys matching a pattern (glob-style: *, ?, [])
    ///
    /// Uses Redis SCAN command (non-blocking, cursor-based iteration)
    /// This is safe for production use, unlike KEYS command.
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis command fails.
    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn_manager.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;

            cursor = next;
            keys.extend(batch);

            if cursor == 0 {
                break;
            }
        }

        debug!(pattern = %pattern, count = keys.len(), "[Redis] Scanned keys matching pattern");
        Ok(keys)
    }

    /// Remove multiple keys at once (bulk delete)
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis command fails.
    pub async fn remove_bulk(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn_manager.clone();
        let count: u64 = conn.del(keys).await?;
        debug!(count = count, "[Redis] Removed keys in bulk");
        Ok(count)
    }
}

/// Hide the password part of a connection URL in logs
fn redact(url: &str) -> String {
    let parts = url.find("://").zip(url.rfind('@')).and_then(|(scheme_end, at)| {
        (at > scheme_end).then(|| url.get(..scheme_end).zip(url.get(at..)))?
    });
    match parts {
        Some((scheme, host)) => format!("{scheme}://***{host}"),
        None => url.to_string(),
    }
}

fn pttl_to_duration(pttl: i64) -> Option<Duration> {
    u64::try_from(pttl).ok().map(Duration::from_millis)
}

/// Extract a numeric field from `INFO` output (`name:value` lines)
fn info_field(info: &str, name: &str) -> Option<u64> {
    info.lines().find_map(|line| {
        let (field, value) = line.split_once(':')?;
        (field == name).then(|| value.trim().parse().ok()).flatten()
    })
}

#[async_trait]
impl RemoteBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.conn_manager.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value.map(Bytes::from))
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<(Bytes, Option<Duration>)>> {
        let mut conn = self.conn_manager.clone();
        let (value, pttl): (Option<Vec<u8>>, i64) = redis::pipe()
            .atomic()
            .get(key)
            .pttl(key)
            .query_async(&mut conn)
            .await?;
        // PTTL: -1 no expiry, -2 missing
        Ok(value.map(|value| (Bytes::from(value), pttl_to_duration(pttl))))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        match ttl {
            Some(ttl) => {
                let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
                let _: () = conn.pset_ex(key, value.as_ref(), millis).await?;
            }
            None => {
                let _: () = conn.set(key, value.as_ref()).await?;
            }
        }
        debug!(key = %key, ttl = ?ttl, "[Redis] Cached key");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let removed: u64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64> {
        let keys = self.scan_keys(pattern).await?;
        self.remove_bulk(&keys).await
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await?;
        Ok(())
    }

    async fn server_stats(&self) -> Result<Option<ServerStats>> {
        let mut conn = self.conn_manager.clone();
        let info: String = redis::cmd("INFO").arg("memory").query_async(&mut conn).await?;
        let total_keys: u64 = redis::cmd("DBSIZE").query_async(&mut conn).await?;

        Ok(Some(ServerStats {
            used_memory: info_field(&info, "used_memory").unwrap_or(0),
            max_memory: info_field(&info, "maxmemory").unwrap_or(0),
            total_keys,
        }))
    }

    fn name(&self) -> &'static str {
        "Redis"
    }
}
