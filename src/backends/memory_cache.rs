//! Memory Backend - In-Process Stand-In for the Remote Tier
//!
//! A `DashMap`-backed implementation of [`RemoteBackend`]. It behaves like a
//! shared cache server (TTL, glob pattern delete, flush, keyspace stats) but lives
//! in the current process, which makes it useful for single-node deployments and
//! for exercising every routing strategy without a Redis server.
//!
//! The backend can be switched offline and given artificial latency to simulate
//! outages and slow networks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::traits::{RemoteBackend, ServerStats};

/// Cache entry with expiration tracking
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: Bytes, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| Instant::now() > expires_at)
    }
}

/// Concurrent in-memory remote backend
///
/// **Example**:
/// ```rust
/// use tiered_query_cache::backends::MemoryBackend;
/// use tiered_query_cache::RemoteBackend;
/// use bytes::Bytes;
///
/// # async fn example() -> anyhow::Result<()> {
/// let backend = MemoryBackend::new();
/// backend.set("user:1", Bytes::from_static(b"alice"), None).await?;
/// assert_eq!(backend.get("user:1").await?, Some(Bytes::from_static(b"alice")));
///
/// backend.set_online(false);
/// assert!(backend.get("user:1").await.is_err());
/// # Ok(())
/// # }
/// ```
pub struct MemoryBackend {
    map: DashMap<String, CacheEntry>,
    online: AtomicBool,
    latency_ms: AtomicU64,
    /// Reported memory ceiling in bytes, `0` for unbounded
    max_memory: AtomicU64,
}

impl MemoryBackend {
    /// Create an empty, online backend
    pub fn new() -> Self {
        info!("Initializing in-memory remote backend (DashMap)");

        Self {
            map: DashMap::new(),
            online: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            max_memory: AtomicU64::new(0),
        }
    }

    /// Report a memory ceiling so usage percentages can be derived
    #[must_use]
    pub fn with_memory_limit(self, bytes: u64) -> Self {
        self.max_memory.store(bytes, Ordering::Relaxed);
        self
    }

    /// Simulate an outage (`false`) or a recovery (`true`)
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }

    /// Delay applied before every operation
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(
            u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    /// Number of stored entries, expired ones included until they are touched
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Whether `key` holds a live value, bypassing availability and latency
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.map.get(key).is_some_and(|entry| !entry.is_expired())
    }

    /// Remaining lifetime of `key`, like Redis `PTTL`
    ///
    /// `None` when the key is missing, expired or has no expiry.
    #[must_use]
    pub fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        let entry = self.map.get(key)?;
        let expires_at = entry.expires_at?;
        expires_at.checked_duration_since(Instant::now())
    }

    async fn enter(&self) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.online.load(Ordering::Relaxed) {
            bail!("memory backend is offline");
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GlobToken {
    Star,
    AnyChar,
    Literal(char),
}

fn glob_tokens(pattern: &str) -> Vec<GlobToken> {
    let mut tokens = Vec::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        tokens.push(match c {
            '*' => GlobToken::Star,
            '?' => GlobToken::AnyChar,
            // a trailing backslash matches itself
            '\\' => GlobToken::Literal(chars.next().unwrap_or('\\')),
            c => GlobToken::Literal(c),
        });
    }
    tokens
}

/// Glob match in the Redis `MATCH` dialect, limited to `*`, `?` and `\` escapes
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let p = glob_tokens(pattern);
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        match p.get(pi) {
            Some(GlobToken::Star) => {
                star = Some((pi, ti));
                pi += 1;
            }
            Some(GlobToken::AnyChar) => {
                pi += 1;
                ti += 1;
            }
            Some(&GlobToken::Literal(c)) if Some(&c) == t.get(ti) => {
                pi += 1;
                ti += 1;
            }
            _ => match star {
                Some((star_pi, star_ti)) => {
                    pi = star_pi + 1;
                    ti = star_ti + 1;
                    star = Some((star_pi, star_ti + 1));
                }
                None => return false,
            },
        }
    }
    p.get(pi..)
        .is_some_and(|rest| rest.iter().all(|&token| token == GlobToken::Star))
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.enter().await?;
        let expired = match self.map.get(key) {
            Some(entry) if !entry.is_expired() => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.map.remove(key);
        }
        Ok(None)
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<(Bytes, Option<Duration>)>> {
        self.enter().await?;
        let now = Instant::now();
        let Some(entry) = self.map.get(key).map(|entry| entry.value().clone()) else {
            return Ok(None);
        };
        match entry.expires_at {
            Some(expires_at) if now > expires_at => {
                self.map.remove(key);
                Ok(None)
            }
            Some(expires_at) => Ok(Some((entry.value, Some(expires_at - now)))),
            None => Ok(Some((entry.value, None))),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        self.enter().await?;
        self.map.insert(key.to_string(), CacheEntry::new(value, ttl));
        debug!(key = %key, ttl = ?ttl, "[Memory] Cached key");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.enter().await?;
        Ok(self.map.remove(key).is_some())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64> {
        self.enter().await?;
        let before = self.map.len();
        self.map.retain(|key, _| !glob_match(pattern, key));
        let removed = before.saturating_sub(self.map.len()) as u64;
        debug!(pattern = %pattern, count = removed, "[Memory] Removed keys matching pattern");
        Ok(removed)
    }

    async fn ping(&self) -> Result<()> {
        self.enter().await
    }

    async fn flush(&self) -> Result<()> {
        self.enter().await?;
        self.map.clear();
        Ok(())
    }

    async fn server_stats(&self) -> Result<Option<ServerStats>> {
        self.enter().await?;
        self.map.retain(|_, entry| !entry.is_expired());
        let used_memory = self
            .map
            .iter()
            .map(|entry| (entry.key().len() + entry.value().value.len()) as u64)
            .sum();
        Ok(Some(ServerStats {
            used_memory,
            max_memory: self.max_memory.load(Ordering::Relaxed),
            total_keys: self.map.len() as u64,
        }))
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}
