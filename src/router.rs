//! Cache Router - Strategy-Routed Two-Tier Access
//!
//! Routes `get`/`set`/`delete` across the [`LocalStore`] and an optional
//! [`RemoteStore`] according to a [`CacheStrategy`] chosen once at construction.
//!
//! ```text
//! LocalFirst:  get → Local → Remote (hit: fill Local)      set/delete → both, joined
//! RemoteFirst: get → Remote → Local (hit: fill Remote)     set/delete → both, joined
//! LocalOnly:   Local only
//! RemoteOnly:  Remote only, failures read as absent/false
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CacheError;
use crate::local_store::LocalStore;
use crate::remote_store::RemoteStore;

/// Routing policy between the local and remote tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    /// Local store only
    LocalOnly,
    /// Remote store only, no silent promotion to local on failure
    RemoteOnly,
    /// Local, then remote with fill-back into local
    #[default]
    LocalFirst,
    /// Remote, then local with fill-back into remote
    RemoteFirst,
}

impl CacheStrategy {
    /// Whether routing touches the remote tier at all
    #[must_use]
    pub fn uses_remote(self) -> bool {
        !matches!(self, Self::LocalOnly)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LocalOnly => "local_only",
            Self::RemoteOnly => "remote_only",
            Self::LocalFirst => "local_first",
            Self::RemoteFirst => "remote_first",
        }
    }
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheStrategy {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "local_only" | "local" => Ok(Self::LocalOnly),
            "remote_only" | "remote" => Ok(Self::RemoteOnly),
            "local_first" => Ok(Self::LocalFirst),
            "remote_first" => Ok(Self::RemoteFirst),
            other => Err(CacheError::config(format!("unknown cache strategy '{other}'"))),
        }
    }
}

/// Applies one [`CacheStrategy`] to a local and a remote store
pub struct CacheRouter {
    strategy: CacheStrategy,
    local: Arc<LocalStore>,
    remote: Option<Arc<RemoteStore>>,
    /// TTL used when filling one tier back from the other
    fill_ttl: Duration,
}

impl CacheRouter {
    /// Create a router; `remote = None` makes remote operations miss/fail
    pub fn new(
        strategy: CacheStrategy,
        local: Arc<LocalStore>,
        remote: Option<Arc<RemoteStore>>,
        fill_ttl: Duration,
    ) -> Self {
        Self {
            strategy,
            local,
            remote,
            fill_ttl,
        }
    }

    #[must_use]
    pub fn strategy(&self) -> CacheStrategy {
        self.strategy
    }

    #[must_use]
    pub fn local(&self) -> &Arc<LocalStore> {
        &self.local
    }

    #[must_use]
    pub fn remote(&self) -> Option<&Arc<RemoteStore>> {
        self.remote.as_ref()
    }

    /// Read a key; a copy filled into the other tier never outlives its source
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        match self.strategy {
            CacheStrategy::LocalOnly => self.local.get(key),
            CacheStrategy::RemoteOnly => self.remote_get(key).await,
            CacheStrategy::LocalFirst => {
                if let Some(value) = self.local.get(key) {
                    return Some(value);
                }
                let (value, remaining) = self.remote.as_ref()?.get_with_ttl(key).await?;
                if let Some(ttl) = self.fill_ttl_for(remaining) {
                    self.local.set(key, value.clone(), ttl);
                    debug!(key = %key, ttl = ?ttl, "[Router] Filled local from remote");
                }
                Some(value)
            }
            CacheStrategy::RemoteFirst => {
                if let Some(value) = self.remote_get(key).await {
                    return Some(value);
                }
                let (value, remaining) = self.local.get_with_ttl(key)?;
                if let (Some(remote), Some(ttl)) = (&self.remote, self.fill_ttl_for(remaining)) {
                    if remote.set(key, value.clone(), ttl).await {
                        debug!(key = %key, ttl = ?ttl, "[Router] Filled remote from local");
                    }
                }
                Some(value)
            }
        }
    }

    /// TTL for a fill-back copy, capped at the source's remaining lifetime
    ///
    /// `None` skips the fill: the source is on its last instant.
    fn fill_ttl_for(&self, remaining: Option<Duration>) -> Option<Duration> {
        match remaining {
            None => Some(self.fill_ttl),
            Some(remaining) if remaining.is_zero() => None,
            Some(remaining) if self.fill_ttl.is_zero() => Some(remaining),
            Some(remaining) => Some(remaining.min(self.fill_ttl)),
        }
    }

    /// Store a value; returns whether at least one routed store accepted it
    pub async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> bool {
        match self.strategy {
            CacheStrategy::LocalOnly => {
                self.local.set(key, value, ttl);
                true
            }
            CacheStrategy::RemoteOnly => self.remote_set(key, value, ttl).await,
            CacheStrategy::LocalFirst | CacheStrategy::RemoteFirst => {
                let local = async {
                    self.local.set(key, value.clone(), ttl);
                    true
                };
                let (local_ok, remote_ok) =
                    future::join(local, self.remote_set(key, value.clone(), ttl)).await;
                local_ok || remote_ok
            }
        }
    }

    /// Delete a key; returns whether at least one routed store removed it
    pub async fn delete(&self, key: &str) -> bool {
        match self.strategy {
            CacheStrategy::LocalOnly => self.local.delete(key),
            CacheStrategy::RemoteOnly => self.remote_delete(key).await,
            CacheStrategy::LocalFirst | CacheStrategy::RemoteFirst => {
                let local = async { self.local.delete(key) };
                let (local_ok, remote_ok) = future::join(local, self.remote_delete(key)).await;
                local_ok || remote_ok
            }
        }
    }

    /// Delete every key starting with `prefix` in the routed stores
    pub async fn delete_prefix(&self, prefix: &str) -> u64 {
        let local = async {
            if matches!(self.strategy, CacheStrategy::RemoteOnly) {
                0
            } else {
                self.local.delete_prefix(prefix) as u64
            }
        };
        let remote = async {
            match (&self.remote, self.strategy.uses_remote()) {
                (Some(remote), true) => {
                    remote
                        .delete_pattern(&format!("{}*", escape_glob(prefix)))
                        .await
                }
                _ => 0,
            }
        };
        let (local_count, remote_count) = future::join(local, remote).await;
        local_count.max(remote_count)
    }

    /// Clear both tiers; returns whether every routed store was flushed
    pub async fn flush(&self) -> bool {
        self.local.clear();
        match (&self.remote, self.strategy.uses_remote()) {
            (Some(remote), true) => remote.flush().await,
            _ => true,
        }
    }

    async fn remote_get(&self, key: &str) -> Option<Bytes> {
        match &self.remote {
            Some(remote) => remote.get(key).await,
            None => None,
        }
    }

    async fn remote_set(&self, key: &str, value: Bytes, ttl: Duration) -> bool {
        match &self.remote {
            Some(remote) => remote.set(key, value, ttl).await,
            None => false,
        }
    }

    async fn remote_delete(&self, key: &str) -> bool {
        match &self.remote {
            Some(remote) => remote.delete(key).await,
            None => false,
        }
    }
}

/// Escape glob metacharacters so `prefix` matches literally in a `MATCH` pattern
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
