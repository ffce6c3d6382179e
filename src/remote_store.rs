//! Remote Store - Shared Cache Tier Client
//!
//! Wraps a [`RemoteBackend`] so that every call is bounded by a timeout and no
//! failure ever reaches the caller: reads degrade to misses, writes and deletes
//! report `false`. Failures bump an `errors` counter and are logged once per
//! availability transition instead of once per call.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{CacheError, Result};
use crate::traits::{RemoteBackend, ServerStats};

/// Snapshot of remote store counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RemoteStoreStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    pub available: bool,
}

/// Fault-absorbing client for the remote tier
pub struct RemoteStore {
    backend: Arc<dyn RemoteBackend>,
    timeout: Duration,
    /// Last observed availability; drives transition logging
    available: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
}

impl RemoteStore {
    /// Wrap a backend, bounding every call by `timeout`
    pub fn new(backend: Arc<dyn RemoteBackend>, timeout: Duration) -> Self {
        Self {
            backend,
            timeout,
            available: AtomicBool::new(true),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Name of the wrapped backend
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Get a value; any failure is a miss
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        match self.call("get", self.backend.get(key)).await {
            Ok(Some(value)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, error = %e, "[Remote] get failed, treating as miss");
                None
            }
        }
    }

    /// Get a value with its remaining lifetime (`None` = no expiry); any failure is a miss
    pub async fn get_with_ttl(&self, key: &str) -> Option<(Bytes, Option<Duration>)> {
        match self.call("get", self.backend.get_with_ttl(key)).await {
            Ok(Some(found)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(found)
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, error = %e, "[Remote] get failed, treating as miss");
                None
            }
        }
    }

    /// Store a value; `Duration::ZERO` means no expiry. Returns whether it was stored
    pub async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> bool {
        let ttl = (!ttl.is_zero()).then_some(ttl);
        match self.call("set", self.backend.set(key, value, ttl)).await {
            Ok(()) => {
                self.sets.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                debug!(key = %key, error = %e, "[Remote] set failed");
                false
            }
        }
    }

    /// Delete a key; failures report `false`
    pub async fn delete(&self, key: &str) -> bool {
        match self.call("delete", self.backend.delete(key)).await {
            Ok(existed) => {
                if existed {
                    self.deletes.fetch_add(1, Ordering::Relaxed);
                }
                existed
            }
            Err(e) => {
                debug!(key = %key, error = %e, "[Remote] delete failed");
                false
            }
        }
    }

    /// Delete every key matching a glob; failures report zero
    pub async fn delete_pattern(&self, pattern: &str) -> u64 {
        match self
            .call("delete_pattern", self.backend.delete_pattern(pattern))
            .await
        {
            Ok(count) => {
                self.deletes.fetch_add(count, Ordering::Relaxed);
                count
            }
            Err(e) => {
                debug!(pattern = %pattern, error = %e, "[Remote] pattern delete failed");
                0
            }
        }
    }

    /// Reachability probe
    pub async fn ping(&self) -> bool {
        self.call("ping", self.backend.ping()).await.is_ok()
    }

    /// Same as [`ping`](Self::ping) but keeps the error for the caller's log line
    ///
    /// # Errors
    ///
    /// Returns `RemoteUnavailable` or `Timeout` when the backend does not answer.
    pub async fn try_ping(&self) -> Result<()> {
        self.call("ping", self.backend.ping()).await
    }

    /// Flush the remote database; returns whether it succeeded
    pub async fn flush(&self) -> bool {
        self.call("flush", self.backend.flush()).await.is_ok()
    }

    /// Memory/keyspace figures, `None` when unavailable or unsupported
    pub async fn server_stats(&self) -> Option<ServerStats> {
        self.call("server_stats", self.backend.server_stats())
            .await
            .ok()
            .flatten()
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn stats(&self) -> RemoteStoreStats {
        RemoteStoreStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            available: self.is_available(),
        }
    }

    async fn call<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let outcome = match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(CacheError::RemoteUnavailable(format!("{operation}: {e:#}"))),
            Err(_) => Err(CacheError::Timeout {
                operation,
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        };

        match &outcome {
            Ok(_) => {
                if !self.available.swap(true, Ordering::Relaxed) {
                    info!(backend = self.backend.name(), "[Remote] Backend reachable again");
                }
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                if self.available.swap(false, Ordering::Relaxed) {
                    warn!(backend = self.backend.name(), error = %e, "[Remote] Backend unavailable");
                }
            }
        }
        outcome
    }
}
