//! Cache Manager - Top-Level Cache Facade
//!
//! Owns the [`CacheRouter`], builds composite keys, encodes values through the
//! codec and degrades to a bounded local overflow store (fallback mode) when the
//! remote tier cannot be initialized.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use crate::codecs::JsonCodec;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::local_store::{LocalStore, LocalStoreStats, spawn_expiry_sweep};
use crate::remote_store::{RemoteStore, RemoteStoreStats};
use crate::router::{CacheRouter, CacheStrategy};
use crate::tag_index::{TagIndex, spawn_tag_sweep};
use crate::traits::{CacheCodec, RemoteBackend, ServerStats};

/// RAII cleanup guard for in-flight request tracking
/// Ensures that entries are removed from `DashMap` even on early return or panic
struct CleanupGuard<'a> {
    map: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

/// Per-call options for [`CacheManager::set`]
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Overrides the manager's default TTL; `Duration::ZERO` means no expiry
    pub ttl: Option<Duration>,
    /// Call parameters folded into the composite key
    pub params: Option<serde_json::Value>,
    /// Tags the key is registered under for [`CacheManager::delete_by_tag`]
    pub tags: Vec<String>,
}

impl SetOptions {
    #[must_use]
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = Some(params);
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Composite cache key: `namespace:id`, or `namespace:id:<params json>` when
/// parameters are present
#[must_use]
pub fn composite_key(namespace: &str, id: &str, params: Option<&serde_json::Value>) -> String {
    match params {
        Some(serde_json::Value::Null) | None => format!("{namespace}:{id}"),
        Some(params) => format!("{namespace}:{id}:{params}"),
    }
}

/// Overall health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Result of [`CacheManager::health_check`]
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub strategy: CacheStrategy,
    pub fallback_active: bool,
    pub local_ok: bool,
    /// `None` when the strategy never touches the remote tier
    pub remote_ok: Option<bool>,
    /// Remote ping round trip, when one was made
    pub latency: Option<Duration>,
}

/// Cache manager statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub strategy: CacheStrategy,
    pub fallback_active: bool,
    /// get + set + delete calls through the manager
    pub total_ops: u64,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    /// Codec failures plus remote failures
    pub errors: u64,
    /// Percentage of gets that hit
    pub hit_rate: f64,
    pub local: LocalStoreStats,
    pub remote: Option<RemoteStoreStats>,
    pub fallback: Option<LocalStoreStats>,
    pub in_flight_requests: usize,
    /// (tag, key) memberships in the tag index
    pub tagged_keys: usize,
}

/// Top-level cache facade
///
/// **Example**:
/// ```rust
/// use tiered_query_cache::{CacheConfig, CacheManager, CacheStrategy, SetOptions};
///
/// # async fn example() -> tiered_query_cache::Result<()> {
/// let config = CacheConfig { strategy: CacheStrategy::LocalOnly, ..CacheConfig::default() };
/// let manager = CacheManager::new(&config, None).await?;
///
/// manager.set("users", "1", &"alice", SetOptions::default()).await;
/// let name: Option<String> = manager.get("users", "1", None).await;
/// assert_eq!(name.as_deref(), Some("alice"));
/// # Ok(())
/// # }
/// ```
pub struct CacheManager {
    router: CacheRouter,
    /// Overflow store serving every operation in fallback mode
    fallback: Option<Arc<LocalStore>>,
    codec: JsonCodec,
    default_ttl: Duration,

    /// tag -> composite keys, pruned as they expire
    tag_index: Arc<TagIndex>,
    /// In-flight `get_or_compute` calls, keyed by composite key
    in_flight_requests: DashMap<String, Arc<Mutex<()>>>,

    total_ops: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,

    shutdown: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl CacheManager {
    /// Build the manager, probing the remote tier when the strategy needs it
    ///
    /// A missing or unreachable remote backend never fails construction; the
    /// manager enters fallback mode instead.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Configuration` when `config` does not validate.
    pub async fn new(config: &CacheConfig, backend: Option<Arc<dyn RemoteBackend>>) -> Result<Self> {
        config.validate()?;
        let strategy = config.strategy;
        let default_ttl = config.default_ttl();
        info!(strategy = %strategy, "Initializing Cache Manager");

        let remote = match backend.filter(|_| config.remote.enabled && strategy.uses_remote()) {
            Some(backend) => {
                let store = RemoteStore::new(backend, config.remote.operation_timeout());
                match store.try_ping().await {
                    Ok(()) => {
                        info!(backend = store.backend_name(), "Remote tier connected");
                        Some(Arc::new(store))
                    }
                    Err(e) => {
                        warn!(backend = store.backend_name(), error = %e, "Remote tier initialization failed");
                        None
                    }
                }
            }
            None => None,
        };

        let (shutdown, _) = broadcast::channel(1);
        let fallback = if strategy.uses_remote() && remote.is_none() {
            let store = Arc::new(LocalStore::new(config.fallback_max_size));
            spawn_expiry_sweep(
                Arc::clone(&store),
                Duration::from_secs(config.fallback_sweep_interval_secs.max(1)),
                shutdown.subscribe(),
            );
            warn!(
                strategy = %strategy,
                max_size = config.fallback_max_size,
                "Cache Manager running in fallback mode (local overflow store only)"
            );
            Some(store)
        } else {
            None
        };

        let tag_index = Arc::new(TagIndex::new());
        spawn_tag_sweep(
            Arc::clone(&tag_index),
            Duration::from_secs(config.tag_sweep_interval_secs.max(1)),
            shutdown.subscribe(),
        );

        let router = CacheRouter::new(
            strategy,
            Arc::new(LocalStore::new(config.local_max_size)),
            remote,
            default_ttl,
        );

        Ok(Self {
            router,
            fallback,
            codec: JsonCodec,
            default_ttl,
            tag_index,
            in_flight_requests: DashMap::new(),
            total_ops: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            shutdown,
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn strategy(&self) -> CacheStrategy {
        self.router.strategy()
    }

    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    #[must_use]
    pub fn is_fallback_active(&self) -> bool {
        self.fallback.is_some()
    }

    /// Never hard down once constructed; false only after [`close`](Self::close)
    #[must_use]
    pub fn is_available(&self) -> bool {
        !self.closed.load(Ordering::Relaxed)
    }

    /// Get a value by namespace, id and optional call parameters
    ///
    /// Remote failures and undecodable payloads are misses.
    pub async fn get<T: DeserializeOwned>(
        &self,
        namespace: &str,
        id: &str,
        params: Option<&serde_json::Value>,
    ) -> Option<T> {
        self.get_by_key(&composite_key(namespace, id, params)).await
    }

    /// Store a value; returns whether at least one store accepted it
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        namespace: &str,
        id: &str,
        value: &T,
        options: SetOptions,
    ) -> bool {
        let key = composite_key(namespace, id, options.params.as_ref());
        self.set_by_key(&key, value, &options).await
    }

    pub async fn delete(&self, namespace: &str, id: &str, params: Option<&serde_json::Value>) -> bool {
        let key = composite_key(namespace, id, params);
        self.delete_by_key(&key).await
    }

    /// Delete every key of `namespace` whose id starts with `prefix`
    pub async fn delete_pattern(&self, namespace: &str, prefix: &str) -> u64 {
        let key_prefix = format!("{namespace}:{prefix}");
        let removed = match &self.fallback {
            Some(store) => store.delete_prefix(&key_prefix) as u64,
            None => self.router.delete_prefix(&key_prefix).await,
        };
        self.tag_index.remove_prefix(&key_prefix);
        self.deletes.fetch_add(removed, Ordering::Relaxed);
        debug!(namespace = %namespace, prefix = %prefix, count = removed, "Deleted keys by pattern");
        removed
    }

    /// Delete every unexpired key registered under `tag`
    pub async fn delete_by_tag(&self, tag: &str) -> u64 {
        let keys = self.tag_index.take_live(tag);
        let mut removed = 0;
        for key in &keys {
            if self.delete_by_key(key).await {
                removed += 1;
            }
        }
        debug!(tag = %tag, count = removed, "Deleted keys by tag");
        removed
    }

    /// Delete several ids of one namespace, returns how many were removed
    pub async fn batch_delete<S: AsRef<str>>(&self, namespace: &str, ids: &[S]) -> u64 {
        let results = futures_util::future::join_all(
            ids.iter().map(|id| self.delete(namespace, id.as_ref(), None)),
        )
        .await;
        results.into_iter().filter(|removed| *removed).count() as u64
    }

    /// Clear every store the manager routes to
    pub async fn flush(&self) -> bool {
        self.tag_index.clear();
        match &self.fallback {
            Some(store) => {
                store.clear();
                true
            }
            None => self.router.flush().await,
        }
    }

    /// Cache-aside read with stampede protection
    ///
    /// Concurrent misses on the same key wait for a single `compute` call; the
    /// others read the freshly cached value. Compute errors are returned as-is and
    /// nothing is cached for them.
    ///
    /// # Errors
    ///
    /// Returns whatever `compute` returns on failure.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        namespace: &str,
        id: &str,
        options: SetOptions,
        compute: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = std::result::Result<T, E>> + Send,
    {
        let key = composite_key(namespace, id, options.params.as_ref());

        // 1. Fast path
        if let Some(value) = self.get_by_key::<T>(&key).await {
            return Ok(value);
        }

        // 2. Acquire the per-key lock
        let key_lock = self
            .in_flight_requests
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = key_lock.lock().await;
        let _cleanup_guard = CleanupGuard {
            map: &self.in_flight_requests,
            key: key.clone(),
        };

        // 3. Another caller may have populated it while we waited
        if let Some(value) = self.get_by_key::<T>(&key).await {
            return Ok(value);
        }

        // 4. Compute and store
        debug!(key = %key, "Computing fresh value");
        let value = compute().await?;
        self.set_by_key(&key, &value, &options).await;
        Ok(value)
    }

    #[must_use]
    pub fn get_stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let remote = self.router.remote().map(|remote| remote.stats());
        let remote_errors = remote.map_or(0, |stats| stats.errors);
        let reads = hits + misses;

        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if reads > 0 {
            hits as f64 / reads as f64 * 100.0
        } else {
            0.0
        };

        CacheStats {
            strategy: self.strategy(),
            fallback_active: self.is_fallback_active(),
            total_ops: self.total_ops.load(Ordering::Relaxed),
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed) + remote_errors,
            hit_rate,
            local: self.router.local().stats(),
            remote,
            fallback: self.fallback.as_ref().map(|store| store.stats()),
            in_flight_requests: self.in_flight_requests.len(),
            tagged_keys: self.tag_index.len(),
        }
    }

    /// Probe the tiers and classify overall health
    pub async fn health_check(&self) -> HealthReport {
        let strategy = self.strategy();
        let fallback_active = self.is_fallback_active();

        let (remote_ok, latency) = match self.router.remote() {
            Some(remote) if !fallback_active => {
                let started = Instant::now();
                let ok = remote.ping().await;
                (Some(ok), Some(started.elapsed()))
            }
            _ if strategy.uses_remote() => (Some(false), None),
            _ => (None, None),
        };

        let status = if !self.is_available() {
            HealthStatus::Unhealthy
        } else if fallback_active {
            HealthStatus::Degraded
        } else {
            match (strategy, remote_ok) {
                (CacheStrategy::RemoteOnly, Some(false)) => HealthStatus::Unhealthy,
                (_, Some(false)) => HealthStatus::Degraded,
                _ => HealthStatus::Healthy,
            }
        };

        HealthReport {
            status,
            strategy,
            fallback_active,
            local_ok: true,
            remote_ok,
            latency,
        }
    }

    /// Memory/keyspace figures of the remote tier, when routed and exposed
    pub async fn server_stats(&self) -> Option<ServerStats> {
        if self.is_fallback_active() {
            return None;
        }
        self.router.remote()?.server_stats().await
    }

    /// Stop background tasks; later calls are no-ops
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::Relaxed) {
            let _ = self.shutdown.send(());
            info!("Cache Manager closed");
        }
    }

    async fn get_by_key<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.total_ops.fetch_add(1, Ordering::Relaxed);
        let raw = match &self.fallback {
            Some(store) => store.get(key),
            None => self.router.get(key).await,
        };

        let Some(bytes) = raw else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        match self.codec.deserialize::<T>(&bytes) {
            Ok(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Err(e) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, codec = self.codec.name(), error = %e, "Failed to decode cached value, treating as miss");
                None
            }
        }
    }

    async fn set_by_key<T: Serialize + ?Sized>(&self, key: &str, value: &T, options: &SetOptions) -> bool {
        self.total_ops.fetch_add(1, Ordering::Relaxed);
        let bytes = match self.codec.serialize(value) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, codec = self.codec.name(), error = %e, "Failed to encode value, not cached");
                return false;
            }
        };

        let ttl = options.ttl.unwrap_or(self.default_ttl);
        let stored = match &self.fallback {
            Some(store) => {
                store.set(key, bytes, ttl);
                true
            }
            None => self.router.set(key, bytes, ttl).await,
        };

        if stored {
            self.sets.fetch_add(1, Ordering::Relaxed);
            self.tag_index.register(&options.tags, key, ttl);
        }
        stored
    }

    async fn delete_by_key(&self, key: &str) -> bool {
        self.total_ops.fetch_add(1, Ordering::Relaxed);
        let removed = match &self.fallback {
            Some(store) => store.delete(key),
            None => self.router.delete(key).await,
        };
        if removed {
            self.deletes.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}
