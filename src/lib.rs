//! Tiered Query Cache
//!
//! A multi-tier cache layer in front of a relational data store featuring:
//! - **Strategy Routing**: `LocalOnly`, `RemoteOnly`, `LocalFirst`, `RemoteFirst` over an
//!   in-process store and a shared remote store (Redis), with read fill-back
//! - **Fallback Mode**: transparent local-only operation when the remote tier is down at startup
//! - **Query Cache**: fingerprinted result caching with per-type TTL and event/table invalidation
//! - **Warmup**: prioritized, batched, concurrency-bounded loaders with retry
//! - **Monitoring**: sampled health metrics, threshold alerts, trends and a rolling baseline
//! - **Cache Stampede Protection**: per-key request coalescing in `get_or_compute`
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use tiered_query_cache::{CacheSystemBuilder, SetOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = CacheSystemBuilder::from_env()?.build().await?;
//!
//!     let data = serde_json::json!({"user": "alice", "score": 100});
//!     cache.set("users", "1", &data, SetOptions::default()).await;
//!
//!     if let Some(cached) = cache.get::<serde_json::Value>("users", "1", None).await {
//!         tracing::info!("Cached data: {}", cached);
//!     }
//!
//!     let stats = cache.get_stats();
//!     tracing::info!("Hit rate: {:.2}%", stats.cache.hit_rate);
//!
//!     cache.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! QueryCache ─┐
//! Warmup ─────┼─→ CacheManager ─→ CacheRouter ─→ LocalStore + RemoteStore
//! Monitoring ─┘        │
//!                      └─ fallback mode ─→ overflow LocalStore
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub mod backends;
pub mod builder;
pub mod cache_manager;
pub mod codecs;
pub mod config;
pub mod error;
pub mod local_store;
pub mod monitoring;
pub mod query_cache;
pub mod remote_store;
pub mod router;
mod tag_index;
pub mod traits;
pub mod warmup;

pub use backends::MemoryBackend;
#[cfg(feature = "redis")]
pub use backends::RedisBackend;
pub use builder::CacheSystemBuilder;
pub use cache_manager::{CacheManager, CacheStats, HealthReport, HealthStatus, SetOptions, composite_key};
pub use codecs::JsonCodec;
pub use config::{
    AlertThresholds, CacheConfig, InvalidationScope, MonitoringConfig, QueryCacheConfig,
    RemoteConfig, WarmupConfig,
};
pub use error::{CacheError, Result};
pub use local_store::{LocalStore, LocalStoreStats};
pub use monitoring::{
    AlertRecord, AlertSeverity, MetricSummary, MetricType, MonitoringReport, MonitoringService,
    Trend,
};
pub use query_cache::{
    BatchQuery, QueryCache, QueryCacheStats, QueryOptions, QueryResult, QueryTypeConfig,
};
pub use remote_store::{RemoteStore, RemoteStoreStats};
pub use router::{CacheRouter, CacheStrategy};
pub use traits::{CacheCodec, DataLoader, QueryExecutor, QueryOutput, RemoteBackend, ServerStats};
pub use warmup::{TaskOutcome, WarmupPriority, WarmupReport, WarmupScheduler, WarmupStats};

// Re-export async_trait for user convenience
pub use async_trait::async_trait;

/// Combined statistics of every component
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub cache: CacheStats,
    pub query: Option<QueryCacheStats>,
    pub warmup: WarmupStats,
}

/// Main entry point: the cache manager plus the services built on it
///
/// Constructed once at process start by [`CacheSystemBuilder`] and passed to
/// consumers by handle; clones share the same components.
#[derive(Clone)]
pub struct CacheSystem {
    cache_manager: Arc<CacheManager>,
    query_cache: Option<Arc<QueryCache>>,
    warmup: Arc<WarmupScheduler>,
    monitoring: Arc<MonitoringService>,
    shutdown: broadcast::Sender<()>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    closed: Arc<AtomicBool>,
}

impl CacheSystem {
    /// Build with [`CacheConfig::from_env`], connecting to Redis via `REDIS_URL`
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Configuration` for malformed environment variables.
    pub async fn new() -> Result<Self> {
        CacheSystemBuilder::from_env()?.build().await
    }

    pub(crate) fn from_parts(
        cache_manager: Arc<CacheManager>,
        query_cache: Option<Arc<QueryCache>>,
        warmup: Arc<WarmupScheduler>,
        monitoring: Arc<MonitoringService>,
        shutdown: broadcast::Sender<()>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            cache_manager,
            query_cache,
            warmup,
            monitoring,
            shutdown,
            tasks: Arc::new(Mutex::new(tasks)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get reference to cache manager (primary interface)
    #[must_use]
    pub fn cache_manager(&self) -> &Arc<CacheManager> {
        &self.cache_manager
    }

    /// `None` when the system was built without a query executor
    #[must_use]
    pub fn query_cache(&self) -> Option<&Arc<QueryCache>> {
        self.query_cache.as_ref()
    }

    #[must_use]
    pub fn warmup(&self) -> &Arc<WarmupScheduler> {
        &self.warmup
    }

    #[must_use]
    pub fn monitoring(&self) -> &Arc<MonitoringService> {
        &self.monitoring
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        namespace: &str,
        id: &str,
        params: Option<&serde_json::Value>,
    ) -> Option<T> {
        self.cache_manager.get(namespace, id, params).await
    }

    pub async fn set<T: Serialize + ?Sized>(
        &self,
        namespace: &str,
        id: &str,
        value: &T,
        options: SetOptions,
    ) -> bool {
        self.cache_manager.set(namespace, id, value, options).await
    }

    pub async fn delete(&self, namespace: &str, id: &str, params: Option<&serde_json::Value>) -> bool {
        self.cache_manager.delete(namespace, id, params).await
    }

    pub async fn delete_pattern(&self, namespace: &str, prefix: &str) -> u64 {
        self.cache_manager.delete_pattern(namespace, prefix).await
    }

    pub async fn delete_by_tag(&self, tag: &str) -> u64 {
        self.cache_manager.delete_by_tag(tag).await
    }

    pub async fn batch_delete<S: AsRef<str>>(&self, namespace: &str, ids: &[S]) -> u64 {
        self.cache_manager.batch_delete(namespace, ids).await
    }

    /// # Errors
    ///
    /// `QueryExecution` from the executor, `Configuration` when no executor was configured.
    pub async fn query(
        &self,
        sql: &str,
        params: &[serde_json::Value],
        options: QueryOptions,
    ) -> Result<QueryResult> {
        self.require_query_cache()?.query(sql, params, options).await
    }

    /// # Errors
    ///
    /// `Configuration` when no executor was configured; per-query errors are in the results.
    pub async fn batch_query(
        &self,
        queries: &[BatchQuery],
        options: QueryOptions,
    ) -> Result<Vec<Result<QueryResult>>> {
        Ok(self.require_query_cache()?.batch_query(queries, options).await)
    }

    /// # Errors
    ///
    /// `Configuration` when no executor was configured.
    pub async fn invalidate_cache(&self, pattern: &str) -> Result<u64> {
        Ok(self.require_query_cache()?.invalidate_cache(pattern).await)
    }

    /// # Errors
    ///
    /// `Configuration` when no executor was configured.
    pub async fn invalidate_by_event(&self, event: &str) -> Result<u64> {
        Ok(self.require_query_cache()?.invalidate_by_event(event).await)
    }

    /// # Errors
    ///
    /// `Configuration` when no executor was configured.
    pub async fn invalidate_by_table(&self, table: &str) -> Result<u64> {
        Ok(self.require_query_cache()?.invalidate_by_table(table).await)
    }

    /// `None` when a run is already in progress
    pub async fn perform_warmup(&self) -> Option<WarmupReport> {
        self.warmup.perform_warmup().await
    }

    /// # Errors
    ///
    /// `Configuration` for an unknown type, `LoaderFailure` when retries are exhausted.
    pub async fn warmup_type(&self, name: &str) -> Result<TaskOutcome> {
        self.warmup.warmup_type(name).await
    }

    #[must_use]
    pub fn get_stats(&self) -> SystemStats {
        SystemStats {
            cache: self.cache_manager.get_stats(),
            query: self.query_cache.as_ref().map(|q| q.stats()),
            warmup: self.warmup.stats(),
        }
    }

    /// # Errors
    ///
    /// `Configuration` when `period` does not parse.
    pub fn get_monitoring_report(&self, period: &str) -> Result<MonitoringReport> {
        self.monitoring.get_monitoring_report(period)
    }

    #[must_use]
    pub fn get_alert_history(&self, limit: usize) -> Vec<AlertRecord> {
        self.monitoring.get_alert_history(limit)
    }

    pub async fn flush(&self) -> bool {
        self.cache_manager.flush().await
    }

    pub async fn health_check(&self) -> HealthReport {
        let report = self.cache_manager.health_check().await;
        match report.status {
            HealthStatus::Healthy => info!(strategy = %report.strategy, "Cache health check passed"),
            status => warn!(
                strategy = %report.strategy,
                status = ?status,
                fallback_active = report.fallback_active,
                "Cache health check - degraded"
            ),
        }
        report
    }

    /// Stop every background timer and release the manager; later calls are no-ops
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(());
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.cache_manager.close();
        info!("Cache system closed");
    }

    fn require_query_cache(&self) -> Result<&Arc<QueryCache>> {
        self.query_cache
            .as_ref()
            .ok_or_else(|| CacheError::config("no query executor configured"))
    }
}
