//! Cache System Builder
//!
//! Wires configuration, the remote backend, the query executor and warmup loaders
//! into a [`CacheSystem`].
//!
//! # Example: Defaults From the Environment
//!
//! ```rust,no_run
//! use tiered_query_cache::CacheSystemBuilder;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = CacheSystemBuilder::from_env()?.build().await?;
//!     cache.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Example: Custom Remote Backend
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tiered_query_cache::{CacheSystemBuilder, CacheStrategy};
//!
//! let cache = CacheSystemBuilder::new()
//!     .with_strategy(CacheStrategy::RemoteFirst)
//!     .with_remote(Arc::new(MyDistributedCache::new()))
//!     .with_executor(Arc::new(MyDatabase::new()))
//!     .build()
//!     .await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::info;
#[cfg(feature = "redis")]
use tracing::warn;

use crate::cache_manager::CacheManager;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::monitoring::MonitoringService;
use crate::query_cache::{QueryCache, QueryTypeConfig};
use crate::router::CacheStrategy;
use crate::traits::{DataLoader, QueryExecutor, RemoteBackend};
use crate::warmup::{WarmupPriority, WarmupScheduler};
use crate::CacheSystem;

struct LoaderRegistration {
    name: String,
    priority: WarmupPriority,
    ttl: Duration,
    loader: Arc<dyn DataLoader>,
}

/// Builder for constructing [`CacheSystem`]
///
/// # Default Behavior
///
/// If no remote backend is provided and the strategy needs one, `build()`
/// connects to Redis with the configured connection parameters (feature
/// `redis`). A failed connection does not fail the build; the manager starts in
/// fallback mode.
pub struct CacheSystemBuilder {
    config: CacheConfig,
    remote: Option<Arc<dyn RemoteBackend>>,
    executor: Option<Arc<dyn QueryExecutor>>,
    query_types: Option<Vec<QueryTypeConfig>>,
    loaders: Vec<LoaderRegistration>,
    background_tasks: bool,
}

impl CacheSystemBuilder {
    /// Create a builder with the default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    /// Create a builder from [`CacheConfig::from_env`]
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Configuration` when an environment variable is malformed.
    pub fn from_env() -> Result<Self> {
        Ok(Self::with_config(CacheConfig::from_env()?))
    }

    #[must_use]
    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            config,
            remote: None,
            executor: None,
            query_types: None,
            loaders: Vec::new(),
            background_tasks: true,
        }
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    /// Use this backend for the remote tier instead of connecting to Redis
    #[must_use]
    pub fn with_remote(mut self, backend: Arc<dyn RemoteBackend>) -> Self {
        self.remote = Some(backend);
        self
    }

    /// The executor the query cache wraps
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn QueryExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Replace the built-in query types
    #[must_use]
    pub fn with_query_types(mut self, query_types: Vec<QueryTypeConfig>) -> Self {
        self.query_types = Some(query_types);
        self
    }

    /// Register a warmup loader
    #[must_use]
    pub fn with_loader<L>(mut self, name: impl Into<String>, priority: WarmupPriority, ttl: Duration, loader: L) -> Self
    where
        L: DataLoader + 'static,
    {
        self.loaders.push(LoaderRegistration {
            name: name.into(),
            priority,
            ttl,
            loader: Arc::new(loader),
        });
        self
    }

    /// Whether `build()` starts the warmup and monitoring timers (default true)
    #[must_use]
    pub fn background_tasks(mut self, enabled: bool) -> Self {
        self.background_tasks = enabled;
        self
    }

    /// Build the [`CacheSystem`]
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Configuration` when the configuration does not validate.
    /// Remote connection failures never fail the build.
    pub async fn build(self) -> Result<CacheSystem> {
        info!(strategy = %self.config.strategy, "Building cache system");
        self.config.validate()?;

        let remote = match self.remote {
            Some(backend) => Some(backend),
            None => Self::connect_default_remote(&self.config).await,
        };

        let manager = Arc::new(CacheManager::new(&self.config, remote).await?);

        let query_cache = self.executor.map(|executor| {
            let cache = QueryCache::new(Arc::clone(&manager), executor, &self.config.query);
            let cache = match self.query_types {
                Some(types) => cache.with_query_types(types),
                None => cache,
            };
            Arc::new(cache)
        });

        let warmup = Arc::new(WarmupScheduler::new(
            Arc::clone(&manager),
            self.config.warmup.clone(),
        ));
        for registration in self.loaders {
            warmup.register_loader(
                registration.name,
                registration.priority,
                registration.ttl,
                registration.loader,
            );
        }

        let monitoring = Arc::new(MonitoringService::new(
            Arc::clone(&manager),
            self.config.monitoring.clone(),
        ));

        let (shutdown, _) = broadcast::channel(4);
        let mut tasks = Vec::new();
        if self.background_tasks {
            tasks.extend(warmup.start(shutdown.subscribe()));
            tasks.extend(monitoring.start(&shutdown));
        }

        info!(
            fallback_active = manager.is_fallback_active(),
            query_cache = query_cache.is_some(),
            background_tasks = tasks.len(),
            "Cache system built successfully"
        );

        Ok(CacheSystem::from_parts(
            manager,
            query_cache,
            warmup,
            monitoring,
            shutdown,
            tasks,
        ))
    }

    #[cfg(feature = "redis")]
    async fn connect_default_remote(config: &CacheConfig) -> Option<Arc<dyn RemoteBackend>> {
        if !config.remote.enabled || !config.strategy.uses_remote() {
            return None;
        }
        match crate::backends::RedisBackend::connect(&config.remote).await {
            Ok(backend) => Some(Arc::new(backend)),
            Err(e) => {
                warn!(error = %e, "Redis connection failed, continuing without remote tier");
                None
            }
        }
    }

    #[cfg(not(feature = "redis"))]
    async fn connect_default_remote(_config: &CacheConfig) -> Option<Arc<dyn RemoteBackend>> {
        None
    }
}

impl Default for CacheSystemBuilder {
    fn default() -> Self {
        Self::new()
    }
}
