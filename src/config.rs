//! Cache Configuration
//!
//! Every section derives `Deserialize` with `#[serde(default)]`, so a host can load
//! the whole tree from any serde source and omit what it does not care about.
//! `CacheConfig::from_env()` overlays the usual environment variables on top of the
//! defaults (`REDIS_URL` wins over the individual `REDIS_*` parts).

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};
use crate::router::CacheStrategy;

/// Root configuration for the cache subsystem
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Routing strategy, fixed for the lifetime of a manager
    pub strategy: CacheStrategy,
    /// TTL applied when a caller does not pass one, also used for fill-back
    pub default_ttl_secs: u64,
    /// Maximum number of entries in the router's local store
    pub local_max_size: usize,
    /// Maximum number of entries in the fallback overflow store
    pub fallback_max_size: usize,
    /// Interval of the expired-entry sweep on the fallback store
    pub fallback_sweep_interval_secs: u64,
    /// Interval of the sweep dropping expired keys from the tag index
    pub tag_sweep_interval_secs: u64,
    pub remote: RemoteConfig,
    pub query: QueryCacheConfig,
    pub warmup: WarmupConfig,
    pub monitoring: MonitoringConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            strategy: CacheStrategy::LocalFirst,
            default_ttl_secs: 300,
            local_max_size: 1000,
            fallback_max_size: 1000,
            fallback_sweep_interval_secs: 60,
            tag_sweep_interval_secs: 60,
            remote: RemoteConfig::default(),
            query: QueryCacheConfig::default(),
            warmup: WarmupConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Defaults overlaid with environment variables
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Configuration` when a variable is present but malformed
    /// (for example an unknown `CACHE_STRATEGY`).
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(strategy) = env_var("CACHE_STRATEGY") {
            config.strategy = strategy.parse()?;
        }
        if let Some(size) = env_parse::<usize>("CACHE_LOCAL_MAX_SIZE")? {
            config.local_max_size = size;
        }
        if let Some(ttl) = env_parse::<u64>("CACHE_DEFAULT_TTL_SECS")? {
            config.default_ttl_secs = ttl;
        }
        if let Some(enabled) = env_parse::<bool>("CACHE_WARMUP_ENABLED")? {
            config.warmup.enabled = enabled;
        }

        config.remote.url = env_var("REDIS_URL");
        if let Some(host) = env_var("REDIS_HOST") {
            config.remote.host = host;
        }
        if let Some(port) = env_parse::<u16>("REDIS_PORT")? {
            config.remote.port = port;
        }
        config.remote.password = env_var("REDIS_PASSWORD");
        if let Some(db) = env_parse::<i64>("REDIS_DB")? {
            config.remote.database = db;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make a component unusable
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Configuration` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.local_max_size == 0 {
            return Err(CacheError::config("local_max_size must be greater than 0"));
        }
        if self.fallback_max_size == 0 {
            return Err(CacheError::config("fallback_max_size must be greater than 0"));
        }
        if self.warmup.max_concurrency == 0 {
            return Err(CacheError::config("warmup.max_concurrency must be greater than 0"));
        }
        if self.warmup.batch_size == 0 {
            return Err(CacheError::config("warmup.batch_size must be greater than 0"));
        }
        if self.monitoring.interval_secs == 0 {
            return Err(CacheError::config("monitoring.interval_secs must be greater than 0"));
        }
        Ok(())
    }

    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

/// Connection parameters for the remote tier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Set to false to run without a remote tier (forces fallback for remote strategies)
    pub enabled: bool,
    /// Full connection URL; takes precedence over host/port/password/database
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub database: i64,
    /// Upper bound on a single remote call
    pub operation_timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: None,
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            database: 0,
            operation_timeout_ms: 2000,
        }
    }
}

impl RemoteConfig {
    /// Connection URL assembled from the configured parts
    #[must_use]
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        match &self.password {
            Some(password) => format!(
                "redis://:{password}@{}:{}/{}",
                self.host, self.port, self.database
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.database),
        }
    }

    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// How event/table invalidation removes query results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationScope {
    /// Only the entries of the matching query types
    #[default]
    Scoped,
    /// The whole query namespace, whatever the matching types are
    Namespace,
}

/// Query cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryCacheConfig {
    /// TTL for statements that match no configured query type
    pub default_ttl_secs: u64,
    pub invalidation_scope: InvalidationScope,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            invalidation_scope: InvalidationScope::Scoped,
        }
    }
}

/// Warmup scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmupConfig {
    pub enabled: bool,
    /// Run once as soon as the scheduler starts
    pub on_startup: bool,
    pub interval_secs: u64,
    /// Ceiling on loaders executing at the same time within a batch
    pub max_concurrency: usize,
    pub batch_size: usize,
    pub max_retries: u32,
    /// Base delay; attempt `n` waits `retry_delay * n`
    pub retry_delay_ms: u64,
    /// Loader type to cache namespace; unmapped types land in `fallback_namespace`
    pub namespaces: HashMap<String, String>,
    pub fallback_namespace: String,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        let namespaces = [
            ("popular_tests", "test_results"),
            ("recent_results", "test_results"),
            ("test_history", "test_history"),
            ("user_preferences", "user_data"),
            ("active_users", "user_data"),
            ("system_config", "configuration"),
            ("dashboard_stats", "statistics"),
        ]
        .into_iter()
        .map(|(ty, ns)| (ty.to_string(), ns.to_string()))
        .collect();

        Self {
            enabled: true,
            on_startup: true,
            interval_secs: 3600,
            max_concurrency: 5,
            batch_size: 50,
            max_retries: 3,
            retry_delay_ms: 1000,
            namespaces,
            fallback_namespace: "temporary".to_string(),
        }
    }
}

impl WarmupConfig {
    /// Namespace warmed entries of `task_type` are written to
    #[must_use]
    pub fn namespace_for(&self, task_type: &str) -> &str {
        self.namespaces
            .get(task_type)
            .map_or(self.fallback_namespace.as_str(), String::as_str)
    }
}

/// Alert thresholds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// Alert above this round-trip latency (ms)
    pub response_time_ms: f64,
    /// Alert above this remote memory usage (%)
    pub memory_usage_percent: f64,
    /// Alert below this hit rate (%)
    pub hit_rate_percent: f64,
    /// Alert above this error rate (%)
    pub error_rate_percent: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            response_time_ms: 100.0,
            memory_usage_percent: 80.0,
            hit_rate_percent: 70.0,
            error_rate_percent: 5.0,
        }
    }
}

/// Monitoring service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub alert_check_interval_secs: u64,
    pub retention_secs: u64,
    pub baseline_interval_secs: u64,
    pub alert_history_capacity: usize,
    /// Re-crossing within this window after a resolution is logged quietly
    pub alert_cooldown_secs: u64,
    pub thresholds: AlertThresholds,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            alert_check_interval_secs: 60,
            retention_secs: 24 * 3600,
            baseline_interval_secs: 3600,
            alert_history_capacity: 100,
            alert_cooldown_secs: 300,
            thresholds: AlertThresholds::default(),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env_var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| CacheError::config(format!("invalid value for {name}: '{raw}'"))),
        None => Ok(None),
    }
}
