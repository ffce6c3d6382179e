//! Query Cache - Fingerprinted Result Caching in Front of the Query Executor
//!
//! Read-only statements are fingerprinted (normalized SQL + parameters), classified
//! into a query type that decides TTL and invalidation triggers, and cached under
//! the `db_queries` namespace. Mutating statements always reach the executor and
//! are never cached.
//!
//! Entries are stored under the id `<query_type>:query:<sha256>` and tagged
//! `query_type:<query_type>`, so an event or table change can drop just the types
//! it affects.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::cache_manager::{CacheManager, SetOptions};
use crate::config::{InvalidationScope, QueryCacheConfig};
use crate::error::{CacheError, Result};
use crate::traits::QueryExecutor;

/// Namespace every query result lives in
pub const QUERY_NAMESPACE: &str = "db_queries";

/// Type assigned to statements that match no configured table
pub const DEFAULT_QUERY_TYPE: &str = "default";

const MUTATING_VERBS: [&str; 7] = [
    "insert", "update", "delete", "create", "drop", "alter", "truncate",
];

/// TTL and invalidation triggers of one query type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryTypeConfig {
    pub name: String,
    pub ttl: Duration,
    /// Table names that classify a statement into this type
    pub tables: Vec<String>,
    /// Events that invalidate this type
    pub invalidate_on_events: Vec<String>,
}

impl QueryTypeConfig {
    /// Table names are lowercased to match normalized SQL
    pub fn new(name: &str, ttl_secs: u64, tables: &[&str], events: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            ttl: Duration::from_secs(ttl_secs),
            tables: tables.iter().map(|t| t.to_lowercase()).collect(),
            invalidate_on_events: events.iter().map(ToString::to_string).collect(),
        }
    }

    fn lowercase_tables(mut self) -> Self {
        for table in &mut self.tables {
            *table = table.to_lowercase();
        }
        self
    }
}

/// Built-in query types, in classification order (first match wins)
#[must_use]
pub fn default_query_types() -> Vec<QueryTypeConfig> {
    vec![
        QueryTypeConfig::new(
            "test_results",
            600,
            &["test_results", "test_executions"],
            &["test_completed", "test_deleted"],
        ),
        QueryTypeConfig::new(
            "test_history",
            1800,
            &["test_history", "test_runs"],
            &["test_completed", "test_deleted"],
        ),
        QueryTypeConfig::new(
            "user_data",
            300,
            &["users", "user_preferences", "user_sessions"],
            &["user_updated", "user_deleted"],
        ),
        QueryTypeConfig::new(
            "configuration",
            3600,
            &["system_config", "settings"],
            &["config_updated"],
        ),
        QueryTypeConfig::new(
            "statistics",
            900,
            &["statistics", "dashboard_stats", "metrics"],
            &["test_completed", "stats_refreshed"],
        ),
    ]
}

/// Per-call options for [`QueryCache::query`]
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    /// Bypass the cache read; a successful read-only result still refreshes the entry
    pub skip_cache: bool,
    /// Overrides the query type's TTL
    pub ttl: Option<Duration>,
}

/// What is stored for a cached query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryCacheRecord {
    pub fingerprint: String,
    pub rows: Vec<serde_json::Value>,
    pub row_count: u64,
    pub query_type: String,
    pub timestamp: DateTime<Utc>,
}

/// Result returned to callers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub rows: Vec<serde_json::Value>,
    pub row_count: u64,
    pub cached: bool,
    pub query_type: String,
    pub fingerprint: String,
}

/// One entry of a [`QueryCache::batch_query`] call
#[derive(Debug, Clone)]
pub struct BatchQuery {
    pub sql: String,
    pub params: Vec<serde_json::Value>,
}

impl BatchQuery {
    pub fn new(sql: impl Into<String>, params: Vec<serde_json::Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Running query cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct QueryCacheStats {
    pub total_queries: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Executor calls for statements that were not cached because they mutate
    pub mutating_queries: u64,
    pub executor_errors: u64,
    /// Mean executor latency in milliseconds
    pub avg_query_time_ms: f64,
    /// Mean latency of cache hits in milliseconds
    pub avg_cache_time_ms: f64,
}

impl QueryCacheStats {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        if self.total_queries == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.total_queries as f64 * 100.0
        }
    }
}

/// `avg_n = (avg_{n-1} * (n-1) + x_n) / n`
#[allow(clippy::cast_precision_loss)]
fn incremental_avg(previous: f64, n: u64, sample: f64) -> f64 {
    if n == 0 {
        return sample;
    }
    (previous * (n - 1) as f64 + sample) / n as f64
}

/// Collapse whitespace and lowercase
#[must_use]
pub fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// `query:<sha256 hex>` of the normalized SQL and the serialized parameters
#[must_use]
pub fn fingerprint(normalized_sql: &str, params: &[serde_json::Value]) -> String {
    let serialized = serde_json::to_string(params).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(normalized_sql.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(serialized.as_bytes());
    format!("query:{}", hex::encode(hasher.finalize()))
}

/// Whether a normalized statement starts with a data- or schema-changing verb
///
/// The leading keyword must match one of the verbs as a whole word: `update t`
/// is mutating, an identifier such as `updates_view` is not.
#[must_use]
pub fn is_mutating(normalized_sql: &str) -> bool {
    let first = normalized_sql
        .trim_start_matches(|c: char| c == '(' || c.is_whitespace())
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .next()
        .unwrap_or_default();
    MUTATING_VERBS.contains(&first)
}

/// Whether `table` appears in `sql` as a whole identifier
fn mentions_table(sql: &str, table: &str) -> bool {
    let is_ident = |c: char| c.is_ascii_alphanumeric() || c == '_';
    sql.match_indices(table).any(|(start, _)| {
        let before = sql.get(..start).and_then(|s| s.chars().next_back());
        let after = sql.get(start + table.len()..).and_then(|s| s.chars().next());
        !before.is_some_and(is_ident) && !after.is_some_and(is_ident)
    })
}

/// Caching wrapper around the external query executor
pub struct QueryCache {
    manager: Arc<CacheManager>,
    executor: Arc<dyn QueryExecutor>,
    query_types: Vec<QueryTypeConfig>,
    default_ttl: Duration,
    scope: InvalidationScope,
    stats: Mutex<QueryCacheStats>,
}

impl QueryCache {
    pub fn new(
        manager: Arc<CacheManager>,
        executor: Arc<dyn QueryExecutor>,
        config: &QueryCacheConfig,
    ) -> Self {
        Self {
            manager,
            executor,
            query_types: default_query_types(),
            default_ttl: Duration::from_secs(config.default_ttl_secs),
            scope: config.invalidation_scope,
            stats: Mutex::new(QueryCacheStats::default()),
        }
    }

    /// Replace the built-in query types; table names are matched case-insensitively
    #[must_use]
    pub fn with_query_types(mut self, query_types: Vec<QueryTypeConfig>) -> Self {
        self.query_types = query_types
            .into_iter()
            .map(QueryTypeConfig::lowercase_tables)
            .collect();
        self
    }

    #[must_use]
    pub fn query_types(&self) -> &[QueryTypeConfig] {
        &self.query_types
    }

    /// Query type of a normalized statement, first matching table wins
    #[must_use]
    pub fn classify(&self, normalized_sql: &str) -> &str {
        self.query_types
            .iter()
            .find(|ty| ty.tables.iter().any(|t| mentions_table(normalized_sql, t)))
            .map_or(DEFAULT_QUERY_TYPE, |ty| ty.name.as_str())
    }

    fn ttl_for(&self, query_type: &str) -> Duration {
        self.query_types
            .iter()
            .find(|ty| ty.name == query_type)
            .map_or(self.default_ttl, |ty| ty.ttl)
    }

    /// Run a statement through the cache
    ///
    /// # Errors
    ///
    /// Returns `CacheError::QueryExecution` with the executor's error unchanged.
    /// Cache failures never surface here.
    pub async fn query(
        &self,
        sql: &str,
        params: &[serde_json::Value],
        options: QueryOptions,
    ) -> Result<QueryResult> {
        let normalized = normalize_sql(sql);
        let fingerprint = fingerprint(&normalized, params);
        let query_type = self.classify(&normalized).to_string();
        let mutating = is_mutating(&normalized);
        let id = format!("{query_type}:{fingerprint}");

        self.stats.lock().total_queries += 1;

        if !options.skip_cache && !mutating {
            let started = Instant::now();
            if let Some(record) = self
                .manager
                .get::<QueryCacheRecord>(QUERY_NAMESPACE, &id, None)
                .await
            {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                {
                    let mut stats = self.stats.lock();
                    stats.cache_hits += 1;
                    stats.avg_cache_time_ms =
                        incremental_avg(stats.avg_cache_time_ms, stats.cache_hits, elapsed_ms);
                }
                debug!(query_type = %query_type, fingerprint = %fingerprint, "[Query] Cache hit");
                return Ok(QueryResult {
                    rows: record.rows,
                    row_count: record.row_count,
                    cached: true,
                    query_type,
                    fingerprint,
                });
            }
        }

        let started = Instant::now();
        let output = match self.executor.execute(sql, params).await {
            Ok(output) => output,
            Err(e) => {
                self.stats.lock().executor_errors += 1;
                warn!(query_type = %query_type, error = %e, "[Query] Executor failed");
                return Err(CacheError::QueryExecution(e));
            }
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        {
            let mut stats = self.stats.lock();
            stats.cache_misses += 1;
            stats.avg_query_time_ms =
                incremental_avg(stats.avg_query_time_ms, stats.cache_misses, elapsed_ms);
            if mutating {
                stats.mutating_queries += 1;
            }
        }

        if mutating {
            debug!(query_type = %query_type, "[Query] Mutating statement, not cached");
        } else {
            let ttl = options.ttl.unwrap_or_else(|| self.ttl_for(&query_type));
            let record = QueryCacheRecord {
                fingerprint: fingerprint.clone(),
                rows: output.rows.clone(),
                row_count: output.row_count,
                query_type: query_type.clone(),
                timestamp: Utc::now(),
            };
            let options = SetOptions::ttl(ttl).with_tag(format!("query_type:{query_type}"));
            if !self.manager.set(QUERY_NAMESPACE, &id, &record, options).await {
                debug!(query_type = %query_type, "[Query] Result could not be cached");
            }
        }

        Ok(QueryResult {
            rows: output.rows,
            row_count: output.row_count,
            cached: false,
            query_type,
            fingerprint,
        })
    }

    /// Run several statements concurrently; results keep the input order
    pub async fn batch_query(
        &self,
        queries: &[BatchQuery],
        options: QueryOptions,
    ) -> Vec<Result<QueryResult>> {
        join_all(
            queries
                .iter()
                .map(|q| self.query(&q.sql, &q.params, options)),
        )
        .await
    }

    /// Delete cached results whose id starts with `pattern`
    ///
    /// A trailing `*` is ignored; an empty pattern or `*` clears the namespace.
    pub async fn invalidate_cache(&self, pattern: &str) -> u64 {
        let prefix = pattern.trim_end_matches('*');
        let removed = self.manager.delete_pattern(QUERY_NAMESPACE, prefix).await;
        info!(pattern = %pattern, count = removed, "[Query] Invalidated cached queries");
        removed
    }

    /// Invalidate every query type listening for `event`
    pub async fn invalidate_by_event(&self, event: &str) -> u64 {
        let types: Vec<&str> = self
            .query_types
            .iter()
            .filter(|ty| ty.invalidate_on_events.iter().any(|e| e == event))
            .map(|ty| ty.name.as_str())
            .collect();
        let removed = self.invalidate_types(&types).await;
        info!(event = %event, types = ?types, count = removed, "[Query] Invalidated by event");
        removed
    }

    /// Invalidate every query type reading `table`
    pub async fn invalidate_by_table(&self, table: &str) -> u64 {
        let table = table.to_lowercase();
        let types: Vec<&str> = self
            .query_types
            .iter()
            .filter(|ty| ty.tables.iter().any(|t| *t == table))
            .map(|ty| ty.name.as_str())
            .collect();
        let removed = self.invalidate_types(&types).await;
        info!(table = %table, types = ?types, count = removed, "[Query] Invalidated by table");
        removed
    }

    async fn invalidate_types(&self, types: &[&str]) -> u64 {
        if types.is_empty() {
            return 0;
        }
        match self.scope {
            InvalidationScope::Namespace => self.manager.delete_pattern(QUERY_NAMESPACE, "").await,
            InvalidationScope::Scoped => {
                let mut removed = 0;
                for ty in types {
                    removed += self
                        .manager
                        .delete_pattern(QUERY_NAMESPACE, &format!("{ty}:"))
                        .await;
                }
                removed
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> QueryCacheStats {
        *self.stats.lock()
    }
}
