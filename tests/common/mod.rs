//! Common utilities for integration tests
//!
//! This module provides shared test infrastructure including:
//! - Tracing setup
//! - In-memory remote tier and cache system helpers
//! - A counting mock query executor
//! - Test data generators

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use tiered_query_cache::{
    CacheConfig, CacheManager, CacheStrategy, CacheSystem, CacheSystemBuilder, MemoryBackend,
    QueryExecutor, QueryOutput, RemoteBackend, async_trait,
};

/// Install a test subscriber once; respects `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Create a test key with unique suffix
pub fn test_key(name: &str) -> String {
    format!("test_{}_{}", name, rand::random::<u32>())
}

/// Configuration with the given strategy and short intervals
pub fn config(strategy: CacheStrategy) -> CacheConfig {
    let mut config = CacheConfig {
        strategy,
        ..CacheConfig::default()
    };
    config.warmup.retry_delay_ms = 10;
    config.remote.operation_timeout_ms = 200;
    config
}

/// Cache manager over a fresh in-memory remote tier
pub async fn setup_manager(strategy: CacheStrategy) -> (Arc<CacheManager>, Arc<MemoryBackend>) {
    setup_manager_with(config(strategy)).await
}

pub async fn setup_manager_with(config: CacheConfig) -> (Arc<CacheManager>, Arc<MemoryBackend>) {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    let manager = CacheManager::new(&config, Some(Arc::clone(&backend) as Arc<dyn RemoteBackend>))
        .await
        .unwrap_or_else(|e| panic!("Failed to create cache manager: {e}"));
    (Arc::new(manager), backend)
}

/// Cache system without background timers, backed by memory and the mock executor
pub async fn setup_cache_system(strategy: CacheStrategy) -> (CacheSystem, Arc<MemoryBackend>, Arc<MockExecutor>) {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    let executor = Arc::new(MockExecutor::new());
    let system = CacheSystemBuilder::with_config(config(strategy))
        .with_remote(Arc::clone(&backend) as Arc<dyn RemoteBackend>)
        .with_executor(Arc::clone(&executor) as Arc<dyn QueryExecutor>)
        .background_tasks(false)
        .build()
        .await
        .unwrap_or_else(|e| panic!("Failed to build cache system: {e}"));
    (system, backend, executor)
}

/// Query executor that returns canned rows and counts invocations
pub struct MockExecutor {
    calls: AtomicU32,
    fail: AtomicBool,
    latency: Duration,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail: AtomicBool::new(false),
            latency,
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl QueryExecutor for MockExecutor {
    async fn execute(&self, sql: &str, params: &[serde_json::Value]) -> Result<QueryOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            bail!("connection to database lost");
        }
        let rows = vec![
            serde_json::json!({ "sql": sql, "params": params, "row": 1 }),
            serde_json::json!({ "sql": sql, "params": params, "row": 2 }),
        ];
        Ok(QueryOutput::new(rows))
    }
}

/// Generate test data of various types
pub mod test_data {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct User {
        pub id: u64,
        pub name: String,
        pub email: String,
    }

    impl User {
        pub fn new(id: u64) -> Self {
            Self {
                id,
                name: format!("User {id}"),
                email: format!("user{id}@example.com"),
            }
        }
    }

    /// Generate JSON test data
    pub fn json_user(id: u64) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "name": format!("User {id}"),
            "email": format!("user{id}@example.com"),
            "created_at": "2025-01-01T00:00:00Z"
        })
    }

    /// Loader payload of `count` users keyed `user:<id>`
    pub fn user_entries(count: u64) -> super::HashMap<String, serde_json::Value> {
        (0..count)
            .map(|id| (format!("user:{id}"), json_user(id)))
            .collect()
    }
}

/// Wait for a condition with timeout
pub async fn wait_for<F>(mut condition: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    let timeout = Duration::from_millis(timeout_ms);

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    false
}
