//! Cache Service Walkthrough
//!
//! Builds a cache system over the in-memory remote backend and a simulated
//! database, then exercises every component: routed get/set, the query cache
//! with event invalidation, warmup loaders, monitoring and health checks.
//!
//! Run with: `cargo run --example cache_service`
//! Set `RUST_LOG=tiered_query_cache=debug` to see the cache decisions.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tiered_query_cache::{
    CacheConfig, CacheStrategy, CacheSystemBuilder, MemoryBackend, QueryExecutor, QueryOptions,
    QueryOutput, RemoteBackend, SetOptions, WarmupPriority, async_trait,
};

/// Mock test run stored in the database
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TestRun {
    id: u64,
    status: String,
    duration_ms: u64,
}

/// Simulated database (in real world, wrap a sqlx pool)
struct SimulatedDatabase {
    executed: AtomicU32,
}

#[async_trait]
impl QueryExecutor for SimulatedDatabase {
    async fn execute(&self, sql: &str, params: &[serde_json::Value]) -> anyhow::Result<QueryOutput> {
        self.executed.fetch_add(1, Ordering::Relaxed);
        println!("  🗄️  Executing against database: {sql}");
        tokio::time::sleep(Duration::from_millis(80)).await;

        let id = params.first().and_then(serde_json::Value::as_u64).unwrap_or(1);
        let row = TestRun {
            id,
            status: "passed".to_string(),
            duration_ms: 1200 + id,
        };
        Ok(QueryOutput::new(vec![serde_json::to_value(row)?]))
    }
}

async fn load_system_config() -> anyhow::Result<HashMap<String, serde_json::Value>> {
    tokio::time::sleep(Duration::from_millis(30)).await;
    Ok(HashMap::from([
        ("feature_flags".to_string(), json!({ "parallel_runs": true })),
        ("retention_days".to_string(), json!(30)),
    ]))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("🎯 Tiered Query Cache Walkthrough\n");

    // ========================================
    // Build
    // ========================================
    let database = Arc::new(SimulatedDatabase {
        executed: AtomicU32::new(0),
    });
    let remote = Arc::new(MemoryBackend::new().with_memory_limit(64 * 1024 * 1024));

    let config = CacheConfig {
        strategy: CacheStrategy::LocalFirst,
        ..CacheConfig::default()
    };
    let cache = CacheSystemBuilder::with_config(config)
        .with_remote(Arc::clone(&remote) as Arc<dyn RemoteBackend>)
        .with_executor(Arc::clone(&database) as Arc<dyn QueryExecutor>)
        .with_loader(
            "system_config",
            WarmupPriority::High,
            Duration::from_secs(3600),
            load_system_config,
        )
        .build()
        .await?;
    println!("✅ Cache system ready ({})\n", cache.cache_manager().strategy());

    // ========================================
    // Example 1: Key/value caching
    // ========================================
    println!("📊 Example 1: Key/value caching");
    println!("─────────────────────────────────────────────────────");
    let run = TestRun {
        id: 7,
        status: "running".to_string(),
        duration_ms: 0,
    };
    cache
        .set("test_runs", "7", &run, SetOptions::ttl(Duration::from_secs(60)).with_tag("suite:smoke"))
        .await;
    let cached: Option<TestRun> = cache.get("test_runs", "7", None).await;
    println!("  Cached run: {cached:?}");
    println!("  Removed by tag: {}\n", cache.delete_by_tag("suite:smoke").await);

    // ========================================
    // Example 2: Query caching
    // ========================================
    println!("📊 Example 2: Query caching");
    println!("─────────────────────────────────────────────────────");
    let sql = "SELECT * FROM test_results WHERE id = ?";
    for attempt in 1..=2 {
        let start = std::time::Instant::now();
        let result = cache.query(sql, &[json!(42)], QueryOptions::default()).await?;
        println!(
            "  Attempt {attempt}: cached={} type={} rows={} in {:?}",
            result.cached,
            result.query_type,
            result.row_count,
            start.elapsed()
        );
    }

    let removed = cache.invalidate_by_event("test_completed").await?;
    println!("  test_completed invalidated {removed} cached result(s)");
    let result = cache.query(sql, &[json!(42)], QueryOptions::default()).await?;
    println!("  After invalidation: cached={}", result.cached);
    println!(
        "  Database executed {} statement(s)\n",
        database.executed.load(Ordering::Relaxed)
    );

    // ========================================
    // Example 3: Warmup
    // ========================================
    println!("📊 Example 3: Warmup");
    println!("─────────────────────────────────────────────────────");
    if let Some(report) = cache.perform_warmup().await {
        println!(
            "  Run {}: {}/{} task(s), {} item(s) cached",
            report.run_id, report.completed_tasks, report.total_tasks, report.items_cached
        );
    }
    let flags: Option<serde_json::Value> = cache.get("configuration", "feature_flags", None).await;
    println!("  configuration:feature_flags = {flags:?}\n");

    // ========================================
    // Example 4: Monitoring and health
    // ========================================
    println!("📊 Example 4: Monitoring and health");
    println!("─────────────────────────────────────────────────────");
    let snapshot = cache.monitoring().collect_metrics().await;
    println!(
        "  Response {:.2}ms, hit rate {:.1}%, keys {:?}",
        snapshot.response_time_ms, snapshot.hit_rate, snapshot.key_count
    );
    cache.monitoring().check_alerts();
    let report = cache.get_monitoring_report("1h")?;
    println!("  Active alerts: {}", report.active_alerts.len());

    let health = cache.health_check().await;
    println!("  Health: {:?} (remote ok: {:?})", health.status, health.remote_ok);

    let stats = cache.get_stats();
    println!("\n📈 Final statistics:");
    println!("{}", serde_json::to_string_pretty(&stats)?);

    cache.close().await;
    println!("\n👋 Closed");
    Ok(())
}
