//! Integration tests for the query result cache
//!
//! Tests fingerprinting, per-type TTLs, mutating statements and executor errors

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use serde_json::json;
use tiered_query_cache::{
    BatchQuery, CacheError, CacheStrategy, CacheSystemBuilder, QueryExecutor, QueryOptions,
    QueryTypeConfig,
};

const RESULTS_SQL: &str = "SELECT * FROM test_results WHERE id = ?";

fn query_key(query_type: &str, fingerprint: &str) -> String {
    format!("db_queries:{query_type}:{fingerprint}")
}

/// Second identical query is served from the cache with one executor call
#[tokio::test]
async fn test_repeat_query_is_cached() {
    let (system, backend, executor) = setup_cache_system(CacheStrategy::LocalFirst).await;

    let first = system
        .query(RESULTS_SQL, &[json!(1)], QueryOptions::default())
        .await
        .unwrap_or_else(|e| panic!("First query failed: {e}"));
    let second = system
        .query(RESULTS_SQL, &[json!(1)], QueryOptions::default())
        .await
        .unwrap_or_else(|e| panic!("Second query failed: {e}"));

    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(first.rows, second.rows);
    assert_eq!(second.row_count, 2);
    assert_eq!(second.query_type, "test_results");
    assert_eq!(executor.calls(), 1);

    // stored with the test_results TTL of 600s
    let remaining = backend
        .ttl_remaining(&query_key("test_results", &first.fingerprint))
        .unwrap_or_else(|| panic!("Query result not stored remotely"));
    assert!(remaining > Duration::from_secs(590));
    assert!(remaining <= Duration::from_secs(600));

    let stats = system.get_stats().query.unwrap_or_else(|| panic!("Query stats missing"));
    assert_eq!(stats.total_queries, 2);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 1);
    assert!((stats.hit_rate() - 50.0).abs() < f64::EPSILON);
}

/// Whitespace and case differences share one cache entry
#[tokio::test]
async fn test_equivalent_sql_shares_fingerprint() {
    let (system, _, executor) = setup_cache_system(CacheStrategy::LocalOnly).await;

    let a = system
        .query("SELECT *   FROM users\n WHERE id = ?", &[json!(7)], QueryOptions::default())
        .await
        .unwrap_or_else(|e| panic!("Query failed: {e}"));
    let b = system
        .query("select * from USERS where id = ?", &[json!(7)], QueryOptions::default())
        .await
        .unwrap_or_else(|e| panic!("Query failed: {e}"));

    assert_eq!(a.fingerprint, b.fingerprint);
    assert!(b.cached);
    assert_eq!(b.query_type, "user_data");
    assert_eq!(executor.calls(), 1);
}

/// Different parameters never collide
#[tokio::test]
async fn test_different_params_are_distinct() {
    let (system, _, executor) = setup_cache_system(CacheStrategy::LocalFirst).await;

    let one = system
        .query(RESULTS_SQL, &[json!(1)], QueryOptions::default())
        .await
        .unwrap_or_else(|e| panic!("Query failed: {e}"));
    let two = system
        .query(RESULTS_SQL, &[json!(2)], QueryOptions::default())
        .await
        .unwrap_or_else(|e| panic!("Query failed: {e}"));

    assert_ne!(one.fingerprint, two.fingerprint);
    assert!(!two.cached);
    assert_eq!(executor.calls(), 2);
}

/// Mutating statements always reach the executor and are never stored
#[tokio::test]
async fn test_mutating_statements_bypass_cache() {
    let (system, backend, executor) = setup_cache_system(CacheStrategy::LocalFirst).await;
    let sql = "UPDATE test_results SET status = ? WHERE id = ?";

    for _ in 0..3 {
        let result = system
            .query(sql, &[json!("passed"), json!(1)], QueryOptions::default())
            .await
            .unwrap_or_else(|e| panic!("Update failed: {e}"));
        assert!(!result.cached);
    }

    assert_eq!(executor.calls(), 3);
    assert!(backend.is_empty());
    let stats = system.get_stats().query.unwrap_or_else(|| panic!("Query stats missing"));
    assert_eq!(stats.mutating_queries, 3);
    assert_eq!(stats.cache_hits, 0);
}

/// `skip_cache` executes again and refreshes the stored entry
#[tokio::test]
async fn test_skip_cache_forces_execution() {
    let (system, _, executor) = setup_cache_system(CacheStrategy::LocalFirst).await;
    let bypass = QueryOptions {
        skip_cache: true,
        ..QueryOptions::default()
    };

    system
        .query(RESULTS_SQL, &[json!(1)], QueryOptions::default())
        .await
        .unwrap_or_else(|e| panic!("Query failed: {e}"));
    let forced = system
        .query(RESULTS_SQL, &[json!(1)], bypass)
        .await
        .unwrap_or_else(|e| panic!("Query failed: {e}"));
    assert!(!forced.cached);
    assert_eq!(executor.calls(), 2);

    let cached = system
        .query(RESULTS_SQL, &[json!(1)], QueryOptions::default())
        .await
        .unwrap_or_else(|e| panic!("Query failed: {e}"));
    assert!(cached.cached);
    assert_eq!(executor.calls(), 2);
}

/// A per-call TTL overrides the query type's TTL
#[tokio::test]
async fn test_ttl_override() {
    let (system, backend, _) = setup_cache_system(CacheStrategy::RemoteOnly).await;
    let options = QueryOptions {
        ttl: Some(Duration::from_secs(30)),
        ..QueryOptions::default()
    };

    let result = system
        .query(RESULTS_SQL, &[json!(1)], options)
        .await
        .unwrap_or_else(|e| panic!("Query failed: {e}"));
    let remaining = backend
        .ttl_remaining(&query_key("test_results", &result.fingerprint))
        .unwrap_or_else(|| panic!("Query result not stored remotely"));
    assert!(remaining <= Duration::from_secs(30));
}

/// Unclassified statements use the default type and TTL
#[tokio::test]
async fn test_unclassified_statement_uses_default_type() {
    let (system, backend, _) = setup_cache_system(CacheStrategy::RemoteOnly).await;

    let result = system
        .query("SELECT 1", &[], QueryOptions::default())
        .await
        .unwrap_or_else(|e| panic!("Query failed: {e}"));
    assert_eq!(result.query_type, "default");

    let remaining = backend
        .ttl_remaining(&query_key("default", &result.fingerprint))
        .unwrap_or_else(|| panic!("Query result not stored remotely"));
    assert!(remaining > Duration::from_secs(290));
    assert!(remaining <= Duration::from_secs(300));
}

/// Host-supplied table names classify regardless of their case
#[tokio::test]
async fn test_custom_query_type_tables_ignore_case() {
    let executor = Arc::new(MockExecutor::new());
    let accounts = QueryTypeConfig {
        name: "accounts".to_string(),
        ttl: Duration::from_secs(120),
        tables: vec!["Users".to_string()],
        invalidate_on_events: vec!["user_updated".to_string()],
    };
    let system = CacheSystemBuilder::with_config(config(CacheStrategy::LocalOnly))
        .with_executor(Arc::clone(&executor) as Arc<dyn QueryExecutor>)
        .with_query_types(vec![accounts])
        .background_tasks(false)
        .build()
        .await
        .unwrap_or_else(|e| panic!("Failed to build cache system: {e}"));

    let result = system
        .query("select * from users where id = ?", &[json!(1)], QueryOptions::default())
        .await
        .unwrap_or_else(|e| panic!("Query failed: {e}"));
    assert_eq!(result.query_type, "accounts");

    let cached = system
        .query("SELECT * FROM Users WHERE id = ?", &[json!(1)], QueryOptions::default())
        .await
        .unwrap_or_else(|e| panic!("Query failed: {e}"));
    assert!(cached.cached);
    assert_eq!(executor.calls(), 1);
}

/// Executor errors reach the caller and nothing is cached
#[tokio::test]
async fn test_executor_error_propagates() {
    let (system, backend, executor) = setup_cache_system(CacheStrategy::LocalFirst).await;
    executor.set_failing(true);

    let err = system
        .query(RESULTS_SQL, &[json!(1)], QueryOptions::default())
        .await
        .err()
        .unwrap_or_else(|| panic!("Query should have failed"));
    assert!(matches!(err, CacheError::QueryExecution(_)));
    assert!(err.to_string().contains("connection to database lost"));
    assert!(backend.is_empty());

    executor.set_failing(false);
    let recovered = system
        .query(RESULTS_SQL, &[json!(1)], QueryOptions::default())
        .await
        .unwrap_or_else(|e| panic!("Query failed after recovery: {e}"));
    assert!(!recovered.cached);
    assert_eq!(executor.calls(), 2);

    let stats = system.get_stats().query.unwrap_or_else(|| panic!("Query stats missing"));
    assert_eq!(stats.executor_errors, 1);
}

/// A remote outage degrades to executing every query, never to an error
#[tokio::test]
async fn test_remote_outage_does_not_fail_queries() {
    let (system, backend, executor) = setup_cache_system(CacheStrategy::RemoteOnly).await;
    backend.set_online(false);

    for _ in 0..2 {
        let result = system
            .query(RESULTS_SQL, &[json!(1)], QueryOptions::default())
            .await
            .unwrap_or_else(|e| panic!("Query failed during outage: {e}"));
        assert!(!result.cached);
    }
    assert_eq!(executor.calls(), 2);
}

/// Batch results keep input order and individual failures stay individual
#[tokio::test]
async fn test_batch_query() {
    let (system, _, executor) = setup_cache_system(CacheStrategy::LocalFirst).await;

    system
        .query(RESULTS_SQL, &[json!(1)], QueryOptions::default())
        .await
        .unwrap_or_else(|e| panic!("Query failed: {e}"));

    let batch = vec![
        BatchQuery::new(RESULTS_SQL, vec![json!(1)]),
        BatchQuery::new("SELECT * FROM users WHERE id = ?", vec![json!(5)]),
        BatchQuery::new("SELECT * FROM settings", vec![]),
    ];
    let results = system
        .batch_query(&batch, QueryOptions::default())
        .await
        .unwrap_or_else(|e| panic!("Batch failed: {e}"));

    assert_eq!(results.len(), 3);
    let types: Vec<(String, bool)> = results
        .into_iter()
        .map(|r| {
            let r = r.unwrap_or_else(|e| panic!("Batch entry failed: {e}"));
            (r.query_type, r.cached)
        })
        .collect();
    assert_eq!(
        types,
        vec![
            ("test_results".to_string(), true),
            ("user_data".to_string(), false),
            ("configuration".to_string(), false),
        ]
    );
    assert_eq!(executor.calls(), 3);
}

/// Without an executor the query surface reports a configuration error
#[tokio::test]
async fn test_query_without_executor() {
    init_tracing();
    let system = tiered_query_cache::CacheSystemBuilder::with_config(config(CacheStrategy::LocalOnly))
        .background_tasks(false)
        .build()
        .await
        .unwrap_or_else(|e| panic!("Failed to build cache system: {e}"));

    let err = system
        .query("SELECT 1", &[], QueryOptions::default())
        .await
        .err()
        .unwrap_or_else(|| panic!("Query should have failed"));
    assert!(matches!(err, CacheError::Configuration(_)));
    assert!(system.invalidate_by_event("test_completed").await.is_err());
}
