//! Integration tests for basic cache operations
//!
//! Tests set/get/delete across every routing strategy, TTL expiry and eviction

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use tiered_query_cache::{
    CacheManager, CacheRouter, CacheStrategy, LocalStore, RemoteBackend, RemoteStore, SetOptions,
};

const ALL_STRATEGIES: [CacheStrategy; 4] = [
    CacheStrategy::LocalOnly,
    CacheStrategy::RemoteOnly,
    CacheStrategy::LocalFirst,
    CacheStrategy::RemoteFirst,
];

/// Set followed by get returns the value under every strategy
#[tokio::test]
async fn test_set_get_roundtrip_every_strategy() {
    for strategy in ALL_STRATEGIES {
        let (manager, _) = setup_manager(strategy).await;
        let key = test_key("roundtrip");
        let user = test_data::User::new(42);

        assert!(manager.set("users", &key, &user, SetOptions::default()).await);
        let cached: Option<test_data::User> = manager.get("users", &key, None).await;
        assert_eq!(cached, Some(user), "strategy {strategy}");
        assert!(!manager.is_fallback_active(), "strategy {strategy}");
    }
}

/// Entries expire after their TTL, and a second read is also a clean miss
#[tokio::test]
async fn test_ttl_expiry_every_strategy() {
    for strategy in ALL_STRATEGIES {
        let (manager, _) = setup_manager(strategy).await;
        let key = test_key("ttl");

        manager
            .set("short", &key, &"soon gone", SetOptions::ttl(Duration::from_millis(50)))
            .await;
        assert_eq!(
            manager.get::<String>("short", &key, None).await.as_deref(),
            Some("soon gone")
        );

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(manager.get::<String>("short", &key, None).await, None, "strategy {strategy}");
        assert_eq!(manager.get::<String>("short", &key, None).await, None, "strategy {strategy}");
    }
}

/// Zero TTL means the entry does not expire
#[tokio::test]
async fn test_zero_ttl_never_expires() {
    let (manager, _) = setup_manager(CacheStrategy::LocalFirst).await;
    manager
        .set("config", "theme", &"dark", SetOptions::ttl(Duration::ZERO))
        .await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(
        manager.get::<String>("config", "theme", None).await.as_deref(),
        Some("dark")
    );
}

/// maxSize = 2; a, b, c inserted: a is gone, b and c survive
#[tokio::test]
async fn test_bounded_store_evicts_first_inserted() {
    init_tracing();
    let mut config = config(CacheStrategy::LocalFirst);
    config.local_max_size = 2;
    config.fallback_max_size = 2;
    // no remote tier: the manager serves everything from its bounded overflow store
    let manager = CacheManager::new(&config, None)
        .await
        .unwrap_or_else(|e| panic!("Failed to create cache manager: {e}"));
    assert!(manager.is_fallback_active());

    manager.set("s", "a", &1, SetOptions::default()).await;
    manager.set("s", "b", &2, SetOptions::default()).await;
    manager.set("s", "c", &3, SetOptions::default()).await;

    assert_eq!(manager.get::<i32>("s", "a", None).await, None);
    assert_eq!(manager.get::<i32>("s", "b", None).await, Some(2));
    assert_eq!(manager.get::<i32>("s", "c", None).await, Some(3));
}

/// Inserting maxSize + 1 distinct keys leaves exactly maxSize keys
#[tokio::test]
async fn test_local_store_capacity_property() {
    let max_size = 16;
    let store = LocalStore::new(max_size);
    for i in 0..=max_size {
        store.set(&format!("k{i}"), bytes::Bytes::from(i.to_string()), Duration::ZERO);
    }

    assert_eq!(store.len(), max_size);
    assert!(store.get("k0").is_none());
    for i in 1..=max_size {
        assert!(store.get(&format!("k{i}")).is_some(), "k{i} should survive");
    }
    assert_eq!(store.stats().evictions, 1);
}

/// A value present only in the remote tier becomes a local hit after one routed get
#[tokio::test]
async fn test_local_first_fill_back() {
    let backend = Arc::new(tiered_query_cache::MemoryBackend::new());
    let local = Arc::new(LocalStore::new(100));
    let remote = Arc::new(RemoteStore::new(
        Arc::clone(&backend) as Arc<dyn RemoteBackend>,
        Duration::from_millis(200),
    ));
    let router = CacheRouter::new(
        CacheStrategy::LocalFirst,
        Arc::clone(&local),
        Some(remote),
        Duration::from_secs(300),
    );

    backend
        .set("remote-only", bytes::Bytes::from_static(b"v"), None)
        .await
        .unwrap_or_else(|e| panic!("Failed to seed remote: {e}"));
    assert!(local.get("remote-only").is_none());

    assert!(router.get("remote-only").await.is_some());
    assert_eq!(local.get("remote-only"), Some(bytes::Bytes::from_static(b"v")));
}

/// Delete removes the entry from every tier the strategy routes to
#[tokio::test]
async fn test_delete_removes_everywhere() {
    let (manager, backend) = setup_manager(CacheStrategy::LocalFirst).await;
    let key = test_key("delete");

    manager.set("users", &key, &test_data::json_user(1), SetOptions::default()).await;
    assert!(backend.contains_key(&format!("users:{key}")));

    assert!(manager.delete("users", &key, None).await);
    assert!(!backend.contains_key(&format!("users:{key}")));
    assert_eq!(manager.get::<serde_json::Value>("users", &key, None).await, None);
    assert!(!manager.delete("users", &key, None).await);
}

/// Stats count hits, misses, sets and the hit rate
#[tokio::test]
async fn test_stats_tracking() {
    let (manager, _) = setup_manager(CacheStrategy::LocalFirst).await;

    manager.set("s", "k", &1, SetOptions::default()).await;
    let _ = manager.get::<i32>("s", "k", None).await;
    let _ = manager.get::<i32>("s", "k", None).await;
    let _ = manager.get::<i32>("s", "k", None).await;
    let _ = manager.get::<i32>("s", "missing", None).await;

    let stats = manager.get_stats();
    assert_eq!(stats.hits, 3);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.sets, 1);
    assert_eq!(stats.total_ops, 5);
    assert!((stats.hit_rate - 75.0).abs() < f64::EPSILON);
    assert_eq!(stats.strategy, CacheStrategy::LocalFirst);
}
