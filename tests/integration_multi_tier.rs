//! Integration tests for tier routing under remote outages
//!
//! Tests fallback mode, outage tolerance and health reporting

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use tiered_query_cache::{
    CacheManager, CacheStrategy, CacheSystemBuilder, HealthStatus, MemoryBackend, RemoteBackend,
    SetOptions,
};

async fn manager_over_offline_backend(strategy: CacheStrategy) -> (CacheManager, Arc<MemoryBackend>) {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    backend.set_online(false);
    let manager = CacheManager::new(&config(strategy), Some(Arc::clone(&backend) as Arc<dyn RemoteBackend>))
        .await
        .unwrap_or_else(|e| panic!("Failed to create cache manager: {e}"));
    (manager, backend)
}

/// Remote unreachable at startup: every remote strategy serves from the overflow store
#[tokio::test]
async fn test_unreachable_remote_enters_fallback() {
    for strategy in [
        CacheStrategy::RemoteOnly,
        CacheStrategy::LocalFirst,
        CacheStrategy::RemoteFirst,
    ] {
        let (manager, backend) = manager_over_offline_backend(strategy).await;
        assert!(manager.is_fallback_active(), "strategy {strategy}");

        assert!(manager.set("users", "1", &test_data::User::new(1), SetOptions::default()).await);
        assert_eq!(
            manager.get::<test_data::User>("users", "1", None).await,
            Some(test_data::User::new(1)),
            "strategy {strategy}"
        );

        // fallback mode does not touch the remote tier
        backend.set_online(true);
        assert!(backend.is_empty());

        let health = manager.health_check().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(health.fallback_active);
        assert_eq!(health.remote_ok, Some(false));
    }
}

/// LocalOnly never looks at the remote tier, so an outage is irrelevant
#[tokio::test]
async fn test_local_only_ignores_remote_outage() {
    let (manager, _) = manager_over_offline_backend(CacheStrategy::LocalOnly).await;
    assert!(!manager.is_fallback_active());

    let health = manager.health_check().await;
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.remote_ok, None);
}

/// Outage after startup: LocalFirst keeps serving from the local tier
#[tokio::test]
async fn test_local_first_survives_runtime_outage() {
    let (manager, backend) = setup_manager(CacheStrategy::LocalFirst).await;
    manager.set("users", "1", &"alice", SetOptions::default()).await;

    backend.set_online(false);
    assert_eq!(
        manager.get::<String>("users", "1", None).await.as_deref(),
        Some("alice")
    );
    assert!(manager.set("users", "2", &"bob", SetOptions::default()).await);
    assert_eq!(
        manager.get::<String>("users", "2", None).await.as_deref(),
        Some("bob")
    );

    let health = manager.health_check().await;
    assert_eq!(health.status, HealthStatus::Degraded);
    assert!(!health.fallback_active);
    assert!(manager.get_stats().errors > 0);
}

/// Outage after startup: RemoteOnly reads are absent and writes report failure
#[tokio::test]
async fn test_remote_only_outage_is_absent_not_error() {
    let (manager, backend) = setup_manager(CacheStrategy::RemoteOnly).await;
    manager.set("users", "1", &"alice", SetOptions::default()).await;

    backend.set_online(false);
    assert_eq!(manager.get::<String>("users", "1", None).await, None);
    assert!(!manager.set("users", "2", &"bob", SetOptions::default()).await);

    let health = manager.health_check().await;
    assert_eq!(health.status, HealthStatus::Unhealthy);

    backend.set_online(true);
    assert_eq!(
        manager.get::<String>("users", "1", None).await.as_deref(),
        Some("alice")
    );
}

/// A backend slower than the operation timeout counts as unavailable
#[tokio::test]
async fn test_slow_remote_times_out() {
    let (manager, backend) = setup_manager(CacheStrategy::RemoteOnly).await;
    manager.set("users", "1", &1, SetOptions::default()).await;

    backend.set_latency(Duration::from_millis(500));
    assert_eq!(manager.get::<i32>("users", "1", None).await, None);

    backend.set_latency(Duration::ZERO);
    assert_eq!(manager.get::<i32>("users", "1", None).await, Some(1));
}

/// RemoteFirst fills the remote tier from a local hit
#[tokio::test]
async fn test_remote_first_fills_remote_from_local() {
    let (manager, backend) = setup_manager(CacheStrategy::RemoteFirst).await;
    manager.set("users", "1", &"alice", SetOptions::default()).await;

    backend
        .delete("users:1")
        .await
        .unwrap_or_else(|e| panic!("Failed to delete from remote: {e}"));
    assert!(!backend.contains_key("users:1"));

    assert_eq!(
        manager.get::<String>("users", "1", None).await.as_deref(),
        Some("alice")
    );
    assert!(backend.contains_key("users:1"));
}

/// Built without any reachable remote, the system still answers queries
#[tokio::test]
async fn test_system_builds_in_fallback_mode() {
    init_tracing();
    let mut config = config(CacheStrategy::LocalFirst);
    config.remote.enabled = false;

    let system = CacheSystemBuilder::with_config(config)
        .background_tasks(false)
        .build()
        .await
        .unwrap_or_else(|e| panic!("Failed to build cache system: {e}"));

    assert!(system.cache_manager().is_fallback_active());
    system.set("users", "1", &42, SetOptions::default()).await;
    assert_eq!(system.get::<i32>("users", "1", None).await, Some(42));

    let stats = system.get_stats();
    assert!(stats.cache.fallback_active);
    assert!(stats.cache.fallback.is_some());
    assert!(stats.query.is_none());

    system.close().await;
    assert_eq!(system.health_check().await.status, HealthStatus::Unhealthy);
}
