//! Tag Index - Tag to Key Registry
//!
//! Maps tags to the composite keys stored under them, remembering when each key
//! expires. Members whose deadline has passed are dropped by [`TagIndex::prune_expired`],
//! which runs on a timer ([`spawn_tag_sweep`]) and every `PRUNE_EVERY` registrations,
//! so the index follows the live keyspace instead of growing with every key ever
//! tagged.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

const PRUNE_EVERY: u64 = 1024;

/// tag -> (key -> expiry deadline, `None` for no expiry)
#[derive(Debug, Default)]
pub(crate) struct TagIndex {
    tags: DashMap<String, HashMap<String, Option<Instant>>>,
    registrations: AtomicU64,
}

impl TagIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register `key` under every tag; `Duration::ZERO` means no expiry
    pub(crate) fn register(&self, tags: &[String], key: &str, ttl: Duration) {
        if tags.is_empty() {
            return;
        }
        let deadline = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        for tag in tags {
            self.tags
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string(), deadline);
        }

        if self.registrations.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.prune_expired();
        }
    }

    /// Remove a tag, returning its keys that have not expired yet
    pub(crate) fn take_live(&self, tag: &str) -> Vec<String> {
        let now = Instant::now();
        self.tags
            .remove(tag)
            .map(|(_, keys)| {
                keys.into_iter()
                    .filter(|(_, deadline)| deadline.is_none_or(|deadline| deadline >= now))
                    .map(|(key, _)| key)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Forget every key starting with `prefix`
    pub(crate) fn remove_prefix(&self, prefix: &str) {
        for mut keys in self.tags.iter_mut() {
            keys.retain(|key, _| !key.starts_with(prefix));
        }
        self.tags.retain(|_, keys| !keys.is_empty());
    }

    /// Drop members whose deadline has passed, returns how many were dropped
    pub(crate) fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let mut pruned = 0;
        for mut keys in self.tags.iter_mut() {
            let before = keys.len();
            keys.retain(|_, deadline| deadline.is_none_or(|deadline| deadline >= now));
            pruned += before - keys.len();
        }
        self.tags.retain(|_, keys| !keys.is_empty());
        pruned
    }

    pub(crate) fn clear(&self) {
        self.tags.clear();
    }

    /// Number of (tag, key) memberships
    pub(crate) fn len(&self) -> usize {
        self.tags.iter().map(|keys| keys.len()).sum()
    }
}

/// Spawn a task that prunes expired tag members every `interval` until shutdown
pub(crate) fn spawn_tag_sweep(
    index: Arc<TagIndex>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Starting tag index sweep task");
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let pruned = index.prune_expired();
                    if pruned > 0 {
                        debug!(count = pruned, "Tag sweep removed expired members");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Tag sweep task shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_take_live_skips_expired_members() {
        let index = TagIndex::new();
        index.register(&tags(&["t"]), "short", Duration::from_millis(5));
        index.register(&tags(&["t"]), "long", Duration::from_secs(60));
        index.register(&tags(&["t"]), "forever", Duration::ZERO);
        std::thread::sleep(Duration::from_millis(20));

        let mut live = index.take_live("t");
        live.sort();
        assert_eq!(live, vec!["forever".to_string(), "long".to_string()]);
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_prune_expired_shrinks_index() {
        let index = TagIndex::new();
        for i in 0..100 {
            index.register(&tags(&["a", "b"]), &format!("k{i}"), Duration::from_millis(1));
        }
        index.register(&tags(&["a"]), "kept", Duration::ZERO);
        assert_eq!(index.len(), 201);
        std::thread::sleep(Duration::from_millis(10));

        assert_eq!(index.prune_expired(), 200);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_registrations_prune_periodically() {
        let index = TagIndex::new();
        index.register(&tags(&["old"]), "stale", Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(10));

        for i in 0..PRUNE_EVERY {
            index.register(&tags(&["new"]), &format!("k{i}"), Duration::ZERO);
        }
        assert!(index.take_live("old").is_empty());
        assert_eq!(index.len(), usize::try_from(PRUNE_EVERY).unwrap());
    }

    #[test]
    fn test_remove_prefix() {
        let index = TagIndex::new();
        index.register(&tags(&["t"]), "ns:a", Duration::ZERO);
        index.register(&tags(&["t", "u"]), "ns:b", Duration::ZERO);
        index.register(&tags(&["u"]), "other:c", Duration::ZERO);

        index.remove_prefix("ns:");
        assert_eq!(index.len(), 1);
        assert_eq!(index.take_live("u"), vec!["other:c".to_string()]);
    }

    #[tokio::test]
    async fn test_sweep_task_prunes_and_stops() {
        let index = Arc::new(TagIndex::new());
        index.register(&tags(&["t"]), "k", Duration::from_millis(5));
        let (tx, rx) = broadcast::channel(1);
        let handle = spawn_tag_sweep(Arc::clone(&index), Duration::from_millis(20), rx);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(index.len(), 0);

        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
