//! Local Store - Bounded In-Process Cache
//!
//! A size-bounded key/value store with per-entry TTL. When the store is full, the
//! entry that was inserted first is evicted (strict insertion order, not LRU) to
//! make room for a new key. Expired entries are dropped lazily on read and by
//! [`spawn_expiry_sweep`].
//!
//! All operations are synchronous and never perform I/O; a single mutex guards the
//! map and its insertion index so each operation is atomic.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Cache entry with expiration tracking
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Bytes,
    expires_at: Option<Instant>,
    created_at: Instant,
    /// Position in the insertion index
    seq: u64,
}

impl CacheEntry {
    fn new(value: Bytes, ttl: Duration, seq: u64) -> Self {
        let created_at = Instant::now();
        Self {
            value,
            expires_at: (!ttl.is_zero()).then(|| created_at + ttl),
            created_at,
            seq,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, CacheEntry>,
    /// seq -> key, oldest first
    insertion_order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl Inner {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.insertion_order.remove(&entry.seq);
        Some(entry)
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let (_, key) = self.insertion_order.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }
}

/// Snapshot of local store counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LocalStoreStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub size: usize,
    pub max_size: usize,
}

/// Bounded in-process store with insertion-order eviction
///
/// **Example**:
/// ```rust
/// use tiered_query_cache::LocalStore;
/// use bytes::Bytes;
/// use std::time::Duration;
///
/// let store = LocalStore::new(2);
/// store.set("a", Bytes::from_static(b"1"), Duration::ZERO);
/// store.set("b", Bytes::from_static(b"2"), Duration::ZERO);
/// store.set("c", Bytes::from_static(b"3"), Duration::ZERO);
///
/// assert!(store.get("a").is_none());
/// assert_eq!(store.len(), 2);
/// ```
#[derive(Debug)]
pub struct LocalStore {
    inner: Mutex<Inner>,
    max_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
}

impl LocalStore {
    /// Create a store holding at most `max_size` entries (minimum 1)
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_size: max_size.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Get a value, dropping it if its TTL has elapsed
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.get_with_ttl(key).map(|(value, _)| value)
    }

    /// Get a value with its remaining lifetime, `None` lifetime meaning no expiry
    pub fn get_with_ttl(&self, key: &str) -> Option<(Bytes, Option<Duration>)> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        let expired = match inner.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                let remaining = entry
                    .expires_at
                    .map(|expires_at| expires_at.saturating_duration_since(now));
                return Some((entry.value.clone(), remaining));
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            inner.remove(key);
            debug!(key = %key, "[Local] Dropped expired entry on read");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a value; `Duration::ZERO` means no expiry
    ///
    /// Inserting a new key into a full store evicts exactly one entry, the one
    /// with the oldest creation time. Overwriting a key re-creates its entry.
    pub fn set(&self, key: &str, value: Bytes, ttl: Duration) {
        let mut inner = self.inner.lock();

        let existed = inner.remove(key).is_some();
        if !existed && inner.entries.len() >= self.max_size {
            if let Some(evicted) = inner.evict_oldest() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(evicted = %evicted, "[Local] Evicted oldest entry");
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.insertion_order.insert(seq, key.to_string());
        inner
            .entries
            .insert(key.to_string(), CacheEntry::new(value, ttl, seq));
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    /// Delete a key, returns whether it was present
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.inner.lock().remove(key).is_some();
        if removed {
            self.deletes.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Delete every key starting with `prefix`
    pub fn delete_prefix(&self, prefix: &str) -> usize {
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &keys {
            inner.remove(key);
        }
        self.deletes.fetch_add(keys.len() as u64, Ordering::Relaxed);
        keys.len()
    }

    /// Remove every entry
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.insertion_order.clear();
    }

    /// Remove all expired entries, returns how many were dropped
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        expired.len()
    }

    /// Age of an entry, `None` when absent
    pub fn entry_age(&self, key: &str) -> Option<Duration> {
        self.inner
            .lock()
            .entries
            .get(key)
            .map(|entry| entry.created_at.elapsed())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    #[must_use]
    pub fn stats(&self) -> LocalStoreStats {
        LocalStoreStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.len(),
            max_size: self.max_size,
        }
    }
}

/// Spawn a task that purges expired entries every `interval` until shutdown
pub fn spawn_expiry_sweep(
    store: Arc<LocalStore>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Starting expiry sweep task");
        let mut ticker = tokio::time::interval(interval);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = store.purge_expired();
                    if removed > 0 {
                        debug!(count = removed, "Expiry sweep removed entries");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Expiry sweep task shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[test]
    fn test_evicts_first_inserted() {
        let store = LocalStore::new(3);
        for key in ["k1", "k2", "k3", "k4"] {
            store.set(key, b("v"), Duration::ZERO);
        }

        assert_eq!(store.len(), 3);
        assert!(store.get("k1").is_none());
        assert!(store.get("k2").is_some());
        assert!(store.get("k4").is_some());
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn test_reads_do_not_change_eviction_order() {
        let store = LocalStore::new(2);
        store.set("a", b("1"), Duration::ZERO);
        store.set("b", b("2"), Duration::ZERO);
        // an LRU would now evict "b"
        assert!(store.get("a").is_some());
        store.set("c", b("3"), Duration::ZERO);

        assert!(store.get("a").is_none());
        assert_eq!(store.get("b"), Some(b("2")));
        assert_eq!(store.get("c"), Some(b("3")));
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let store = LocalStore::new(2);
        store.set("a", b("1"), Duration::ZERO);
        store.set("b", b("2"), Duration::ZERO);
        store.set("a", b("3"), Duration::ZERO);

        assert_eq!(store.len(), 2);
        assert_eq!(store.get("a"), Some(b("3")));
        assert_eq!(store.stats().evictions, 0);

        // "a" was re-created, so "b" is now the oldest
        store.set("c", b("4"), Duration::ZERO);
        assert!(store.get("b").is_none());
        assert!(store.get("a").is_some());
    }

    #[test]
    fn test_expired_read_is_a_miss_and_removes() {
        let store = LocalStore::new(10);
        store.set("short", b("v"), Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(40));

        assert!(store.get("short").is_none());
        assert!(store.get("short").is_none());
        assert_eq!(store.len(), 0);

        let stats = store.stats();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.hits, 0);
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let store = LocalStore::new(10);
        store.set("forever", b("v"), Duration::ZERO);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(store.purge_expired(), 0);
        assert!(store.get("forever").is_some());
    }

    #[test]
    fn test_get_with_ttl_reports_remaining_lifetime() {
        let store = LocalStore::new(10);
        store.set("short", b("v"), Duration::from_secs(2));
        store.set("forever", b("v"), Duration::ZERO);

        let (_, remaining) = store.get_with_ttl("short").unwrap();
        assert!(remaining.is_some_and(|r| r > Duration::ZERO && r <= Duration::from_secs(2)));
        assert_eq!(store.get_with_ttl("forever").map(|(_, r)| r), Some(None));
        assert!(store.get_with_ttl("missing").is_none());
    }

    #[test]
    fn test_delete_prefix_and_counters() {
        let store = LocalStore::new(10);
        store.set("user:1", b("a"), Duration::ZERO);
        store.set("user:2", b("b"), Duration::ZERO);
        store.set("order:1", b("c"), Duration::ZERO);

        assert_eq!(store.delete_prefix("user:"), 2);
        assert!(store.delete("order:1"));
        assert!(!store.delete("order:1"));

        let stats = store.stats();
        assert_eq!(stats.deletes, 3);
        assert_eq!(stats.size, 0);
    }

    #[test]
    fn test_purge_expired() {
        let store = LocalStore::new(10);
        store.set("a", b("1"), Duration::from_millis(10));
        store.set("b", b("2"), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_task_stops_on_shutdown() {
        let store = Arc::new(LocalStore::new(10));
        store.set("a", b("1"), Duration::from_millis(5));
        let (tx, rx) = broadcast::channel(1);
        let handle = spawn_expiry_sweep(Arc::clone(&store), Duration::from_millis(20), rx);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.is_empty());

        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
