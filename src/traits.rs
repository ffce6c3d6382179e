//! Extension Traits
//!
//! This module defines the seams through which the cache subsystem talks to the
//! outside world. Everything behind these traits is treated as opaque and
//! fallible.
//!
//! # Architecture
//!
//! - `CacheCodec`: Trait for pluggable value serialization
//! - `RemoteBackend`: Raw client for the shared, network-accessible cache tier
//! - `QueryExecutor`: The relational query executor the query cache wraps
//! - `DataLoader`: A named warmup source producing key/value pairs
//!
//! # Example: Custom Remote Backend
//!
//! ```rust,ignore
//! use tiered_query_cache::{RemoteBackend, ServerStats, async_trait};
//! use bytes::Bytes;
//! use std::time::Duration;
//! use anyhow::Result;
//!
//! struct MyDistributedCache {
//!     // Your implementation
//! }
//!
//! #[async_trait]
//! impl RemoteBackend for MyDistributedCache {
//!     async fn get(&self, key: &str) -> Result<Option<Bytes>> { todo!() }
//!     async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> { todo!() }
//!     async fn delete(&self, key: &str) -> Result<bool> { todo!() }
//!     async fn delete_pattern(&self, pattern: &str) -> Result<u64> { todo!() }
//!     async fn ping(&self) -> Result<()> { todo!() }
//!     async fn flush(&self) -> Result<()> { todo!() }
//!     async fn server_stats(&self) -> Result<Option<ServerStats>> { Ok(None) }
//! }
//! ```

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Trait for cache value serialization/deserialization
///
/// Stores only ever see opaque bytes; the codec is the single place where values
/// are encoded on write and decoded on read.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync + Debug` to support concurrent access across async tasks
/// and provide debugging capabilities.
pub trait CacheCodec: Send + Sync + Debug {
    /// Serialize a value to bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented in this format.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize bytes to a value
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes do not decode into `T`.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;

    /// Get the name of the codec, used for logging
    fn name(&self) -> &'static str;
}

/// Memory and keyspace figures reported by a remote server
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerStats {
    /// Bytes currently used by the server
    pub used_memory: u64,
    /// Configured memory ceiling in bytes, `0` when unbounded
    pub max_memory: u64,
    /// Number of keys in the selected database
    pub total_keys: u64,
}

impl ServerStats {
    /// Memory usage as a percentage of the ceiling, `None` when unbounded
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn memory_usage_percent(&self) -> Option<f64> {
        if self.max_memory == 0 {
            None
        } else {
            Some(self.used_memory as f64 / self.max_memory as f64 * 100.0)
        }
    }
}

/// Raw client for the shared remote tier
///
/// Every operation may fail; callers never see these errors directly. The
/// [`RemoteStore`](crate::remote_store::RemoteStore) wrapper bounds each call with
/// a timeout and turns failures into misses and error counters.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` to support concurrent access across async tasks.
///
/// # Pattern Semantics
///
/// `delete_pattern` receives a glob in the Redis `MATCH` dialect. The manager only
/// ever issues `prefix*` patterns with `*`, `?`, `[`, `]` and `\` in the prefix
/// escaped by a backslash, so simple backends may support just that form.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Get raw bytes by key, `Ok(None)` on a miss
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Get raw bytes together with the key's remaining lifetime
    ///
    /// The lifetime is `None` when the key has no expiry. Backends that cannot
    /// report it fall back to a plain `get`, and copies made from their values
    /// use the caller's own TTL.
    async fn get_with_ttl(&self, key: &str) -> Result<Option<(Bytes, Option<Duration>)>> {
        Ok(self.get(key).await?.map(|value| (value, None)))
    }

    /// Store raw bytes, `None` TTL means no expiry
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()>;

    /// Delete a key, returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete every key matching the glob, returns how many were removed
    async fn delete_pattern(&self, pattern: &str) -> Result<u64>;

    /// Reachability probe
    async fn ping(&self) -> Result<()>;

    /// Remove every key in the selected database
    async fn flush(&self) -> Result<()>;

    /// Memory/keyspace figures when the server exposes them
    async fn server_stats(&self) -> Result<Option<ServerStats>>;

    /// Get the name of this backend (e.g., "Redis", "Memory")
    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// Rows returned by the external query executor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOutput {
    pub rows: Vec<serde_json::Value>,
    pub row_count: u64,
}

impl QueryOutput {
    #[must_use]
    pub fn new(rows: Vec<serde_json::Value>) -> Self {
        let row_count = rows.len() as u64;
        Self { rows, row_count }
    }
}

/// The relational query executor wrapped by the query cache
///
/// Errors are propagated to the caller unchanged and never cached.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, sql: &str, params: &[serde_json::Value]) -> Result<QueryOutput>;
}

/// A named warmup source
///
/// A loader returns the full set of entries to pre-populate; an empty map is a
/// valid result. Closures returning a future implement this trait directly.
#[async_trait]
pub trait DataLoader: Send + Sync {
    async fn load(&self) -> Result<HashMap<String, serde_json::Value>>;
}

#[async_trait]
impl<F, Fut> DataLoader for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HashMap<String, serde_json::Value>>> + Send + 'static,
{
    async fn load(&self) -> Result<HashMap<String, serde_json::Value>> {
        (self)().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_usage_percent() {
        let bounded = ServerStats {
            used_memory: 50,
            max_memory: 200,
            total_keys: 3,
        };
        assert_eq!(bounded.memory_usage_percent(), Some(25.0));
        assert_eq!(ServerStats::default().memory_usage_percent(), None);
    }

    #[tokio::test]
    async fn test_closure_loader() {
        let loader = || async {
            let mut entries = HashMap::new();
            entries.insert("a".to_string(), serde_json::json!(1));
            Ok::<_, anyhow::Error>(entries)
        };
        let entries = loader.load().await.unwrap();
        assert_eq!(entries.len(), 1);
    }
}
