//! Remote Backend Implementations
//!
//! This module contains the implementations of [`RemoteBackend`](crate::traits::RemoteBackend)
//! that can sit behind the remote tier.
//!
//! # Available Backends
//!
//! - **Redis** - Distributed cache shared across processes (feature: `redis`, on by default)
//! - **Memory** - `DashMap`-based in-process backend with outage/latency simulation
//!
//! # Usage
//!
//! ```rust,no_run
//! use tiered_query_cache::backends::{MemoryBackend, RedisBackend};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let redis = RedisBackend::with_url("redis://127.0.0.1:6379/0").await?;
//! let memory = MemoryBackend::new();
//! # Ok(())
//! # }
//! ```

pub mod memory_cache;

#[cfg(feature = "redis")]
pub mod redis_cache;

pub use memory_cache::MemoryBackend;

#[cfg(feature = "redis")]
pub use redis_cache::RedisBackend;
