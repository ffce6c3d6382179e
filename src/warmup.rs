//! Warmup Scheduler - Proactive Cache Population
//!
//! Runs a registry of named [`DataLoader`]s on demand, on a fixed interval and
//! optionally once at startup. A run sorts tasks by priority, splits them into
//! batches and executes each batch with a hard ceiling on in-flight loaders
//! (counting semaphore). Failed loaders are retried in a bounded loop with a
//! linearly growing delay.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache_manager::{CacheManager, SetOptions};
use crate::config::WarmupConfig;
use crate::error::{CacheError, Result};
use crate::traits::DataLoader;

/// Loader priority; lower rank runs sooner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmupPriority {
    High,
    Medium,
    Low,
}

impl WarmupPriority {
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }
}

/// A registered loader
#[derive(Clone)]
pub struct WarmupEntry {
    pub name: String,
    pub priority: WarmupPriority,
    pub ttl: Duration,
    loader: Arc<dyn DataLoader>,
}

/// One task of a run, created fresh from the registry
struct WarmupTask {
    id: Uuid,
    task_type: String,
    priority: u8,
    ttl: Duration,
    max_retries: u32,
    loader: Arc<dyn DataLoader>,
}

impl WarmupTask {
    fn from_entry(entry: &WarmupEntry, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: entry.name.clone(),
            priority: entry.priority.rank(),
            ttl: entry.ttl,
            max_retries,
            loader: Arc::clone(&entry.loader),
        }
    }
}

/// Result of a single task
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    pub task_type: String,
    pub namespace: String,
    pub success: bool,
    pub attempts: u32,
    pub items_loaded: usize,
    pub items_cached: usize,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Result of a full run
#[derive(Debug, Clone, Serialize)]
pub struct WarmupReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub items_cached: usize,
    pub outcomes: Vec<TaskOutcome>,
}

/// Cumulative warmup counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WarmupStats {
    pub total_runs: u64,
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub total_items: u64,
    pub cached_items: u64,
    pub avg_run_duration_ms: f64,
    pub last_run: Option<DateTime<Utc>>,
}

/// Resets the running flag when a run ends, even on panic
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Scheduler for the loader registry
pub struct WarmupScheduler {
    manager: Arc<CacheManager>,
    config: WarmupConfig,
    registry: RwLock<Vec<WarmupEntry>>,
    semaphore: Arc<Semaphore>,
    running: AtomicBool,
    stats: Mutex<WarmupStats>,
}

impl WarmupScheduler {
    pub fn new(manager: Arc<CacheManager>, config: WarmupConfig) -> Self {
        let permits = config.max_concurrency.max(1);
        Self {
            manager,
            semaphore: Arc::new(Semaphore::new(permits)),
            config,
            registry: RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
            stats: Mutex::new(WarmupStats::default()),
        }
    }

    /// Register (or replace) a named loader
    pub fn register<L>(&self, name: impl Into<String>, priority: WarmupPriority, ttl: Duration, loader: L)
    where
        L: DataLoader + 'static,
    {
        self.register_loader(name, priority, ttl, Arc::new(loader));
    }

    /// Same as [`register`](Self::register) for an already shared loader
    pub fn register_loader(
        &self,
        name: impl Into<String>,
        priority: WarmupPriority,
        ttl: Duration,
        loader: Arc<dyn DataLoader>,
    ) {
        let entry = WarmupEntry {
            name: name.into(),
            priority,
            ttl,
            loader,
        };
        let mut registry = self.registry.write();
        registry.retain(|existing| existing.name != entry.name);
        debug!(task = %entry.name, priority = ?entry.priority, "Registered warmup loader");
        registry.push(entry);
    }

    #[must_use]
    pub fn registered_types(&self) -> Vec<String> {
        self.registry.read().iter().map(|e| e.name.clone()).collect()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run every registered loader
    ///
    /// Returns `None` without doing anything when a run is already in progress.
    pub async fn perform_warmup(&self) -> Option<WarmupReport> {
        if self.running.swap(true, Ordering::AcqRel) {
            info!("Warmup already in progress, skipping");
            return None;
        }
        let _running = RunGuard(&self.running);

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();

        let mut tasks: Vec<WarmupTask> = self
            .registry
            .read()
            .iter()
            .map(|entry| WarmupTask::from_entry(entry, self.config.max_retries))
            .collect();
        tasks.sort_by_key(|task| task.priority);

        let batch_size = self.config.batch_size.max(1);
        info!(run_id = %run_id, tasks = tasks.len(), batch_size, "Starting cache warmup");

        let mut outcomes = Vec::with_capacity(tasks.len());
        for (index, batch) in tasks.chunks(batch_size).enumerate() {
            debug!(run_id = %run_id, batch = index + 1, size = batch.len(), "Running warmup batch");
            outcomes.extend(join_all(batch.iter().map(|task| self.run_task(task))).await);
        }

        let report = WarmupReport {
            run_id,
            started_at,
            duration: started.elapsed(),
            total_tasks: outcomes.len(),
            completed_tasks: outcomes.iter().filter(|o| o.success).count(),
            failed_tasks: outcomes.iter().filter(|o| !o.success).count(),
            items_cached: outcomes.iter().map(|o| o.items_cached).sum(),
            outcomes,
        };
        self.record_run(&report);

        info!(
            run_id = %run_id,
            completed = report.completed_tasks,
            failed = report.failed_tasks,
            items_cached = report.items_cached,
            duration = ?report.duration,
            "Cache warmup finished"
        );
        Some(report)
    }

    /// Run a single registered loader now
    ///
    /// # Errors
    ///
    /// `Configuration` when `name` is not registered, `LoaderFailure` when the
    /// loader keeps failing after its retries.
    pub async fn warmup_type(&self, name: &str) -> Result<TaskOutcome> {
        let task = self
            .registry
            .read()
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| WarmupTask::from_entry(entry, self.config.max_retries))
            .ok_or_else(|| CacheError::config(format!("unknown warmup type '{name}'")))?;

        let outcome = self.run_task(&task).await;
        {
            let mut stats = self.stats.lock();
            stats.total_tasks += 1;
            stats.total_items += outcome.items_loaded as u64;
            stats.cached_items += outcome.items_cached as u64;
            if outcome.success {
                stats.completed_tasks += 1;
            } else {
                stats.failed_tasks += 1;
            }
        }

        if outcome.success {
            Ok(outcome)
        } else {
            Err(CacheError::LoaderFailure {
                task: outcome.task_type,
                attempts: outcome.attempts,
                message: outcome.error.unwrap_or_default(),
            })
        }
    }

    #[must_use]
    pub fn stats(&self) -> WarmupStats {
        *self.stats.lock()
    }

    /// Spawn the scheduled runs (and the startup run when enabled)
    ///
    /// Returns `None` when warmup is disabled.
    pub fn start(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Option<JoinHandle<()>> {
        if !self.config.enabled {
            info!("Cache warmup disabled");
            return None;
        }

        let scheduler = Arc::clone(self);
        let interval = Duration::from_secs(self.config.interval_secs.max(1));
        Some(tokio::spawn(async move {
            if scheduler.config.on_startup {
                scheduler.perform_warmup().await;
            }

            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.perform_warmup().await;
                    }
                    _ = shutdown.recv() => {
                        debug!("Warmup scheduler shutting down");
                        break;
                    }
                }
            }
        }))
    }

    async fn run_task(&self, task: &WarmupTask) -> TaskOutcome {
        let started = Instant::now();
        let namespace = self.config.namespace_for(&task.task_type).to_string();
        let mut outcome = TaskOutcome {
            task_id: task.id,
            task_type: task.task_type.clone(),
            namespace: namespace.clone(),
            success: false,
            attempts: 0,
            items_loaded: 0,
            items_cached: 0,
            error: None,
            duration: Duration::ZERO,
        };

        let Ok(_permit) = self.semaphore.acquire().await else {
            outcome.error = Some("warmup semaphore closed".to_string());
            return outcome;
        };

        let max_attempts = task.max_retries.saturating_add(1);
        let retry_delay = Duration::from_millis(self.config.retry_delay_ms);

        let entries = loop {
            outcome.attempts += 1;
            match task.loader.load().await {
                Ok(entries) => break Some(entries),
                Err(e) if outcome.attempts < max_attempts => {
                    let delay = retry_delay * outcome.attempts;
                    warn!(
                        task = %task.task_type,
                        attempt = outcome.attempts,
                        retry_in = ?delay,
                        error = %e,
                        "Warmup loader failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(task = %task.task_type, attempts = outcome.attempts, error = %e, "Warmup loader failed");
                    outcome.error = Some(format!("{e:#}"));
                    break None;
                }
            }
        };

        if let Some(entries) = entries {
            outcome.items_loaded = entries.len();
            let sets = entries.iter().map(|(key, value)| {
                self.manager
                    .set(&namespace, key, value, SetOptions::ttl(task.ttl))
            });
            outcome.items_cached = join_all(sets).await.into_iter().filter(|ok| *ok).count();
            outcome.success = true;
            debug!(
                task = %task.task_type,
                namespace = %namespace,
                loaded = outcome.items_loaded,
                cached = outcome.items_cached,
                "Warmup task completed"
            );
        }

        outcome.duration = started.elapsed();
        outcome
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_run(&self, report: &WarmupReport) {
        let mut stats = self.stats.lock();
        stats.total_runs += 1;
        stats.total_tasks += report.total_tasks as u64;
        stats.completed_tasks += report.completed_tasks as u64;
        stats.failed_tasks += report.failed_tasks as u64;
        stats.total_items += report.outcomes.iter().map(|o| o.items_loaded as u64).sum::<u64>();
        stats.cached_items += report.items_cached as u64;
        let n = stats.total_runs as f64;
        stats.avg_run_duration_ms =
            (stats.avg_run_duration_ms * (n - 1.0) + report.duration.as_secs_f64() * 1000.0) / n;
        stats.last_run = Some(report.started_at);
    }
}
