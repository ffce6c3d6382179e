//! Monitoring Service - Cache Health Sampling and Alerting
//!
//! On a fixed interval the service measures a synthetic cache round trip, pulls
//! the manager's counters and remote server figures, and appends one sample per
//! metric to a rolling window. Independent timers check thresholds and refresh
//! the hourly baseline.
//!
//! ```text
//! sample tick  → collect_metrics → windows (pruned to retention)
//! alert tick   → check_alerts    → AlertBook (active ↔ history)
//! baseline tick→ update_baseline → reported, never alerted on
//! ```

pub mod alerts;
pub mod metrics;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache_manager::{CacheManager, SetOptions};
use crate::config::MonitoringConfig;
use crate::error::Result;

pub use alerts::{AlertBook, AlertRecord, AlertSeverity, AlertTransition};
pub use metrics::{
    Baseline, MetricSample, MetricSummary, MetricType, MetricWindows, Trend, classify_trend,
    parse_period,
};

/// Namespace of the synthetic probe entry
const PROBE_NAMESPACE: &str = "monitoring";
const PROBE_ID: &str = "probe";

/// Window the baseline averages over, in hours
const BASELINE_WINDOW_HOURS: i64 = 1;

/// Metrics gathered by one sampling cycle
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricSnapshot {
    pub timestamp: DateTime<Utc>,
    pub response_time_ms: f64,
    pub hit_rate: f64,
    pub error_rate: f64,
    pub ops_per_second: f64,
    pub memory_usage_percent: Option<f64>,
    pub key_count: Option<u64>,
}

/// Output of [`MonitoringService::get_monitoring_report`]
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringReport {
    pub generated_at: DateTime<Utc>,
    pub period: Duration,
    pub metrics: BTreeMap<MetricType, MetricSummary>,
    pub baseline: Option<Baseline>,
    pub active_alerts: Vec<AlertRecord>,
}

/// Periodic sampler and alert evaluator over a [`CacheManager`]
pub struct MonitoringService {
    manager: Arc<CacheManager>,
    config: MonitoringConfig,
    windows: Mutex<MetricWindows>,
    alerts: Mutex<AlertBook>,
    baseline: Mutex<Option<Baseline>>,
    /// Manager op counter and when it was read, for ops/second
    last_ops: Mutex<Option<(u64, Instant)>>,
    /// Metrics with a sample recorded since the last alert check
    unchecked: Mutex<BTreeSet<MetricType>>,
}

impl MonitoringService {
    pub fn new(manager: Arc<CacheManager>, config: MonitoringConfig) -> Self {
        let alerts = AlertBook::new(
            config.thresholds,
            config.alert_history_capacity,
            Duration::from_secs(config.alert_cooldown_secs),
        );
        Self {
            manager,
            config,
            windows: Mutex::new(MetricWindows::default()),
            alerts: Mutex::new(alerts),
            baseline: Mutex::new(None),
            last_ops: Mutex::new(None),
            unchecked: Mutex::new(BTreeSet::new()),
        }
    }

    /// Run one sampling cycle and record every derived metric
    #[allow(clippy::cast_precision_loss)]
    pub async fn collect_metrics(&self) -> MetricSnapshot {
        let started = Instant::now();
        let probe = Utc::now().timestamp_millis();
        self.manager
            .set(PROBE_NAMESPACE, PROBE_ID, &probe, SetOptions::ttl(Duration::from_secs(60)))
            .await;
        let _: Option<i64> = self.manager.get(PROBE_NAMESPACE, PROBE_ID, None).await;
        let response_time_ms = started.elapsed().as_secs_f64() * 1000.0;

        let stats = self.manager.get_stats();
        let error_rate = if stats.total_ops > 0 {
            stats.errors as f64 / stats.total_ops as f64 * 100.0
        } else {
            0.0
        };

        let ops_per_second = {
            let now = Instant::now();
            let mut last = self.last_ops.lock();
            let rate = match *last {
                Some((ops, at)) => {
                    let elapsed = now.duration_since(at).as_secs_f64();
                    if elapsed > 0.0 {
                        stats.total_ops.saturating_sub(ops) as f64 / elapsed
                    } else {
                        0.0
                    }
                }
                None => 0.0,
            };
            *last = Some((stats.total_ops, now));
            rate
        };

        let server = self.manager.server_stats().await;
        let snapshot = MetricSnapshot {
            timestamp: Utc::now(),
            response_time_ms,
            hit_rate: stats.hit_rate,
            error_rate,
            ops_per_second,
            memory_usage_percent: server.and_then(|s| s.memory_usage_percent()),
            key_count: server.map(|s| s.total_keys),
        };

        let mut samples = vec![
            (MetricType::ResponseTime, snapshot.response_time_ms),
            (MetricType::HitRate, snapshot.hit_rate),
            (MetricType::ErrorRate, snapshot.error_rate),
            (MetricType::OpsPerSecond, snapshot.ops_per_second),
        ];
        if let Some(memory) = snapshot.memory_usage_percent {
            samples.push((MetricType::MemoryUsage, memory));
        }
        if let Some(keys) = snapshot.key_count {
            samples.push((MetricType::KeyCount, keys as f64));
        }

        for (metric, value) in samples {
            self.record_sample_at(metric, value, snapshot.timestamp);
        }
        self.cleanup_metrics();

        debug!(
            response_time_ms = snapshot.response_time_ms,
            hit_rate = snapshot.hit_rate,
            error_rate = snapshot.error_rate,
            ops_per_second = snapshot.ops_per_second,
            "Collected cache metrics"
        );
        snapshot
    }

    /// Append a sample taken now
    pub fn record_sample(&self, metric: MetricType, value: f64) {
        self.record_sample_at(metric, value, Utc::now());
    }

    pub fn record_sample_at(&self, metric: MetricType, value: f64, timestamp: DateTime<Utc>) {
        self.windows
            .lock()
            .record(metric, MetricSample { value, timestamp });
        self.unchecked.lock().insert(metric);
    }

    /// Compare the latest sample of each metric with its threshold
    ///
    /// Only metrics sampled since the previous check are evaluated, so a check
    /// without new samples leaves every alert untouched.
    pub fn check_alerts(&self) -> Vec<AlertTransition> {
        let unchecked = std::mem::take(&mut *self.unchecked.lock());
        let latest: Vec<(MetricType, f64)> = {
            let windows = self.windows.lock();
            unchecked
                .into_iter()
                .filter_map(|metric| windows.latest(metric).map(|s| (metric, s.value)))
                .collect()
        };

        let now = Utc::now();
        let mut book = self.alerts.lock();
        let transitions: Vec<AlertTransition> = latest
            .into_iter()
            .filter_map(|(metric, value)| book.evaluate(metric, value, now))
            .collect();
        drop(book);

        for transition in &transitions {
            match transition {
                AlertTransition::Raised { record, quiet: false } => warn!(
                    metric = %record.metric,
                    severity = %record.severity,
                    value = record.value,
                    threshold = record.threshold,
                    "Cache alert: {}",
                    record.message
                ),
                AlertTransition::Raised { record, quiet: true } => debug!(
                    metric = %record.metric,
                    value = record.value,
                    "Cache alert re-raised within cooldown: {}",
                    record.message
                ),
                AlertTransition::Repeated { .. } => {}
                AlertTransition::Resolved { record } => info!(
                    metric = %record.metric,
                    count = record.count,
                    value = record.value,
                    "Cache alert resolved"
                ),
            }
        }
        transitions
    }

    /// Drop samples older than the retention window
    pub fn cleanup_metrics(&self) -> usize {
        let retention = chrono::Duration::from_std(Duration::from_secs(self.config.retention_secs))
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let horizon = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let removed = self.windows.lock().prune(horizon);
        if removed > 0 {
            debug!(count = removed, "Pruned expired metric samples");
        }
        removed
    }

    /// Recompute the baseline from the last hour, if every input has samples
    pub fn update_baseline(&self) -> Option<Baseline> {
        let from = Utc::now() - chrono::Duration::hours(BASELINE_WINDOW_HOURS);
        let averages = {
            let windows = self.windows.lock();
            [MetricType::ResponseTime, MetricType::HitRate, MetricType::OpsPerSecond]
                .map(|metric| MetricSummary::from_values(&windows.values_since(metric, from)))
        };
        let [Some(response_time), Some(hit_rate), Some(ops)] = averages else {
            debug!("Not enough recent samples to update baseline");
            return None;
        };

        let baseline = Baseline {
            response_time_ms: response_time.avg,
            hit_rate: hit_rate.avg,
            ops_per_second: ops.avg,
            computed_at: Utc::now(),
        };
        *self.baseline.lock() = Some(baseline);
        info!(
            response_time_ms = baseline.response_time_ms,
            hit_rate = baseline.hit_rate,
            ops_per_second = baseline.ops_per_second,
            "Updated performance baseline"
        );
        Some(baseline)
    }

    #[must_use]
    pub fn baseline(&self) -> Option<Baseline> {
        *self.baseline.lock()
    }

    /// Per-metric summaries over `period` (e.g. `"1h"`, `"30m"`)
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Configuration` when the period does not parse.
    pub fn get_monitoring_report(&self, period: &str) -> Result<MonitoringReport> {
        let period = parse_period(period)?;
        let now = Utc::now();
        let from = chrono::Duration::from_std(period)
            .ok()
            .and_then(|p| now.checked_sub_signed(p))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let metrics = {
            let windows = self.windows.lock();
            MetricType::ALL
                .iter()
                .filter_map(|&metric| {
                    MetricSummary::from_values(&windows.values_since(metric, from))
                        .map(|summary| (metric, summary))
                })
                .collect()
        };

        Ok(MonitoringReport {
            generated_at: now,
            period,
            metrics,
            baseline: self.baseline(),
            active_alerts: self.active_alerts(),
        })
    }

    /// Up to `limit` resolved alerts, newest first
    #[must_use]
    pub fn get_alert_history(&self, limit: usize) -> Vec<AlertRecord> {
        self.alerts.lock().history(limit)
    }

    #[must_use]
    pub fn active_alerts(&self) -> Vec<AlertRecord> {
        self.alerts.lock().active()
    }

    /// Spawn the sampling, alert and baseline timers
    ///
    /// Returns no handles when monitoring is disabled.
    pub fn start(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        if !self.config.enabled {
            info!("Cache monitoring disabled");
            return Vec::new();
        }
        info!(
            interval_secs = self.config.interval_secs,
            alert_check_interval_secs = self.config.alert_check_interval_secs,
            "Starting cache monitoring"
        );

        let sample = {
            let service = Arc::clone(self);
            periodic(self.config.interval_secs, shutdown.subscribe(), move || {
                let service = Arc::clone(&service);
                async move {
                    service.collect_metrics().await;
                }
            })
        };
        let alerts = {
            let service = Arc::clone(self);
            periodic(self.config.alert_check_interval_secs, shutdown.subscribe(), move || {
                let service = Arc::clone(&service);
                async move {
                    service.check_alerts();
                }
            })
        };
        let baseline = {
            let service = Arc::clone(self);
            periodic(self.config.baseline_interval_secs, shutdown.subscribe(), move || {
                let service = Arc::clone(&service);
                async move {
                    service.update_baseline();
                }
            })
        };
        vec![sample, alerts, baseline]
    }
}

/// Run `tick` every `interval_secs` until shutdown; the first run is one interval in
fn periodic<F, Fut>(interval_secs: u64, mut shutdown: broadcast::Receiver<()>, tick: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => tick().await,
                _ = shutdown.recv() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::router::CacheStrategy;

    async fn service() -> MonitoringService {
        let config = CacheConfig {
            strategy: CacheStrategy::LocalOnly,
            ..CacheConfig::default()
        };
        let manager = Arc::new(CacheManager::new(&config, None).await.unwrap());
        MonitoringService::new(manager, config.monitoring)
    }

    #[tokio::test]
    async fn test_collect_records_core_metrics() {
        let service = service().await;
        let snapshot = service.collect_metrics().await;

        assert!(snapshot.response_time_ms >= 0.0);
        assert_eq!(snapshot.memory_usage_percent, None);
        let report = service.get_monitoring_report("1h").unwrap();
        assert!(report.metrics.contains_key(&MetricType::ResponseTime));
        assert!(report.metrics.contains_key(&MetricType::HitRate));
        assert!(!report.metrics.contains_key(&MetricType::KeyCount));
    }

    #[tokio::test]
    async fn test_alert_check_without_new_sample_does_not_repeat() {
        let service = service().await;
        service.record_sample(MetricType::ResponseTime, 250.0);

        assert_eq!(service.check_alerts().len(), 1);
        assert!(service.check_alerts().is_empty());
        assert!(service.check_alerts().is_empty());
        assert_eq!(service.active_alerts().first().map(|a| a.count), Some(1));

        service.record_sample(MetricType::ResponseTime, 260.0);
        assert!(matches!(
            service.check_alerts().as_slice(),
            [AlertTransition::Repeated { count: 2, .. }]
        ));
    }

    #[tokio::test]
    async fn test_report_rejects_bad_period() {
        let service = service().await;
        assert!(service.get_monitoring_report("soon").is_err());
    }

    #[tokio::test]
    async fn test_baseline_requires_all_inputs() {
        let service = service().await;
        service.record_sample(MetricType::ResponseTime, 10.0);
        assert!(service.update_baseline().is_none());

        service.record_sample(MetricType::HitRate, 90.0);
        service.record_sample(MetricType::OpsPerSecond, 4.0);
        let baseline = service.update_baseline().unwrap();
        assert!((baseline.hit_rate - 90.0).abs() < f64::EPSILON);
        assert_eq!(service.baseline(), Some(baseline));
    }

    #[tokio::test]
    async fn test_cleanup_prunes_old_samples() {
        let service = service().await;
        service.record_sample_at(
            MetricType::HitRate,
            50.0,
            Utc::now() - chrono::Duration::hours(25),
        );
        service.record_sample(MetricType::HitRate, 60.0);

        assert_eq!(service.cleanup_metrics(), 1);
    }
}
