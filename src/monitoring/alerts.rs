//! Threshold alerting with deduplication, resolution and a bounded history

use std::collections::{HashMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::metrics::MetricType;
use crate::config::AlertThresholds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        })
    }
}

/// One alert, active until its metric returns within threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: Uuid,
    pub metric: MetricType,
    pub severity: AlertSeverity,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Number of consecutive checks that crossed the threshold
    pub count: u64,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// What a single evaluation did
#[derive(Debug, Clone, PartialEq)]
pub enum AlertTransition {
    /// New alert; `quiet` when it re-crossed within the cooldown of its last resolution
    Raised { record: AlertRecord, quiet: bool },
    /// Still crossing; count and `last_seen` updated
    Repeated { metric: MetricType, count: u64 },
    /// Back within threshold; the record moved to history
    Resolved { record: AlertRecord },
}

/// Threshold rule of a metric: `(threshold, alert when above, severity)`
fn rule(thresholds: &AlertThresholds, metric: MetricType) -> Option<(f64, bool, AlertSeverity)> {
    match metric {
        MetricType::ResponseTime => Some((thresholds.response_time_ms, true, AlertSeverity::Warning)),
        MetricType::MemoryUsage => Some((thresholds.memory_usage_percent, true, AlertSeverity::Warning)),
        MetricType::HitRate => Some((thresholds.hit_rate_percent, false, AlertSeverity::Info)),
        MetricType::ErrorRate => Some((thresholds.error_rate_percent, true, AlertSeverity::Error)),
        MetricType::OpsPerSecond | MetricType::KeyCount => None,
    }
}

fn describe(metric: MetricType, value: f64, threshold: f64) -> String {
    match metric {
        MetricType::ResponseTime => {
            format!("Cache response time {value:.1}ms exceeds {threshold:.0}ms")
        }
        MetricType::MemoryUsage => {
            format!("Cache memory usage {value:.1}% exceeds {threshold:.0}%")
        }
        MetricType::HitRate => format!("Cache hit rate {value:.1}% below {threshold:.0}%"),
        MetricType::ErrorRate => format!("Cache error rate {value:.1}% exceeds {threshold:.0}%"),
        MetricType::OpsPerSecond | MetricType::KeyCount => format!("{metric} at {value:.1}"),
    }
}

/// Active alerts keyed by metric plus a ring buffer of resolved ones
#[derive(Debug)]
pub struct AlertBook {
    thresholds: AlertThresholds,
    active: HashMap<MetricType, AlertRecord>,
    history: VecDeque<AlertRecord>,
    capacity: usize,
    cooldown: chrono::Duration,
    last_resolved: HashMap<MetricType, DateTime<Utc>>,
}

impl AlertBook {
    #[must_use]
    pub fn new(thresholds: AlertThresholds, capacity: usize, cooldown: std::time::Duration) -> Self {
        Self {
            thresholds,
            active: HashMap::new(),
            history: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            cooldown: chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::zero()),
            last_resolved: HashMap::new(),
        }
    }

    /// Compare `value` with the metric's threshold and update the book
    pub fn evaluate(&mut self, metric: MetricType, value: f64, now: DateTime<Utc>) -> Option<AlertTransition> {
        let (threshold, above, severity) = rule(&self.thresholds, metric)?;
        let crossing = if above { value > threshold } else { value < threshold };

        if crossing {
            if let Some(record) = self.active.get_mut(&metric) {
                record.count += 1;
                record.last_seen = now;
                record.value = value;
                return Some(AlertTransition::Repeated {
                    metric,
                    count: record.count,
                });
            }

            let quiet = self
                .last_resolved
                .get(&metric)
                .is_some_and(|resolved| now - *resolved < self.cooldown);
            let record = AlertRecord {
                id: Uuid::new_v4(),
                metric,
                severity,
                message: describe(metric, value, threshold),
                value,
                threshold,
                first_seen: now,
                last_seen: now,
                count: 1,
                resolved_at: None,
            };
            self.active.insert(metric, record.clone());
            return Some(AlertTransition::Raised { record, quiet });
        }

        let mut record = self.active.remove(&metric)?;
        record.resolved_at = Some(now);
        record.value = value;
        self.last_resolved.insert(metric, now);
        if self.history.len() >= self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(record.clone());
        Some(AlertTransition::Resolved { record })
    }

    /// Active alerts, most severe first
    #[must_use]
    pub fn active(&self) -> Vec<AlertRecord> {
        let mut active: Vec<AlertRecord> = self.active.values().cloned().collect();
        active.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.first_seen.cmp(&b.first_seen)));
        active
    }

    /// Up to `limit` resolved alerts, newest first
    #[must_use]
    pub fn history(&self, limit: usize) -> Vec<AlertRecord> {
        self.history.iter().rev().take(limit).cloned().collect()
    }
}
