//! Metric samples, rolling windows, trend classification and period parsing

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Sampled metric kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    /// Probe round trip in milliseconds
    ResponseTime,
    /// Percentage of reads that hit
    HitRate,
    /// `errors / total_ops * 100`
    ErrorRate,
    OpsPerSecond,
    /// Remote memory usage percentage
    MemoryUsage,
    /// Remote keyspace size
    KeyCount,
}

impl MetricType {
    pub const ALL: [Self; 6] = [
        Self::ResponseTime,
        Self::HitRate,
        Self::ErrorRate,
        Self::OpsPerSecond,
        Self::MemoryUsage,
        Self::KeyCount,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ResponseTime => "response_time",
            Self::HitRate => "hit_rate",
            Self::ErrorRate => "error_rate",
            Self::OpsPerSecond => "ops_per_second",
            Self::MemoryUsage => "memory_usage",
            Self::KeyCount => "key_count",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Coarse direction of a metric over a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

/// Relative change between the two halves of the window above which a trend is reported
const TREND_THRESHOLD_PERCENT: f64 = 10.0;

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let len = values.len() as f64;
    Some(values.iter().sum::<f64>() / len)
}

/// Compare the mean of the later half of `values` with the earlier half
#[must_use]
pub fn classify_trend(values: &[f64]) -> Trend {
    if values.len() < 2 {
        return Trend::Stable;
    }
    let (first, second) = values.split_at(values.len() / 2);
    let (Some(first), Some(second)) = (mean(first), mean(second)) else {
        return Trend::Stable;
    };

    if first == 0.0 {
        return if second > 0.0 {
            Trend::Increasing
        } else if second < 0.0 {
            Trend::Decreasing
        } else {
            Trend::Stable
        };
    }

    let change = (second - first) / first.abs() * 100.0;
    if change > TREND_THRESHOLD_PERCENT {
        Trend::Increasing
    } else if change < -TREND_THRESHOLD_PERCENT {
        Trend::Decreasing
    } else {
        Trend::Stable
    }
}

/// Aggregate of one metric over a period
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricSummary {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub latest: f64,
    pub samples: usize,
    pub trend: Trend,
}

impl MetricSummary {
    /// `None` for an empty slice
    #[must_use]
    pub fn from_values(values: &[f64]) -> Option<Self> {
        let latest = *values.last()?;
        Some(Self {
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            avg: mean(values)?,
            latest,
            samples: values.len(),
            trend: classify_trend(values),
        })
    }
}

/// Reference averages recomputed hourly, reported but never alerted on
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Baseline {
    pub response_time_ms: f64,
    pub hit_rate: f64,
    pub ops_per_second: f64,
    pub computed_at: DateTime<Utc>,
}

/// Per-metric rolling sample sequences, oldest first
#[derive(Debug, Default)]
pub struct MetricWindows {
    series: HashMap<MetricType, VecDeque<MetricSample>>,
}

impl MetricWindows {
    pub fn record(&mut self, metric: MetricType, sample: MetricSample) {
        self.series.entry(metric).or_default().push_back(sample);
    }

    /// Drop samples older than `horizon`, returns how many were removed
    pub fn prune(&mut self, horizon: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for samples in self.series.values_mut() {
            while samples.front().is_some_and(|s| s.timestamp < horizon) {
                samples.pop_front();
                removed += 1;
            }
        }
        self.series.retain(|_, samples| !samples.is_empty());
        removed
    }

    #[must_use]
    pub fn latest(&self, metric: MetricType) -> Option<MetricSample> {
        self.series.get(&metric)?.back().copied()
    }

    /// Values recorded at or after `from`, oldest first
    #[must_use]
    pub fn values_since(&self, metric: MetricType, from: DateTime<Utc>) -> Vec<f64> {
        self.series.get(&metric).map_or_else(Vec::new, |samples| {
            samples
                .iter()
                .filter(|s| s.timestamp >= from)
                .map(|s| s.value)
                .collect()
        })
    }

    #[must_use]
    pub fn len(&self, metric: MetricType) -> usize {
        self.series.get(&metric).map_or(0, VecDeque::len)
    }

    #[must_use]
    pub fn total_samples(&self) -> usize {
        self.series.values().map(VecDeque::len).sum()
    }
}

/// Parse `"30s"`, `"15m"`, `"1h"`, `"7d"`; a bare number is seconds
///
/// # Errors
///
/// Returns `CacheError::Configuration` for an empty, zero or malformed period.
pub fn parse_period(period: &str) -> Result<Duration> {
    let period = period.trim();
    let invalid = || CacheError::config(format!("invalid period '{period}'"));

    let split = period
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(period.len());
    let (digits, unit) = period.split_at(split);
    let amount: u64 = digits.parse().map_err(|_| invalid())?;
    let unit_secs = match unit.trim() {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        _ => return Err(invalid()),
    };

    match amount.checked_mul(unit_secs) {
        Some(0) | None => Err(invalid()),
        Some(secs) => Ok(Duration::from_secs(secs)),
    }
}
