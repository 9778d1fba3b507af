//! Hourly performance metrics and percentile computation
//!
//! Durations are bucketed by hour-since-epoch. Each bucket keeps, per
//! operation, counters plus a rolling window of the most recent durations
//! (100 by default). Percentiles are computed from those windows at query
//! time, so for busy operations they describe the latest samples of each
//! hour rather than the whole hour. That bias is accepted in exchange for
//! bounded memory.

use crate::{
    clock::{hour_start, Clock},
    config::{LogLevel, MetricsConfig},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

/// Outcome of a completed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Success,
    Error,
}

/// Per-operation aggregate inside one hour bucket
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationStats {
    pub requests: u64,
    pub errors: u64,
    pub total_duration_ms: u64,
    pub min_duration_ms: Option<u64>,
    pub max_duration_ms: u64,
    /// Most recent durations, oldest first
    pub samples: VecDeque<u64>,
}

impl OperationStats {
    fn record(&mut self, duration_ms: u64, status: OperationStatus, sample_window: usize) {
        self.requests += 1;
        if status == OperationStatus::Error {
            self.errors += 1;
        }
        self.total_duration_ms = self.total_duration_ms.saturating_add(duration_ms);
        self.min_duration_ms = Some(
            self.min_duration_ms
                .map_or(duration_ms, |min| min.min(duration_ms)),
        );
        self.max_duration_ms = self.max_duration_ms.max(duration_ms);

        while self.samples.len() >= sample_window {
            self.samples.pop_front();
        }
        self.samples.push_back(duration_ms);
    }

    pub fn successes(&self) -> u64 {
        self.requests - self.errors
    }
}

/// Everything observed during one hour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricBucket {
    pub hour: i64,
    pub operations: HashMap<String, OperationStats>,
    pub log_levels: BTreeMap<LogLevel, u64>,
}

impl MetricBucket {
    fn new(hour: i64) -> Self {
        Self {
            hour,
            operations: HashMap::new(),
            log_levels: BTreeMap::new(),
        }
    }
}

/// Duration percentiles in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50: u64,
    pub p90: u64,
    pub p95: u64,
    pub p99: u64,
}

impl Percentiles {
    /// Compute from an ascending sample
    pub fn from_sorted(sorted: &[u64]) -> Self {
        Self {
            p50: percentile(sorted, 50),
            p90: percentile(sorted, 90),
            p95: percentile(sorted, 95),
            p99: percentile(sorted, 99),
        }
    }

    /// `(quantile, value_ms)` pairs in exposition order
    pub fn quantiles(&self) -> [(f64, u64); 4] {
        [
            (0.5, self.p50),
            (0.9, self.p90),
            (0.95, self.p95),
            (0.99, self.p99),
        ]
    }
}

/// Nearest-rank percentile: index `ceil(p/100 * n) - 1`, clamped to the sample
pub fn percentile(sorted: &[u64], p: u32) -> u64 {
    if sorted.is_empty() {
        return 0;
    }

    let n = sorted.len() as u64;
    let rank = (u64::from(p) * n).div_ceil(100);
    let index = rank.saturating_sub(1).min(n - 1) as usize;
    sorted[index]
}

/// Aggregated view of one operation over a query window
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationSummary {
    pub requests: u64,
    pub successes: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub total_duration_ms: u64,
    pub average_duration_ms: f64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    pub percentiles: Percentiles,
    pub sample_size: usize,
}

/// One point of the hourly time series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HourlyPoint {
    pub hour: i64,
    pub start: DateTime<Utc>,
    pub requests: u64,
    pub errors: u64,
    pub average_response_time_ms: f64,
}

/// Result of [`MetricsAggregator::query`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub generated_at: DateTime<Utc>,
    pub window_hours: u32,
    pub total_requests: u64,
    pub total_errors: u64,
    pub error_rate: f64,
    pub average_response_time_ms: f64,
    pub operations: BTreeMap<String, OperationSummary>,
    pub log_levels: BTreeMap<LogLevel, u64>,
    pub hourly: Vec<HourlyPoint>,
}

#[derive(Default)]
struct OperationAccumulator {
    requests: u64,
    errors: u64,
    total_duration_ms: u64,
    min_duration_ms: Option<u64>,
    max_duration_ms: u64,
    samples: Vec<u64>,
}

impl OperationAccumulator {
    fn add(&mut self, stats: &OperationStats) {
        self.requests = self.requests.saturating_add(stats.requests);
        self.errors = self.errors.saturating_add(stats.errors);
        self.total_duration_ms = self.total_duration_ms.saturating_add(stats.total_duration_ms);
        if let Some(min) = stats.min_duration_ms {
            self.min_duration_ms = Some(self.min_duration_ms.map_or(min, |m| m.min(min)));
        }
        self.max_duration_ms = self.max_duration_ms.max(stats.max_duration_ms);
        self.samples.extend(stats.samples.iter().copied());
    }

    fn finish(mut self) -> OperationSummary {
        self.samples.sort_unstable();

        OperationSummary {
            requests: self.requests,
            successes: self.requests.saturating_sub(self.errors),
            errors: self.errors,
            error_rate: ratio(self.errors as f64, self.requests),
            total_duration_ms: self.total_duration_ms,
            average_duration_ms: ratio(self.total_duration_ms as f64, self.requests),
            min_duration_ms: self.min_duration_ms.unwrap_or(0),
            max_duration_ms: self.max_duration_ms,
            percentiles: Percentiles::from_sorted(&self.samples),
            sample_size: self.samples.len(),
        }
    }
}

fn saturating_total(values: impl Iterator<Item = u64>) -> u64 {
    values.fold(0, u64::saturating_add)
}

fn ratio(numerator: f64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator / denominator as f64
    }
}

/// Names used when mirroring into the `metrics` facade
#[derive(Debug)]
struct FacadeNames {
    requests: String,
    errors: String,
    response_time: String,
}

/// In-memory, hour-bucketed metrics store
///
/// The bucket map is behind a `RwLock` that is only write-locked to insert a
/// new hour or to evict; each bucket has its own mutex so recording into the
/// current hour never blocks a query walking older hours.
#[derive(Debug)]
pub struct MetricsAggregator {
    clock: Arc<dyn Clock>,
    enabled: bool,
    sample_window: usize,
    retention_hours: i64,
    facade: Option<FacadeNames>,
    buckets: RwLock<BTreeMap<i64, Arc<Mutex<MetricBucket>>>>,
}

impl MetricsAggregator {
    pub fn new(config: &MetricsConfig, clock: Arc<dyn Clock>) -> Self {
        let facade = config.facade_enabled.then(|| FacadeNames {
            requests: format!("{}_requests_total", config.namespace),
            errors: format!("{}_errors_total", config.namespace),
            response_time: format!("{}_response_time_ms", config.namespace),
        });

        Self {
            clock,
            enabled: config.enabled,
            sample_window: config.sample_window.max(1),
            retention_hours: i64::from(config.retention_days.max(1)) * 24,
            facade,
            buckets: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn bucket(&self, hour: i64) -> Arc<Mutex<MetricBucket>> {
        if let Some(bucket) = crate::read(&self.buckets).get(&hour) {
            return Arc::clone(bucket);
        }

        let mut buckets = crate::write(&self.buckets);
        Arc::clone(
            buckets
                .entry(hour)
                .or_insert_with(|| Arc::new(Mutex::new(MetricBucket::new(hour)))),
        )
    }

    /// Record a completed operation into the current hour
    pub fn record(&self, operation: &str, duration_ms: u64, status: OperationStatus) {
        if !self.enabled {
            return;
        }

        let bucket = self.bucket(self.clock.current_hour());
        crate::lock(&bucket)
            .operations
            .entry(operation.to_string())
            .or_default()
            .record(duration_ms, status, self.sample_window);

        if let Some(names) = &self.facade {
            ::metrics::counter!(names.requests.clone(), "operation" => operation.to_string())
                .increment(1);
            if status == OperationStatus::Error {
                ::metrics::counter!(names.errors.clone(), "operation" => operation.to_string())
                    .increment(1);
            }
            ::metrics::histogram!(names.response_time.clone(), "operation" => operation.to_string())
                .record(duration_ms as f64);
        }
    }

    /// Count an emitted log entry into the current hour
    pub fn record_log(&self, level: LogLevel) {
        if !self.enabled {
            return;
        }

        let bucket = self.bucket(self.clock.current_hour());
        *crate::lock(&bucket).log_levels.entry(level).or_insert(0) += 1;
    }

    /// Summarize the buckets from `now_hour - hours` through `now_hour`
    ///
    /// The hourly series never reaches back further than the retention
    /// window, however large `hours` is.
    pub fn query(&self, hours: u32) -> PerformanceSummary {
        let now = self.clock.now();
        let now_hour = crate::clock::hour_key(now);
        let from_hour = now_hour - i64::from(hours);

        let window: Vec<Arc<Mutex<MetricBucket>>> = crate::read(&self.buckets)
            .range(from_hour..=now_hour)
            .map(|(_, bucket)| Arc::clone(bucket))
            .collect();

        let mut accumulators: BTreeMap<String, OperationAccumulator> = BTreeMap::new();
        let mut log_levels: BTreeMap<LogLevel, u64> = BTreeMap::new();
        let mut per_hour: HashMap<i64, (u64, u64, u64)> = HashMap::new();

        for bucket in window {
            let bucket = crate::lock(&bucket);
            let hourly = per_hour.entry(bucket.hour).or_default();

            for (operation, stats) in &bucket.operations {
                accumulators.entry(operation.clone()).or_default().add(stats);
                hourly.0 = hourly.0.saturating_add(stats.requests);
                hourly.1 = hourly.1.saturating_add(stats.errors);
                hourly.2 = hourly.2.saturating_add(stats.total_duration_ms);
            }

            for (level, count) in &bucket.log_levels {
                let total = log_levels.entry(*level).or_insert(0);
                *total = total.saturating_add(*count);
            }
        }

        let operations: BTreeMap<String, OperationSummary> = accumulators
            .into_iter()
            .map(|(operation, acc)| (operation, acc.finish()))
            .collect();

        let total_requests = saturating_total(operations.values().map(|o| o.requests));
        let total_errors = saturating_total(operations.values().map(|o| o.errors));
        let total_duration = saturating_total(operations.values().map(|o| o.total_duration_ms));

        let series_from = from_hour.max(now_hour - self.retention_hours);
        let hourly = (series_from..=now_hour)
            .map(|hour| {
                let (requests, errors, duration) =
                    per_hour.get(&hour).copied().unwrap_or_default();
                HourlyPoint {
                    hour,
                    start: hour_start(hour),
                    requests,
                    errors,
                    average_response_time_ms: ratio(duration as f64, requests),
                }
            })
            .collect();

        PerformanceSummary {
            generated_at: now,
            window_hours: hours,
            total_requests,
            total_errors,
            error_rate: ratio(total_errors as f64, total_requests),
            average_response_time_ms: ratio(total_duration as f64, total_requests),
            operations,
            log_levels,
            hourly,
        }
    }

    /// Drop buckets older than `retention_days`; returns how many were removed
    pub fn cleanup(&self, retention_days: u32) -> usize {
        let cutoff = self.clock.current_hour() - i64::from(retention_days) * 24;

        let mut buckets = crate::write(&self.buckets);
        let kept = buckets.split_off(&cutoff);
        let removed = buckets.len();
        *buckets = kept;

        if removed > 0 {
            tracing::debug!(
                telemetry.event = "metric_buckets_evicted",
                removed = removed,
                cutoff_hour = cutoff,
                "Evicted expired metric buckets"
            );
        }

        removed
    }

    /// Copy of the bucket for `hour`, if one exists
    pub fn bucket_snapshot(&self, hour: i64) -> Option<MetricBucket> {
        let bucket = crate::read(&self.buckets).get(&hour).map(Arc::clone)?;
        let snapshot = crate::lock(&bucket).clone();
        Some(snapshot)
    }

    /// Hour keys currently held, ascending
    pub fn bucket_hours(&self) -> Vec<i64> {
        crate::read(&self.buckets).keys().copied().collect()
    }

    /// Drop every bucket
    pub fn clear(&self) {
        crate::write(&self.buckets).clear();
    }
}
