//! Metrics collection for gateway operations.
//!
//! Components report through the [`MetricsCollector`] trait; nothing in the
//! core formats or exports metrics itself. The in-memory collector exists for
//! tests and for processes that poll [`MetricsSnapshot`] from a health
//! endpoint.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// Sink for gateway metrics.
///
/// All methods must be cheap and must never fail into the caller; a slow or
/// panicking collector is a bug in the collector, not in the component
/// reporting to it.
pub trait MetricsCollector: Send + Sync {
    /// Adds `value` to the named counter.
    fn increment_counter(&self, name: &str, value: u64, labels: &[(&str, &str)]);

    /// Records one observation in the named histogram.
    fn record_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]);

    /// Sets the named gauge to `value`.
    fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]);
}

/// Aggregate view of a histogram's observations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistogramSummary {
    /// Number of observations
    pub count: usize,
    /// Sum of all observations
    pub sum: f64,
    /// Smallest observation
    pub min: f64,
    /// Largest observation
    pub max: f64,
}

/// Read-only snapshot of everything a collector has accumulated.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// When the snapshot was taken
    pub generated_at: DateTime<Utc>,
    /// Counter values, keyed by `name` or `name:label=value,...`
    pub counters: HashMap<String, u64>,
    /// Gauge values
    pub gauges: HashMap<String, f64>,
    /// Histogram summaries
    pub histograms: HashMap<String, HistogramSummary>,
}

/// In-memory metrics collector.
#[derive(Default)]
pub struct InMemoryMetricsCollector {
    counters: RwLock<HashMap<String, u64>>,
    histograms: RwLock<HashMap<String, Vec<f64>>>,
    gauges: RwLock<HashMap<String, f64>>,
}

impl InMemoryMetricsCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, 0 if it was never incremented.
    pub fn counter(&self, key: &str) -> u64 {
        self.counters.read().get(key).copied().unwrap_or(0)
    }

    /// All recorded observations for a histogram.
    pub fn histogram(&self, key: &str) -> Vec<f64> {
        self.histograms.read().get(key).cloned().unwrap_or_default()
    }

    /// Current value of a gauge, if it was ever set.
    pub fn gauge(&self, key: &str) -> Option<f64> {
        self.gauges.read().get(key).copied()
    }

    /// Takes a serializable snapshot of every metric.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let histograms = self
            .histograms
            .read()
            .iter()
            .map(|(key, values)| {
                let summary = HistogramSummary {
                    count: values.len(),
                    sum: values.iter().sum(),
                    min: values.iter().copied().fold(f64::INFINITY, f64::min),
                    max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                };
                (key.clone(), summary)
            })
            .collect();
        MetricsSnapshot {
            generated_at: Utc::now(),
            counters: self.counters.read().clone(),
            gauges: self.gauges.read().clone(),
            histograms,
        }
    }

    /// Clears all accumulated metrics.
    pub fn reset(&self) {
        self.counters.write().clear();
        self.histograms.write().clear();
        self.gauges.write().clear();
    }

    fn keyed(name: &str, labels: &[(&str, &str)]) -> String {
        if labels.is_empty() {
            return name.to_string();
        }
        let rendered: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        format!("{}:{}", name, rendered.join(","))
    }
}

impl MetricsCollector for InMemoryMetricsCollector {
    fn increment_counter(&self, name: &str, value: u64, labels: &[(&str, &str)]) {
        let key = Self::keyed(name, labels);
        *self.counters.write().entry(key).or_insert(0) += value;
    }

    fn record_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let key = Self::keyed(name, labels);
        self.histograms.write().entry(key).or_default().push(value);
    }

    fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let key = Self::keyed(name, labels);
        self.gauges.write().insert(key, value);
    }
}

/// Collector that discards everything.
pub struct NoopMetricsCollector;

impl MetricsCollector for NoopMetricsCollector {
    fn increment_counter(&self, _name: &str, _value: u64, _labels: &[(&str, &str)]) {}
    fn record_histogram(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
    fn set_gauge(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
}

/// Standardized metric names reported by the gateway core.
pub mod metric_names {
    /// Operations submitted through the gateway entry point
    pub const REQUESTS_TOTAL: &str = "gateway.requests.total";
    /// End-to-end operation duration in milliseconds
    pub const REQUEST_DURATION_MS: &str = "gateway.requests.duration_ms";
    /// Operations that surfaced an error to the caller, tagged by kind
    pub const REQUEST_ERRORS: &str = "gateway.requests.errors";
    /// Individual retry attempts, tagged by operation and error kind
    pub const RETRY_ATTEMPTS: &str = "gateway.retry.attempts";
    /// Operations that succeeded after at least one retry
    pub const RETRY_RECOVERIES: &str = "gateway.retry.recoveries";
    /// Operations that exhausted their retry budget
    pub const RETRY_EXHAUSTED: &str = "gateway.retry.exhausted";
    /// Requests rejected by the rate limiter (queue full or cleared)
    pub const RATE_LIMIT_REJECTIONS: &str = "gateway.rate_limit.rejections";
    /// Current depth of the rate limiter's pending queue
    pub const RATE_LIMIT_QUEUE_DEPTH: &str = "gateway.rate_limit.queue_depth";
    /// Cache lookups that returned a stored value
    pub const CACHE_HITS: &str = "gateway.cache.hits";
    /// Cache lookups that missed or hit an expired entry
    pub const CACHE_MISSES: &str = "gateway.cache.misses";
    /// Batch groups dispatched to the processor function
    pub const BATCH_GROUPS: &str = "gateway.batch.groups";
    /// Batch groups whose processor failed after all retries
    pub const BATCH_FAILURES: &str = "gateway.batch.failures";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates() {
        let collector = InMemoryMetricsCollector::new();
        collector.increment_counter("test", 1, &[]);
        collector.increment_counter("test", 5, &[]);
        assert_eq!(collector.counter("test"), 6);
        assert_eq!(collector.counter("absent"), 0);
    }

    #[test]
    fn labels_produce_distinct_series() {
        let collector = InMemoryMetricsCollector::new();
        collector.increment_counter("errors", 1, &[("kind", "timeout")]);
        collector.increment_counter("errors", 2, &[("kind", "network")]);
        assert_eq!(collector.counter("errors:kind=timeout"), 1);
        assert_eq!(collector.counter("errors:kind=network"), 2);
    }

    #[test]
    fn snapshot_summarizes_histograms() {
        let collector = InMemoryMetricsCollector::new();
        collector.record_histogram("latency", 10.0, &[]);
        collector.record_histogram("latency", 30.0, &[]);
        collector.set_gauge("depth", 4.0, &[]);

        let snapshot = collector.snapshot();
        let summary = snapshot.histograms.get("latency").unwrap();
        assert_eq!(summary.count, 2);
        assert_eq!(summary.sum, 40.0);
        assert_eq!(summary.min, 10.0);
        assert_eq!(summary.max, 30.0);
        assert_eq!(snapshot.gauges.get("depth"), Some(&4.0));
    }

    #[test]
    fn snapshot_serializes() {
        let collector = InMemoryMetricsCollector::new();
        collector.increment_counter(metric_names::REQUESTS_TOTAL, 3, &[]);
        let json = serde_json::to_value(collector.snapshot()).unwrap();
        assert_eq!(json["counters"]["gateway.requests.total"], 3);
    }

    #[test]
    fn reset_clears_everything() {
        let collector = InMemoryMetricsCollector::new();
        collector.increment_counter("test", 1, &[]);
        collector.record_histogram("latency", 1.0, &[]);
        collector.set_gauge("depth", 1.0, &[]);
        collector.reset();
        assert_eq!(collector.counter("test"), 0);
        assert!(collector.histogram("latency").is_empty());
        assert_eq!(collector.gauge("depth"), None);
    }

    #[test]
    fn noop_collector_accepts_everything() {
        let collector = NoopMetricsCollector;
        collector.increment_counter("test", 1, &[]);
        collector.record_histogram("test", 1.0, &[]);
        collector.set_gauge("test", 1.0, &[]);
    }
}
