//! Observability for the gateway core.
//!
//! - **Metrics**: kind- and operation-tagged counters, histograms and gauges
//!   behind the [`MetricsCollector`] trait; the external exporter consumes
//!   [`MetricsSnapshot`] values.
//! - **Logging**: structured logging via `tracing`, initialized through
//!   [`LoggingConfig`].

mod logging;
mod metrics;

pub use logging::{LogFormat, LogLevel, LoggingConfig};
pub use metrics::{
    metric_names, HistogramSummary, InMemoryMetricsCollector, MetricsCollector, MetricsSnapshot,
    NoopMetricsCollector,
};
