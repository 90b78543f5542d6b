//! Stage execution metrics.
//!
//! [`MetricsCollector`] is constructed explicitly and shared by `Arc`; there
//! are no process-wide counters. [`MetricsPusher`] optionally ships the
//! collector's exposition to an external sink on an interval.

mod collector;
mod push;

pub use collector::{CounterSample, LatencySummary, MetricsCollector, MetricsSnapshot, SeriesKey};
#[cfg(feature = "push-gateway")]
pub use push::HttpMetricsSink;
pub use push::{LoggingMetricsSink, MetricsPusher, MetricsSink, PushError};

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_window_capacity() -> usize {
    1000
}

fn default_push_interval_ms() -> u64 {
    15_000
}

fn default_buckets() -> Vec<f64> {
    vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
}

fn default_job_name() -> String {
    "docflow".to_string()
}

/// Configuration for metrics collection and push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Latency samples kept per stage.
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,
    /// Interval between pushes in milliseconds.
    #[serde(default = "default_push_interval_ms")]
    pub push_interval_ms: u64,
    /// Histogram bucket upper bounds in seconds.
    #[serde(default = "default_buckets")]
    pub buckets: Vec<f64>,
    /// Push gateway URL. Pushing is disabled when unset.
    #[serde(default)]
    pub push_endpoint: Option<String>,
    /// Job name used in the push URL.
    #[serde(default = "default_job_name")]
    pub job_name: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window_capacity: default_window_capacity(),
            push_interval_ms: default_push_interval_ms(),
            buckets: default_buckets(),
            push_endpoint: None,
            job_name: default_job_name(),
        }
    }
}

impl MetricsConfig {
    /// Sets the per-stage sample window.
    #[must_use]
    pub fn with_window_capacity(mut self, capacity: usize) -> Self {
        self.window_capacity = capacity.max(1);
        self
    }

    /// Sets the push endpoint.
    #[must_use]
    pub fn with_push_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.push_endpoint = Some(endpoint.into());
        self
    }

    /// Sets the push interval.
    #[must_use]
    pub fn with_push_interval_ms(mut self, interval: u64) -> Self {
        self.push_interval_ms = interval;
        self
    }

    /// Returns the push interval.
    #[must_use]
    pub fn push_interval(&self) -> Duration {
        Duration::from_millis(self.push_interval_ms.max(1))
    }
}
