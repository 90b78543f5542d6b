use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::time::Duration;

use super::MetricsConfig;
use crate::core::DocumentTags;

/// Label set of one metric series.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    /// Stage name.
    pub stage: String,
    /// Manufacturer tag.
    pub manufacturer: String,
    /// Document type tag.
    pub document_type: String,
}

impl SeriesKey {
    /// Builds the key for a stage and document tags.
    #[must_use]
    pub fn new(stage: &str, tags: &DocumentTags) -> Self {
        Self {
            stage: stage.to_string(),
            manufacturer: tags.manufacturer_label().to_string(),
            document_type: tags.document_type_label().to_string(),
        }
    }

    fn labels(&self) -> String {
        format!(
            "stage=\"{}\",manufacturer=\"{}\",document_type=\"{}\"",
            escape(&self.stage),
            escape(&self.manufacturer),
            escape(&self.document_type)
        )
    }
}

#[derive(Debug, Clone)]
struct Histogram {
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn new(buckets: usize) -> Self {
        Self {
            counts: vec![0; buckets],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, bounds: &[f64], seconds: f64) {
        for (count, bound) in self.counts.iter_mut().zip(bounds) {
            if seconds <= *bound {
                *count += 1;
            }
        }
        self.sum += seconds;
        self.count += 1;
    }
}

/// Fixed-capacity window of the most recent samples.
#[derive(Debug)]
struct Window {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    fn sorted(&self) -> Vec<f64> {
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        sorted
    }
}

/// Nearest-rank percentile of sorted samples.
fn percentile(sorted: &[f64], quantile: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (quantile.clamp(0.0, 1.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// One counter value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSample {
    /// Series labels.
    #[serde(flatten)]
    pub key: SeriesKey,
    /// Error label, for failure counters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Counter value.
    pub value: u64,
}

/// Latency percentiles over a stage's sample window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    /// Samples in the window.
    pub samples: usize,
    /// Median in milliseconds.
    pub p50_ms: f64,
    /// 95th percentile in milliseconds.
    pub p95_ms: f64,
    /// 99th percentile in milliseconds.
    pub p99_ms: f64,
    /// Largest sample in milliseconds.
    pub max_ms: f64,
}

/// Point-in-time copy of all metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Success counters.
    pub successes: Vec<CounterSample>,
    /// Failure counters by error label.
    pub failures: Vec<CounterSample>,
    /// Per-stage latency.
    pub latency: BTreeMap<String, LatencySummary>,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

impl MetricsSnapshot {
    /// Total successes of a stage across tags.
    #[must_use]
    pub fn success_total(&self, stage: &str) -> u64 {
        self.successes
            .iter()
            .filter(|s| s.key.stage == stage)
            .map(|s| s.value)
            .sum()
    }

    /// Total failures of a stage across tags and labels.
    #[must_use]
    pub fn failure_total(&self, stage: &str) -> u64 {
        self.failures
            .iter()
            .filter(|s| s.key.stage == stage)
            .map(|s| s.value)
            .sum()
    }
}

/// Records stage outcomes and durations.
///
/// Counters and histograms are keyed by (stage, manufacturer, document type).
/// Percentiles are computed per stage from a bounded window of recent samples.
#[derive(Debug)]
pub struct MetricsCollector {
    config: MetricsConfig,
    successes: DashMap<SeriesKey, u64>,
    failures: DashMap<(SeriesKey, String), u64>,
    durations: DashMap<SeriesKey, Histogram>,
    windows: DashMap<String, Mutex<Window>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

impl MetricsCollector {
    /// Creates a collector.
    #[must_use]
    pub fn new(mut config: MetricsConfig) -> Self {
        config.window_capacity = config.window_capacity.max(1);
        config
            .buckets
            .sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Self {
            config,
            successes: DashMap::new(),
            failures: DashMap::new(),
            durations: DashMap::new(),
            windows: DashMap::new(),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Records a successful attempt.
    pub fn record_success(&self, stage: &str, tags: &DocumentTags, duration: Duration) {
        let key = SeriesKey::new(stage, tags);
        *self.successes.entry(key.clone()).or_insert(0) += 1;
        self.observe(key, duration);
    }

    /// Records a failed attempt under an error label.
    pub fn record_failure(&self, stage: &str, tags: &DocumentTags, error: &str, duration: Duration) {
        let key = SeriesKey::new(stage, tags);
        *self
            .failures
            .entry((key.clone(), error.to_string()))
            .or_insert(0) += 1;
        self.observe(key, duration);
    }

    fn observe(&self, key: SeriesKey, duration: Duration) {
        let seconds = duration.as_secs_f64();
        self.windows
            .entry(key.stage.clone())
            .or_insert_with(|| Mutex::new(Window::new(self.config.window_capacity)))
            .lock()
            .push(duration.as_micros() as f64 / 1000.0);
        self.durations
            .entry(key)
            .or_insert_with(|| Histogram::new(self.config.buckets.len()))
            .observe(&self.config.buckets, seconds);
    }

    /// Number of samples currently in a stage's window.
    #[must_use]
    pub fn sample_count(&self, stage: &str) -> usize {
        self.windows
            .get(stage)
            .map_or(0, |window| window.lock().samples.len())
    }

    /// Latency at `quantile` (0.0 to 1.0) over a stage's window.
    #[must_use]
    pub fn percentile(&self, stage: &str, quantile: f64) -> Option<Duration> {
        let sorted = self.windows.get(stage)?.lock().sorted();
        percentile(&sorted, quantile).map(|ms| Duration::from_micros((ms * 1000.0).round() as u64))
    }

    /// 95th percentile latency of a stage.
    #[must_use]
    pub fn p95(&self, stage: &str) -> Option<Duration> {
        self.percentile(stage, 0.95)
    }

    /// 99th percentile latency of a stage.
    #[must_use]
    pub fn p99(&self, stage: &str) -> Option<Duration> {
        self.percentile(stage, 0.99)
    }

    /// Latency summary of a stage.
    #[must_use]
    pub fn latency(&self, stage: &str) -> Option<LatencySummary> {
        let sorted = self.windows.get(stage)?.lock().sorted();
        Some(LatencySummary {
            samples: sorted.len(),
            p50_ms: percentile(&sorted, 0.50)?,
            p95_ms: percentile(&sorted, 0.95)?,
            p99_ms: percentile(&sorted, 0.99)?,
            max_ms: *sorted.last()?,
        })
    }

    /// Takes a snapshot of every counter and stage latency.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut successes: Vec<CounterSample> = self
            .successes
            .iter()
            .map(|entry| CounterSample {
                key: entry.key().clone(),
                error: None,
                value: *entry.value(),
            })
            .collect();
        successes.sort_by(|a, b| a.key.cmp(&b.key));

        let mut failures: Vec<CounterSample> = self
            .failures
            .iter()
            .map(|entry| CounterSample {
                key: entry.key().0.clone(),
                error: Some(entry.key().1.clone()),
                value: *entry.value(),
            })
            .collect();
        failures.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.error.cmp(&b.error)));

        let stages: Vec<String> = self.windows.iter().map(|e| e.key().clone()).collect();
        let latency = stages
            .into_iter()
            .filter_map(|stage| self.latency(&stage).map(|summary| (stage, summary)))
            .collect();

        MetricsSnapshot {
            successes,
            failures,
            latency,
            taken_at: Utc::now(),
        }
    }

    /// Renders all metrics in the Prometheus text exposition format.
    #[must_use]
    pub fn render_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::new();

        out.push_str("# HELP docflow_stage_success_total Successful stage attempts.\n");
        out.push_str("# TYPE docflow_stage_success_total counter\n");
        for sample in &snapshot.successes {
            let _ = writeln!(
                out,
                "docflow_stage_success_total{{{}}} {}",
                sample.key.labels(),
                sample.value
            );
        }

        out.push_str("# HELP docflow_stage_failure_total Failed stage attempts.\n");
        out.push_str("# TYPE docflow_stage_failure_total counter\n");
        for sample in &snapshot.failures {
            let _ = writeln!(
                out,
                "docflow_stage_failure_total{{{},error=\"{}\"}} {}",
                sample.key.labels(),
                escape(sample.error.as_deref().unwrap_or("unknown")),
                sample.value
            );
        }

        out.push_str("# HELP docflow_stage_duration_seconds Stage attempt duration.\n");
        out.push_str("# TYPE docflow_stage_duration_seconds histogram\n");
        let mut histograms: Vec<(SeriesKey, Histogram)> = self
            .durations
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        histograms.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, histogram) in &histograms {
            let labels = key.labels();
            for (bound, count) in self.config.buckets.iter().zip(&histogram.counts) {
                let _ = writeln!(
                    out,
                    "docflow_stage_duration_seconds_bucket{{{labels},le=\"{bound}\"}} {count}"
                );
            }
            let _ = writeln!(
                out,
                "docflow_stage_duration_seconds_bucket{{{labels},le=\"+Inf\"}} {}",
                histogram.count
            );
            let _ = writeln!(
                out,
                "docflow_stage_duration_seconds_sum{{{labels}}} {}",
                histogram.sum
            );
            let _ = writeln!(
                out,
                "docflow_stage_duration_seconds_count{{{labels}}} {}",
                histogram.count
            );
        }

        out.push_str("# HELP docflow_stage_latency_seconds Windowed stage latency.\n");
        out.push_str("# TYPE docflow_stage_latency_seconds gauge\n");
        for (stage, summary) in &snapshot.latency {
            for (quantile, ms) in [
                ("0.5", summary.p50_ms),
                ("0.95", summary.p95_ms),
                ("0.99", summary.p99_ms),
            ] {
                let _ = writeln!(
                    out,
                    "docflow_stage_latency_seconds{{stage=\"{}\",quantile=\"{quantile}\"}} {}",
                    escape(stage),
                    ms / 1000.0
                );
            }
        }

        out
    }
}
