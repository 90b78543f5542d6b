//! Periodic push of collected metrics to an external sink.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::MetricsCollector;
use crate::cancellation::CancellationToken;

/// Error returned by a [`MetricsSink`]. Never reaches pipeline execution.
#[derive(Debug, Clone, Error)]
pub enum PushError {
    /// The request could not be sent.
    #[error("Metrics push failed: {0}")]
    Transport(String),

    /// The sink answered with a non-success status.
    #[error("Metrics sink rejected push with status {0}")]
    Rejected(u16),
}

/// Accepts a batch of metrics in the Prometheus text format.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Pushes one exposition body.
    async fn push(&self, body: &str) -> Result<(), PushError>;
}

/// Writes pushes to the log instead of the network.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMetricsSink;

#[async_trait]
impl MetricsSink for LoggingMetricsSink {
    async fn push(&self, body: &str) -> Result<(), PushError> {
        debug!(bytes = body.len(), lines = body.lines().count(), "Metrics push");
        Ok(())
    }
}

/// Pushes to a Prometheus push gateway over HTTP.
#[cfg(feature = "push-gateway")]
#[derive(Debug, Clone)]
pub struct HttpMetricsSink {
    url: String,
    client: reqwest::Client,
}

#[cfg(feature = "push-gateway")]
impl HttpMetricsSink {
    /// Creates a sink pushing to `<endpoint>/metrics/job/<job>`.
    pub fn new(endpoint: &str, job: &str) -> Result<Self, PushError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PushError::Transport(e.to_string()))?;
        Ok(Self {
            url: format!("{}/metrics/job/{job}", endpoint.trim_end_matches('/')),
            client,
        })
    }

    /// Returns the push URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[cfg(feature = "push-gateway")]
#[async_trait]
impl MetricsSink for HttpMetricsSink {
    async fn push(&self, body: &str) -> Result<(), PushError> {
        let response = self
            .client
            .put(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| PushError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PushError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}

/// Ships the collector's exposition to a sink on an interval.
pub struct MetricsPusher {
    collector: Arc<MetricsCollector>,
    sink: Arc<dyn MetricsSink>,
    interval: Duration,
}

impl fmt::Debug for MetricsPusher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsPusher")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl MetricsPusher {
    /// Creates a pusher using the collector's configured interval.
    #[must_use]
    pub fn new(collector: Arc<MetricsCollector>, sink: Arc<dyn MetricsSink>) -> Self {
        let interval = collector.config().push_interval();
        Self {
            collector,
            sink,
            interval,
        }
    }

    /// Overrides the push interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Pushes once. Failures are logged and reported as false.
    pub async fn push_once(&self) -> bool {
        let body = self.collector.render_prometheus();
        match self.sink.push(&body).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Metrics push failed");
                false
            }
        }
    }

    /// Runs the push loop until `cancel` fires, then pushes a final batch.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.push_once().await;
                    }
                }
            }

            self.push_once().await;
            info!("Metrics pusher stopped");
        })
    }
}
