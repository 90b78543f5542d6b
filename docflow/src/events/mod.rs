//! Pipeline events.
//!
//! Sinks are injected into the scheduler and orchestrator; there is no
//! process-wide sink.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Events emitted while driving documents through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineEvent {
    /// A stage attempt started.
    #[serde(rename = "stage.started")]
    StageStarted,
    /// A stage attempt completed.
    #[serde(rename = "stage.completed")]
    StageCompleted,
    /// A stage reached terminal failure.
    #[serde(rename = "stage.failed")]
    StageFailed,
    /// A transient failure was scheduled for retry.
    #[serde(rename = "stage.retry_scheduled")]
    RetryScheduled,
    /// Another caller already holds the retry lock.
    #[serde(rename = "stage.retry_in_progress")]
    RetryInProgress,
    /// The retry budget is spent.
    #[serde(rename = "stage.retries_exhausted")]
    RetriesExhausted,
    /// A stage was cancelled.
    #[serde(rename = "stage.cancelled")]
    StageCancelled,
    /// Every required stage is completed or skipped.
    #[serde(rename = "document.completed")]
    DocumentCompleted,
    /// A stage of the document failed terminally.
    #[serde(rename = "document.failed")]
    DocumentFailed,
}

impl PipelineEvent {
    /// Returns the dotted event type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StageStarted => "stage.started",
            Self::StageCompleted => "stage.completed",
            Self::StageFailed => "stage.failed",
            Self::RetryScheduled => "stage.retry_scheduled",
            Self::RetryInProgress => "stage.retry_in_progress",
            Self::RetriesExhausted => "stage.retries_exhausted",
            Self::StageCancelled => "stage.cancelled",
            Self::DocumentCompleted => "document.completed",
            Self::DocumentFailed => "document.failed",
        }
    }
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
