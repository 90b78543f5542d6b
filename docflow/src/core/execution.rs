//! Persisted stage execution rows and the append-only error trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ErrorKind, StageStatus};

/// `resolution_notes` value for a transient failure that will be retried.
pub const RESOLUTION_RETRY_SCHEDULED: &str = "retry_scheduled";
/// `resolution_notes` value once the retry budget is spent.
pub const RESOLUTION_RETRIES_EXHAUSTED: &str = "retries_exhausted";
/// `resolution_notes` value for a failure that is never retried.
pub const RESOLUTION_PERMANENT: &str = "permanent_failure";
/// `last_error_summary` value written by cancellation.
pub const CANCELLED_SUMMARY: &str = "cancelled";

/// Durable status of one (document, stage) pair.
///
/// Exactly one row exists per pair; `attempt_count` never decreases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageExecution {
    /// Document identifier.
    pub document_id: String,
    /// Stage name.
    pub stage_name: String,
    /// Current status.
    pub status: StageStatus,
    /// Number of times the stage has been started.
    pub attempt_count: u32,
    /// When the latest attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the stage completed.
    pub completed_at: Option<DateTime<Utc>>,
    /// Progress of the running attempt, 0 to 100.
    pub progress_percent: Option<u8>,
    /// Summary of the latest failure.
    pub last_error_summary: Option<String>,
}

impl StageExecution {
    /// Creates a fresh pending row.
    #[must_use]
    pub fn pending(document_id: impl Into<String>, stage_name: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            stage_name: stage_name.into(),
            status: StageStatus::Pending,
            attempt_count: 0,
            started_at: None,
            completed_at: None,
            progress_percent: None,
            last_error_summary: None,
        }
    }

    /// Number of retries already performed for this stage.
    #[must_use]
    pub fn retries_performed(&self) -> u32 {
        self.attempt_count.saturating_sub(1)
    }
}

/// Builds the correlation id linking retry attempts of one stage execution.
#[must_use]
pub fn correlation_id(document_id: &str, stage_name: &str, retry: u32) -> String {
    format!("req_{document_id}.stage_{stage_name}.retry_{retry}")
}

/// Append-only audit record of a stage failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineErrorRecord {
    /// `req_<document>.stage_<stage>.retry_<n>`.
    pub correlation_id: String,
    /// Document identifier.
    pub document_id: String,
    /// Stage name.
    pub stage_name: String,
    /// Retries performed before this failure.
    pub retry_count: u32,
    /// Classification of the failure.
    pub error_kind: ErrorKind,
    /// What the orchestrator decided.
    pub resolution_notes: String,
    /// When the record was appended.
    pub created_at: DateTime<Utc>,
}

impl PipelineErrorRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(
        document_id: impl Into<String>,
        stage_name: impl Into<String>,
        retry_count: u32,
        error_kind: ErrorKind,
        resolution_notes: impl Into<String>,
    ) -> Self {
        let document_id = document_id.into();
        let stage_name = stage_name.into();
        Self {
            correlation_id: correlation_id(&document_id, &stage_name, retry_count),
            document_id,
            stage_name,
            retry_count,
            error_kind,
            resolution_notes: resolution_notes.into(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_id_format() {
        assert_eq!(
            correlation_id("doc-9", "embedding", 2),
            "req_doc-9.stage_embedding.retry_2"
        );
    }

    #[test]
    fn test_pending_row() {
        let row = StageExecution::pending("doc-1", "upload");
        assert_eq!(row.status, StageStatus::Pending);
        assert_eq!(row.attempt_count, 0);
        assert_eq!(row.retries_performed(), 0);
        assert!(row.started_at.is_none());
    }

    #[test]
    fn test_error_record_uses_retry_count_in_correlation_id() {
        let record = PipelineErrorRecord::new(
            "doc-1",
            "classification",
            1,
            ErrorKind::Transient,
            RESOLUTION_RETRY_SCHEDULED,
        );
        assert_eq!(record.correlation_id, "req_doc-1.stage_classification.retry_1");
        assert_eq!(record.resolution_notes, "retry_scheduled");
    }
}
