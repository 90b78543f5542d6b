//! Error types for the docflow orchestration core.
//!
//! The taxonomy separates three concerns:
//! - [`StageError`]: a failure raised by an external stage processor, carrying
//!   an error-kind hint the classifier turns into transient/permanent.
//! - [`StoreError`]: the durable store or its lock primitive was unavailable.
//!   Fatal to the current operation, never to the process.
//! - [`DocflowError`]: everything the orchestration API itself can return.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::core::StageStatus;

/// Crate-wide result alias.
pub type Result<T, E = DocflowError> = std::result::Result<T, E>;

/// The main error type for docflow operations.
#[derive(Debug, Error)]
pub enum DocflowError {
    /// The stage is already running; a second start was attempted.
    #[error("Stage '{stage}' of document '{document_id}' is already running")]
    AlreadyRunning {
        /// The document identifier.
        document_id: String,
        /// The stage name.
        stage: String,
    },

    /// A retry for the stage is already in flight under another caller.
    #[error("Retry already in progress for stage '{stage}' of document '{document_id}'")]
    RetryInProgress {
        /// The document identifier.
        document_id: String,
        /// The stage name.
        stage: String,
    },

    /// The requested status transition is not allowed from the current status.
    #[error("Invalid transition for stage '{stage}' of document '{document_id}': {from} -> {to}")]
    InvalidTransition {
        /// The document identifier.
        document_id: String,
        /// The stage name.
        stage: String,
        /// The status the row was in.
        from: StageStatus,
        /// The status that was requested.
        to: StageStatus,
    },

    /// An earlier stage has not completed or been skipped yet.
    #[error("Stage '{stage}' of document '{document_id}' cannot start before '{blocking}'")]
    OutOfOrder {
        /// The document identifier.
        document_id: String,
        /// The stage that was asked to start.
        stage: String,
        /// The first earlier stage that is still open.
        blocking: String,
    },

    /// No document with this identifier has been registered.
    #[error("Unknown document: {0}")]
    UnknownDocument(String),

    /// The stage is not part of the document's required stages.
    #[error("Unknown stage '{stage}' for document '{document_id}'")]
    UnknownStage {
        /// The document identifier.
        document_id: String,
        /// The stage name.
        stage: String,
    },

    /// The operation was cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The durable store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A pipeline definition was invalid.
    #[error(transparent)]
    Validation(#[from] PipelineValidationError),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DocflowError {
    /// Creates an already-running error.
    #[must_use]
    pub fn already_running(document_id: impl Into<String>, stage: impl Into<String>) -> Self {
        Self::AlreadyRunning {
            document_id: document_id.into(),
            stage: stage.into(),
        }
    }

    /// Creates a retry-in-progress error.
    #[must_use]
    pub fn retry_in_progress(document_id: impl Into<String>, stage: impl Into<String>) -> Self {
        Self::RetryInProgress {
            document_id: document_id.into(),
            stage: stage.into(),
        }
    }

    /// Creates an unknown-stage error.
    #[must_use]
    pub fn unknown_stage(document_id: impl Into<String>, stage: impl Into<String>) -> Self {
        Self::UnknownStage {
            document_id: document_id.into(),
            stage: stage.into(),
        }
    }

    /// Returns true for errors that signal a caller bug or duplicate trigger
    /// rather than a real failure.
    #[must_use]
    pub fn is_informational(&self) -> bool {
        matches!(self, Self::AlreadyRunning { .. } | Self::RetryInProgress { .. })
    }

    /// Converts to a dictionary representation for an API layer.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let kind = match self {
            Self::AlreadyRunning { .. } => "AlreadyRunning",
            Self::RetryInProgress { .. } => "RetryInProgress",
            Self::InvalidTransition { .. } => "InvalidTransition",
            Self::OutOfOrder { .. } => "OutOfOrder",
            Self::UnknownDocument(_) => "UnknownDocument",
            Self::UnknownStage { .. } => "UnknownStage",
            Self::Cancelled(_) => "Cancelled",
            Self::Store(_) => "StoreError",
            Self::Validation(_) => "ValidationError",
            Self::Config(_) => "ConfigError",
        };

        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(kind));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map
    }
}

/// Errors raised by a [`DurableStore`](crate::store::DurableStore).
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store could not be reached or the query failed.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A persisted value could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// A row that must exist was missing.
    #[error("Record not found: {0}")]
    NotFound(String),
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            sqlx::Error::ColumnDecode { index, source } => {
                Self::Corrupt(format!("column {index}: {source}"))
            }
            other => Self::Unavailable(other.to_string()),
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for DocflowError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(err.into())
    }
}

/// Error raised when a pipeline definition is invalid.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }
}

/// Error-kind hint attached to a [`StageError`] by the processor that raised it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHint {
    /// The remote end refused the connection.
    ConnectionRefused,
    /// The connection was reset mid-request.
    ConnectionReset,
    /// The request timed out.
    Timeout,
    /// The remote service is rate limiting (HTTP 429).
    RateLimited,
    /// The remote service is temporarily unavailable (HTTP 502/503/504).
    ServiceUnavailable,
    /// The input document is malformed.
    MalformedInput,
    /// Credentials were rejected.
    Unauthorized,
    /// The input failed validation.
    Validation,
    /// The processor did not know; the classifier decides from the status
    /// code and message.
    Unknown,
}

impl ErrorHint {
    /// Returns the label used for metrics and error records.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::ConnectionRefused => "connection_refused",
            Self::ConnectionReset => "connection_reset",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::ServiceUnavailable => "service_unavailable",
            Self::MalformedInput => "malformed_input",
            Self::Unauthorized => "unauthorized",
            Self::Validation => "validation",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A structured failure raised by a stage processor.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{hint}: {message}")]
pub struct StageError {
    /// The processor's hint about what went wrong.
    pub hint: ErrorHint,
    /// HTTP status code of the failing upstream call, if any.
    pub status_code: Option<u16>,
    /// Human-readable message.
    pub message: String,
}

impl StageError {
    /// Creates a new stage error.
    #[must_use]
    pub fn new(hint: ErrorHint, message: impl Into<String>) -> Self {
        Self {
            hint,
            status_code: None,
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorHint::Timeout, message)
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorHint::Validation, message)
    }

    /// Creates an error from an upstream HTTP status.
    #[must_use]
    pub fn http(status_code: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorHint::Unknown, message).with_status_code(status_code)
    }

    /// Sets the HTTP status code.
    #[must_use]
    pub fn with_status_code(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    /// Returns a one-line summary suitable for `last_error_summary`.
    #[must_use]
    pub fn summary(&self) -> String {
        match self.status_code {
            Some(code) => format!("{} (status {code}): {}", self.hint, self.message),
            None => self.to_string(),
        }
    }
}
