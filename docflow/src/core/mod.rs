//! Core domain model types for docflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Stage, document and error-kind status enums
//! - Documents and the standard stage catalogue
//! - Persisted stage executions and error records
//! - Stage processor output

mod document;
mod execution;
mod output;
mod status;

pub use document::{Document, DocumentTags, StandardStage};
pub use execution::{
    correlation_id, PipelineErrorRecord, StageExecution, CANCELLED_SUMMARY,
    RESOLUTION_PERMANENT, RESOLUTION_RETRIES_EXHAUSTED, RESOLUTION_RETRY_SCHEDULED,
};
pub use output::StageOutput;
pub use status::{DocumentStatus, ErrorKind, StageStatus};
