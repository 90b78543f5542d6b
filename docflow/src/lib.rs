//! # Docflow
//!
//! Orchestration core for document-ingestion pipelines.
//!
//! Documents move through a fixed, ordered sequence of stages (upload, text
//! extraction, classification, embedding, ...). Docflow provides:
//!
//! - **Durable stage state**: one execution row per (document, stage) with
//!   compare-and-set transitions, backed by memory or SQLite
//! - **Failure classification**: transient vs. permanent, from error hints,
//!   HTTP status codes and message patterns
//! - **Retry orchestration**: exponential backoff with jitter, one retry at a
//!   time per stage through a leased advisory lock, an error record per
//!   failed attempt
//! - **Scheduling**: in-order stage execution per document, many documents
//!   concurrently, cancellable through a shared token
//! - **Metrics**: success/failure counters and rolling latency percentiles
//!   per stage, rendered as Prometheus text
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use docflow::prelude::*;
//!
//! let pipeline = PipelineDefinition::builder("ingest")
//!     .stage(Arc::new(UploadProcessor::new()))?
//!     .stage(Arc::new(OcrProcessor::new(client)))?
//!     .build()?;
//!
//! let state = StageStateStore::new(Arc::new(SqliteStore::connect("sqlite://docflow.db").await?));
//! let orchestrator = RetryOrchestrator::new(state, RetryPolicy::default());
//! let scheduler = PipelineScheduler::new(Arc::new(pipeline), orchestrator);
//!
//! scheduler.submit(&scheduler.pipeline().document("doc-1")).await?;
//! let report = scheduler.run_document("doc-1", &CancellationToken::new()).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod observability;
pub mod pipeline;
pub mod stages;
pub mod store;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{DocflowConfig, StoreConfig};
    pub use crate::core::{
        Document, DocumentStatus, DocumentTags, ErrorKind, PipelineErrorRecord,
        StageExecution, StageOutput, StageStatus, StandardStage,
    };
    pub use crate::errors::{DocflowError, ErrorHint, Result, StageError, StoreError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink, PipelineEvent};
    pub use crate::metrics::{MetricsCollector, MetricsConfig};
    pub use crate::observability::{init_tracing, LogFormat, LoggingConfig};
    pub use crate::pipeline::{
        DocumentRunner, ErrorClassifier, PipelineDefinition, PipelineScheduler,
        RetryOrchestrator, RetryOutcome, RetryPolicy, RunReport, ShutdownMode,
        StageStateStore, StopReason,
    };
    pub use crate::stages::{ProgressReporter, StageInput, StageProcessor};
    #[cfg(feature = "sqlite")]
    pub use crate::store::SqliteStore;
    pub use crate::store::{DurableStore, InMemoryStore};
    pub use std::sync::Arc;
}
