//! Pipeline orchestration.
//!
//! Leaf-first:
//! - [`StageStateStore`]: durable per-stage status, the single source of truth
//! - [`ErrorClassifier`]: transient or permanent
//! - [`RetryOrchestrator`]: backoff, advisory locking and the error trail
//! - [`PipelineScheduler`]: drives one document through its stages
//! - [`DocumentRunner`]: one task per document with drain/cancel shutdown

mod classifier;
mod definition;
#[cfg(test)]
mod integration_tests;
mod orchestrator;
pub mod retry;
mod runner;
mod scheduler;
mod state;

pub use classifier::{Classification, ClassifierConfig, ErrorClassifier};
pub use definition::{PipelineBuilder, PipelineDefinition};
pub use orchestrator::{RetryOrchestrator, RetryOutcome};
pub use retry::{BackoffStrategy, JitterStrategy, RetryPolicy};
pub use runner::{DocumentRunner, RunResult, ShutdownMode};
pub use scheduler::{PipelineScheduler, RunReport, StopReason};
pub use state::StageStateStore;
