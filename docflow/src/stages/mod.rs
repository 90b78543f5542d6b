//! Stage processor interface.
//!
//! Processors are the external collaborators that do the actual work of a
//! stage (text extraction, embedding, ...). They must be safe to invoke more
//! than once for the same document and attempt.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::warn;

use crate::core::{correlation_id, Document, StageOutput};
use crate::errors::StageError;
use crate::pipeline::StageStateStore;

/// Everything a processor gets for one attempt.
#[derive(Debug, Clone)]
pub struct StageInput {
    /// The document being processed.
    pub document: Document,
    /// The stage being run.
    pub stage_name: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Outputs of stages completed earlier in the same run.
    pub upstream: Arc<HashMap<String, StageOutput>>,
}

impl StageInput {
    /// Creates the input for the first attempt with no upstream outputs.
    #[must_use]
    pub fn new(document: Document, stage_name: impl Into<String>) -> Self {
        Self {
            document,
            stage_name: stage_name.into(),
            attempt: 1,
            upstream: Arc::new(HashMap::new()),
        }
    }

    /// Sets the upstream outputs.
    #[must_use]
    pub fn with_upstream(mut self, upstream: Arc<HashMap<String, StageOutput>>) -> Self {
        self.upstream = upstream;
        self
    }

    /// Returns a copy for another attempt.
    #[must_use]
    pub fn for_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }

    /// Returns the document identifier.
    #[must_use]
    pub fn document_id(&self) -> &str {
        &self.document.id
    }

    /// Correlation id of this attempt.
    #[must_use]
    pub fn correlation_id(&self) -> String {
        correlation_id(
            &self.document.id,
            &self.stage_name,
            self.attempt.saturating_sub(1),
        )
    }

    /// Gets the output of an earlier stage.
    #[must_use]
    pub fn upstream_output(&self, stage: &str) -> Option<&StageOutput> {
        self.upstream.get(stage)
    }
}

/// Progress callback handed to processors.
///
/// Reports are written to the stage row only while the stage is running.
/// Store failures are logged and dropped.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    target: Option<(StageStateStore, String, String)>,
}

impl ProgressReporter {
    /// Creates a reporter wired to a stage row.
    #[must_use]
    pub fn new(
        state: StageStateStore,
        document_id: impl Into<String>,
        stage_name: impl Into<String>,
    ) -> Self {
        Self {
            target: Some((state, document_id.into(), stage_name.into())),
        }
    }

    /// Creates a reporter that discards progress.
    #[must_use]
    pub fn detached() -> Self {
        Self { target: None }
    }

    /// Reports progress of the current attempt, 0 to 100.
    pub async fn report(&self, percent: i32) {
        let Some((state, document_id, stage_name)) = &self.target else {
            return;
        };
        if let Err(e) = state.update_progress(document_id, stage_name, percent).await {
            warn!(
                document_id = %document_id,
                stage = %stage_name,
                error = %e,
                "Failed to record progress"
            );
        }
    }
}

/// The single interface every stage implementation provides.
#[async_trait]
pub trait StageProcessor: Send + Sync + Debug {
    /// Returns the stage name this processor runs.
    fn name(&self) -> &str;

    /// Runs one attempt of the stage.
    async fn run(
        &self,
        input: &StageInput,
        progress: &ProgressReporter,
    ) -> Result<StageOutput, StageError>;
}

/// A processor backed by a synchronous function.
pub struct FnProcessor<F>
where
    F: Fn(&StageInput) -> Result<StageOutput, StageError> + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnProcessor<F>
where
    F: Fn(&StageInput) -> Result<StageOutput, StageError> + Send + Sync,
{
    /// Creates a new function-based processor.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnProcessor<F>
where
    F: Fn(&StageInput) -> Result<StageOutput, StageError> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnProcessor").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> StageProcessor for FnProcessor<F>
where
    F: Fn(&StageInput) -> Result<StageOutput, StageError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        input: &StageInput,
        _progress: &ProgressReporter,
    ) -> Result<StageOutput, StageError> {
        (self.func)(input)
    }
}

/// A processor that succeeds immediately with an empty output.
#[derive(Debug, Clone)]
pub struct NoOpProcessor {
    name: String,
}

impl NoOpProcessor {
    /// Creates a new no-op processor.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl StageProcessor for NoOpProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        _input: &StageInput,
        progress: &ProgressReporter,
    ) -> Result<StageOutput, StageError> {
        progress.report(100).await;
        Ok(StageOutput::empty())
    }
}
