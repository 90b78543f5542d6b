//! Drives documents through the stage sequence.

use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

use super::definition::PipelineDefinition;
use super::orchestrator::{Attempt, RetryOrchestrator, RetryOutcome};
use super::state::StageStateStore;
use crate::cancellation::CancellationToken;
use crate::core::{Document, DocumentStatus, StageOutput, StageStatus};
use crate::errors::{DocflowError, Result};
use crate::events::PipelineEvent;
use crate::metrics::MetricsCollector;
use crate::stages::StageInput;
use crate::store::LockKey;

/// Why a run stopped before every stage finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    /// A stage reached terminal failure.
    Failed {
        /// The failed stage.
        stage: String,
    },
    /// Another caller holds the stage's retry lock.
    RetryInProgress {
        /// The stage being retried.
        stage: String,
    },
    /// The stage is running under another caller.
    AlreadyRunning {
        /// The running stage.
        stage: String,
    },
    /// The run was cancelled.
    Cancelled {
        /// The stage that was cancelled, if one was active.
        stage: Option<String>,
    },
}

/// Summary of one scheduler run over a document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    /// Document identifier.
    pub document_id: String,
    /// Overall status after the run.
    pub status: DocumentStatus,
    /// Overall progress after the run.
    pub progress: u8,
    /// Stages that completed during this run.
    pub completed: Vec<String>,
    /// Why the run stopped early, if it did.
    pub stopped: Option<StopReason>,
}

impl RunReport {
    /// True if every required stage is completed or skipped.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status == DocumentStatus::Completed
    }
}

/// Runs documents through a [`PipelineDefinition`], one stage at a time.
#[derive(Debug, Clone)]
pub struct PipelineScheduler {
    pipeline: Arc<PipelineDefinition>,
    orchestrator: RetryOrchestrator,
}

impl PipelineScheduler {
    /// Creates a scheduler.
    #[must_use]
    pub fn new(pipeline: Arc<PipelineDefinition>, orchestrator: RetryOrchestrator) -> Self {
        Self {
            pipeline,
            orchestrator,
        }
    }

    /// Returns the pipeline definition.
    #[must_use]
    pub fn pipeline(&self) -> &Arc<PipelineDefinition> {
        &self.pipeline
    }

    /// Returns the retry orchestrator.
    #[must_use]
    pub fn orchestrator(&self) -> &RetryOrchestrator {
        &self.orchestrator
    }

    /// Returns the stage state store.
    #[must_use]
    pub fn state(&self) -> &StageStateStore {
        self.orchestrator.state()
    }

    /// Returns the metrics collector.
    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        self.orchestrator.metrics()
    }

    /// Registers a document for processing.
    pub async fn submit(&self, document: &Document) -> Result<()> {
        self.state().register_document(document).await
    }

    /// Runs a registered document from its current stage.
    ///
    /// Stops at the first stage that cannot proceed. Calling again resumes
    /// from wherever the document stands.
    pub async fn run_document(
        &self,
        document_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let span = tracing::info_span!("document_run", document_id);
        self.run_inner(document_id, cancel).instrument(span).await
    }

    async fn run_inner(&self, document_id: &str, cancel: &CancellationToken) -> Result<RunReport> {
        let state = self.state();
        let document = state.document(document_id).await?;
        let mut upstream: HashMap<String, StageOutput> = HashMap::new();
        let mut completed = Vec::new();
        let mut stopped = None;
        let mut failed_here = false;

        for stage in &document.stages {
            if cancel.is_cancelled() {
                stopped = Some(StopReason::Cancelled { stage: None });
                break;
            }

            let row = state.stage(document_id, stage).await?;
            match row.status {
                StageStatus::Completed | StageStatus::Skipped => continue,
                StageStatus::Failed => {
                    stopped = Some(StopReason::Failed {
                        stage: stage.clone(),
                    });
                    break;
                }
                StageStatus::Running => {
                    debug!(stage = %stage, "Stage running elsewhere");
                    stopped = Some(StopReason::AlreadyRunning {
                        stage: stage.clone(),
                    });
                    break;
                }
                StageStatus::Pending => {}
            }

            if !state.can_start_stage(document_id, stage).await? {
                break;
            }
            if state
                .store()
                .is_locked(&LockKey::new(document_id, stage))
                .await?
            {
                // A retry is scheduled under another caller.
                stopped = Some(StopReason::RetryInProgress {
                    stage: stage.clone(),
                });
                break;
            }

            let processor = self
                .pipeline
                .processor(stage)
                .ok_or_else(|| DocflowError::unknown_stage(document_id, stage))?;

            let row = match state.start_stage(document_id, stage).await {
                Ok(row) => row,
                Err(e) if e.is_informational() => {
                    info!(stage = %stage, error = %e, "Stage not started");
                    stopped = Some(match e {
                        DocflowError::RetryInProgress { .. } => StopReason::RetryInProgress {
                            stage: stage.clone(),
                        },
                        _ => StopReason::AlreadyRunning {
                            stage: stage.clone(),
                        },
                    });
                    break;
                }
                Err(e) => return Err(e),
            };
            self.orchestrator
                .emit(
                    PipelineEvent::StageStarted,
                    json!({
                        "document_id": document_id,
                        "stage": stage,
                        "attempt": row.attempt_count,
                    }),
                )
                .await;

            let input = StageInput::new(document.clone(), stage.clone())
                .for_attempt(row.attempt_count)
                .with_upstream(Arc::new(upstream.clone()));

            let output = match self
                .orchestrator
                .run_attempt(processor.as_ref(), &input, cancel)
                .await
            {
                Attempt::Succeeded(output) => {
                    state.complete_stage(document_id, stage).await?;
                    self.orchestrator
                        .emit(
                            PipelineEvent::StageCompleted,
                            json!({
                                "document_id": document_id,
                                "stage": stage,
                                "attempt": row.attempt_count,
                            }),
                        )
                        .await;
                    output
                }
                Attempt::Failed(error) => {
                    warn!(stage = %stage, attempt = row.attempt_count, error = %error, "Stage attempt failed");
                    match self
                        .orchestrator
                        .handle_failure(processor.as_ref(), &input, error, cancel)
                        .await?
                    {
                        RetryOutcome::Recovered { output, .. } => output,
                        RetryOutcome::RetryInProgress => {
                            stopped = Some(StopReason::RetryInProgress {
                                stage: stage.clone(),
                            });
                            break;
                        }
                        RetryOutcome::Cancelled => {
                            stopped = Some(StopReason::Cancelled {
                                stage: Some(stage.clone()),
                            });
                            break;
                        }
                        RetryOutcome::PermanentFailure { .. }
                        | RetryOutcome::RetriesExhausted { .. } => {
                            failed_here = true;
                            stopped = Some(StopReason::Failed {
                                stage: stage.clone(),
                            });
                            break;
                        }
                    }
                }
                Attempt::Cancelled => {
                    state.cancel_stage(document_id, stage).await?;
                    self.orchestrator
                        .emit(
                            PipelineEvent::StageCancelled,
                            json!({ "document_id": document_id, "stage": stage }),
                        )
                        .await;
                    stopped = Some(StopReason::Cancelled {
                        stage: Some(stage.clone()),
                    });
                    break;
                }
            };

            completed.push(stage.clone());
            upstream.insert(stage.clone(), output);
        }

        let status = state.document_status(document_id).await?;
        let progress = state.get_progress(document_id).await?;
        match status {
            DocumentStatus::Completed if !completed.is_empty() => {
                info!(progress, "Document completed");
                self.orchestrator
                    .emit(
                        PipelineEvent::DocumentCompleted,
                        json!({ "document_id": document_id }),
                    )
                    .await;
            }
            DocumentStatus::Failed if failed_here => {
                warn!(progress, "Document failed");
                self.orchestrator
                    .emit(
                        PipelineEvent::DocumentFailed,
                        json!({ "document_id": document_id, "stopped": stopped }),
                    )
                    .await;
            }
            _ => {}
        }

        Ok(RunReport {
            document_id: document_id.to_string(),
            status,
            progress,
            completed,
            stopped,
        })
    }
}
