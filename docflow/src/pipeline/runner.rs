//! Concurrent document runs with explicit task handles.
//!
//! Each document runs as its own tokio task. Handles are kept so shutdown
//! can either drain in-flight runs (including pending retries) or cancel
//! them through the shared token.

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::scheduler::{PipelineScheduler, RunReport};
use crate::cancellation::CancellationToken;
use crate::core::Document;
use crate::errors::{DocflowError, Result};

/// How [`DocumentRunner::shutdown`] treats in-flight runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Wait for every run to finish on its own.
    Drain,
    /// Cancel every run, then wait for them to stop.
    Cancel,
}

/// Outcome of one spawned run.
pub type RunResult = (String, Result<RunReport>);

/// Spawns and tracks one task per document.
#[derive(Debug)]
pub struct DocumentRunner {
    scheduler: PipelineScheduler,
    cancel: CancellationToken,
    handles: Mutex<Vec<(String, JoinHandle<Result<RunReport>>)>>,
}

impl DocumentRunner {
    /// Creates a runner.
    #[must_use]
    pub fn new(scheduler: PipelineScheduler) -> Self {
        Self {
            scheduler,
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Returns the token shared by every run.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns the scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &PipelineScheduler {
        &self.scheduler
    }

    /// Spawns a run of a registered document.
    pub fn spawn(&self, document_id: impl Into<String>) {
        let document_id = document_id.into();
        let scheduler = self.scheduler.clone();
        let cancel = self.cancel.clone();
        let id = document_id.clone();
        let handle = tokio::spawn(async move { scheduler.run_document(&id, &cancel).await });
        self.handles.lock().push((document_id, handle));
    }

    /// Registers a document and spawns its run.
    pub async fn submit(&self, document: &Document) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(DocflowError::Cancelled("runner is shut down".to_string()));
        }
        self.scheduler.submit(document).await?;
        self.spawn(document.id.clone());
        Ok(())
    }

    /// Number of runs not yet finished.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.handles
            .lock()
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .count()
    }

    /// Waits for every spawned run and returns their results in spawn order.
    pub async fn join_all(&self) -> Vec<RunResult> {
        let (ids, handles): (Vec<String>, Vec<_>) =
            std::mem::take(&mut *self.handles.lock()).into_iter().unzip();

        futures::future::join_all(handles)
            .await
            .into_iter()
            .zip(ids)
            .map(|(joined, document_id)| {
                let result = joined.unwrap_or_else(|join_error| {
                    warn!(document_id = %document_id, error = %join_error, "Document run aborted");
                    Err(DocflowError::Cancelled(format!("run aborted: {join_error}")))
                });
                (document_id, result)
            })
            .collect()
    }

    /// Stops accepting work and waits for in-flight runs.
    pub async fn shutdown(&self, mode: ShutdownMode) -> Vec<RunResult> {
        info!(?mode, in_flight = self.in_flight(), "Shutting down document runner");
        match mode {
            ShutdownMode::Drain => {
                let results = self.join_all().await;
                self.cancel.cancel("shutdown");
                results
            }
            ShutdownMode::Cancel => {
                self.cancel.cancel("shutdown");
                self.join_all().await
            }
        }
    }
}
