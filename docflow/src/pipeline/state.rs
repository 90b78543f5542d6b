//! Durable per-document, per-stage execution state.
//!
//! Every write is a compare-and-set on the row's current status, so a
//! restarted scheduler re-issuing an operation can never clobber a stage
//! another process is already running.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::{
    Document, DocumentStatus, PipelineErrorRecord, StageExecution, StageStatus, CANCELLED_SUMMARY,
};
use crate::errors::{DocflowError, PipelineValidationError, Result};
use crate::store::{DurableStore, LockKey, StageUpdate};

/// Stage state operations over a [`DurableStore`].
#[derive(Debug, Clone)]
pub struct StageStateStore {
    store: Arc<dyn DurableStore>,
}

impl StageStateStore {
    /// Wraps a durable store.
    #[must_use]
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    /// Registers a document and creates one pending row per required stage.
    ///
    /// Re-registering an existing document leaves its rows untouched.
    pub async fn register_document(&self, document: &Document) -> Result<()> {
        if document.stages.is_empty() {
            return Err(PipelineValidationError::new(format!(
                "document '{}' has no required stages",
                document.id
            ))
            .into());
        }
        let mut seen = HashSet::new();
        let duplicates: Vec<String> = document
            .stages
            .iter()
            .filter(|stage| !seen.insert(stage.as_str()))
            .cloned()
            .collect();
        if !duplicates.is_empty() {
            return Err(PipelineValidationError::new(format!(
                "document '{}' lists stages more than once",
                document.id
            ))
            .with_stages(duplicates)
            .into());
        }

        self.store.insert_document(document).await?;
        info!(
            document_id = %document.id,
            stages = document.stages.len(),
            "Document registered"
        );
        Ok(())
    }

    /// Loads a registered document.
    pub async fn document(&self, document_id: &str) -> Result<Document> {
        self.store
            .get_document(document_id)
            .await?
            .ok_or_else(|| DocflowError::UnknownDocument(document_id.to_string()))
    }

    /// Loads one stage row.
    pub async fn stage(&self, document_id: &str, stage_name: &str) -> Result<StageExecution> {
        match self.store.get_stage(document_id, stage_name).await? {
            Some(row) => Ok(row),
            None => {
                // Distinguish an unknown document from an unknown stage.
                self.document(document_id).await?;
                Err(DocflowError::unknown_stage(document_id, stage_name))
            }
        }
    }

    /// Moves a stage from pending to running and counts the attempt.
    ///
    /// Fails with [`DocflowError::OutOfOrder`] while an earlier stage is open,
    /// with [`DocflowError::AlreadyRunning`] if the stage is running and with
    /// [`DocflowError::RetryInProgress`] while a retry of it is scheduled.
    pub async fn start_stage(&self, document_id: &str, stage_name: &str) -> Result<StageExecution> {
        self.begin(document_id, stage_name, &StageUpdate::start(Utc::now()))
            .await
    }

    /// Restarts a retry-scheduled stage on behalf of the holder of its lease.
    ///
    /// Fails with [`DocflowError::RetryInProgress`] if `owner` no longer
    /// holds a live lease on the stage.
    pub async fn resume_stage(
        &self,
        document_id: &str,
        stage_name: &str,
        owner: Uuid,
    ) -> Result<StageExecution> {
        self.begin(document_id, stage_name, &StageUpdate::resume(Utc::now(), owner))
            .await
    }

    async fn begin(
        &self,
        document_id: &str,
        stage_name: &str,
        update: &StageUpdate,
    ) -> Result<StageExecution> {
        let document = self.document(document_id).await?;
        let rows = self.ordered_rows(&document).await?;
        if let Some(blocking) = first_open_before(&document, &rows, stage_name)? {
            return Err(DocflowError::OutOfOrder {
                document_id: document_id.to_string(),
                stage: stage_name.to_string(),
                blocking,
            });
        }

        if self.store.update_stage(document_id, stage_name, update).await? {
            let row = self.stage(document_id, stage_name).await?;
            info!(
                document_id,
                stage = stage_name,
                attempt = row.attempt_count,
                "Stage started"
            );
            return Ok(row);
        }

        let row = self.stage(document_id, stage_name).await?;
        match row.status {
            StageStatus::Running => {
                warn!(document_id, stage = stage_name, "Stage already running");
                Err(DocflowError::already_running(document_id, stage_name))
            }
            StageStatus::Pending => {
                debug!(document_id, stage = stage_name, "Stage lease not available");
                Err(DocflowError::retry_in_progress(document_id, stage_name))
            }
            from => Err(invalid(document_id, stage_name, from, StageStatus::Running)),
        }
    }

    /// Records progress of a running stage. Returns false if it is not running.
    pub async fn update_progress(
        &self,
        document_id: &str,
        stage_name: &str,
        percent: i32,
    ) -> Result<bool> {
        let percent = u8::try_from(percent.clamp(0, 100)).unwrap_or(100);
        let applied = self
            .store
            .update_stage(document_id, stage_name, &StageUpdate::progress(percent))
            .await?;
        if !applied {
            debug!(document_id, stage = stage_name, percent, "Progress ignored");
        }
        Ok(applied)
    }

    /// Moves a running stage to completed.
    ///
    /// Completing an already-completed stage is a no-op.
    pub async fn complete_stage(&self, document_id: &str, stage_name: &str) -> Result<()> {
        if self
            .store
            .update_stage(document_id, stage_name, &StageUpdate::complete(Utc::now()))
            .await?
        {
            info!(document_id, stage = stage_name, "Stage completed");
            return Ok(());
        }

        let row = self.stage(document_id, stage_name).await?;
        match row.status {
            StageStatus::Completed => {
                debug!(document_id, stage = stage_name, "Stage already completed");
                Ok(())
            }
            from => Err(invalid(document_id, stage_name, from, StageStatus::Completed)),
        }
    }

    /// Moves a running stage to terminal failure.
    ///
    /// Failing an already-failed stage is a no-op.
    pub async fn fail_stage(
        &self,
        document_id: &str,
        stage_name: &str,
        error_summary: &str,
    ) -> Result<()> {
        if self.try_fail_stage(document_id, stage_name, error_summary).await? {
            return Ok(());
        }

        let row = self.stage(document_id, stage_name).await?;
        match row.status {
            StageStatus::Failed => Ok(()),
            from => Err(invalid(document_id, stage_name, from, StageStatus::Failed)),
        }
    }

    /// Moves a running stage to terminal failure.
    ///
    /// Returns false, leaving the row untouched, if the stage is not running.
    pub async fn try_fail_stage(
        &self,
        document_id: &str,
        stage_name: &str,
        error_summary: &str,
    ) -> Result<bool> {
        let applied = self
            .store
            .update_stage(document_id, stage_name, &StageUpdate::fail(error_summary))
            .await?;
        if applied {
            warn!(document_id, stage = stage_name, error = error_summary, "Stage failed");
        } else {
            self.stage(document_id, stage_name).await?;
        }
        Ok(applied)
    }

    /// Moves a running stage back to pending while a retry is scheduled.
    ///
    /// Returns false, leaving the row untouched, if the stage is not running.
    pub async fn reschedule_stage(
        &self,
        document_id: &str,
        stage_name: &str,
        error_summary: &str,
    ) -> Result<bool> {
        let applied = self
            .store
            .update_stage(document_id, stage_name, &StageUpdate::reschedule(error_summary))
            .await?;
        if applied {
            debug!(document_id, stage = stage_name, "Stage rescheduled");
        } else {
            self.stage(document_id, stage_name).await?;
        }
        Ok(applied)
    }

    /// Moves a pending stage to skipped.
    pub async fn skip_stage(&self, document_id: &str, stage_name: &str, reason: &str) -> Result<()> {
        if self
            .store
            .update_stage(document_id, stage_name, &StageUpdate::skip(reason))
            .await?
        {
            info!(document_id, stage = stage_name, reason, "Stage skipped");
            return Ok(());
        }

        let row = self.stage(document_id, stage_name).await?;
        match row.status {
            StageStatus::Skipped => Ok(()),
            from => Err(invalid(document_id, stage_name, from, StageStatus::Skipped)),
        }
    }

    /// Cancels a running or retry-scheduled stage and releases its retry lock.
    ///
    /// A pending stage counts as retry-scheduled only while its lease is live.
    /// Returns false if there was nothing to cancel.
    pub async fn cancel_stage(&self, document_id: &str, stage_name: &str) -> Result<bool> {
        let mut applied = self
            .store
            .update_stage(document_id, stage_name, &StageUpdate::cancel(CANCELLED_SUMMARY))
            .await?;
        if !applied {
            applied = self
                .store
                .update_stage(
                    document_id,
                    stage_name,
                    &StageUpdate::cancel_scheduled(CANCELLED_SUMMARY),
                )
                .await?;
        }
        if !applied {
            // Surfaces unknown documents and stages.
            self.stage(document_id, stage_name).await?;
            return Ok(false);
        }

        let released = self
            .store
            .force_release_lock(&LockKey::new(document_id, stage_name))
            .await?;
        info!(document_id, stage = stage_name, lock_released = released, "Stage cancelled");
        Ok(true)
    }

    /// Overall progress: finished stages over required stages, 0 to 100.
    ///
    /// Skipped stages count as finished.
    pub async fn get_progress(&self, document_id: &str) -> Result<u8> {
        let document = self.document(document_id).await?;
        let rows = self.ordered_rows(&document).await?;
        let total = document.stages.len();
        if total == 0 {
            return Ok(100);
        }
        let done = rows
            .iter()
            .filter(|row| row.as_ref().is_some_and(|r| r.status.is_done()))
            .count();
        Ok(u8::try_from(done * 100 / total).unwrap_or(100))
    }

    /// First stage in pipeline order that is neither completed nor skipped.
    pub async fn get_current_stage(&self, document_id: &str) -> Result<Option<String>> {
        let document = self.document(document_id).await?;
        let rows = self.ordered_rows(&document).await?;
        Ok(document
            .stages
            .iter()
            .zip(&rows)
            .find(|(_, row)| !row.as_ref().is_some_and(|r| r.status.is_done()))
            .map(|(name, _)| name.clone()))
    }

    /// True if every stage ordered before `stage_name` is completed or skipped.
    pub async fn can_start_stage(&self, document_id: &str, stage_name: &str) -> Result<bool> {
        let document = self.document(document_id).await?;
        let rows = self.ordered_rows(&document).await?;
        Ok(first_open_before(&document, &rows, stage_name)?.is_none())
    }

    /// Lists stage rows in pipeline order.
    pub async fn list_stages(&self, document_id: &str) -> Result<Vec<StageExecution>> {
        let document = self.document(document_id).await?;
        Ok(self.ordered_rows(&document).await?.into_iter().flatten().collect())
    }

    /// Lists the error trail of a document in insertion order.
    pub async fn list_errors(&self, document_id: &str) -> Result<Vec<PipelineErrorRecord>> {
        Ok(self.store.list_errors(document_id).await?)
    }

    /// Derives the overall document status from its stage rows.
    pub async fn document_status(&self, document_id: &str) -> Result<DocumentStatus> {
        let rows = self.list_stages(document_id).await?;
        Ok(DocumentStatus::derive(rows.iter().map(|row| &row.status)))
    }

    /// Resets running rows older than `stale_after` to pending.
    ///
    /// Rows whose retry lock is still leased are left alone. Returns the rows
    /// that were reclaimed.
    pub async fn reclaim_stale_stages(&self, stale_after: Duration) -> Result<Vec<StageExecution>> {
        let stale_after = chrono::Duration::from_std(stale_after)
            .map_err(|e| DocflowError::Config(format!("stale threshold out of range: {e}")))?;
        let cutoff = Utc::now() - stale_after;

        let mut reclaimed = Vec::new();
        for row in self.store.list_running_before(cutoff).await? {
            if self
                .store
                .update_stage(&row.document_id, &row.stage_name, &StageUpdate::reclaim())
                .await?
            {
                warn!(
                    document_id = %row.document_id,
                    stage = %row.stage_name,
                    attempt = row.attempt_count,
                    "Reclaimed stale stage"
                );
                reclaimed.push(row);
            }
        }
        Ok(reclaimed)
    }

    async fn ordered_rows(&self, document: &Document) -> Result<Vec<Option<StageExecution>>> {
        let mut rows = self.store.list_stages(&document.id).await?;
        Ok(document
            .stages
            .iter()
            .map(|name| {
                rows.iter()
                    .position(|row| &row.stage_name == name)
                    .map(|i| rows.swap_remove(i))
            })
            .collect())
    }
}

fn invalid(document_id: &str, stage_name: &str, from: StageStatus, to: StageStatus) -> DocflowError {
    DocflowError::InvalidTransition {
        document_id: document_id.to_string(),
        stage: stage_name.to_string(),
        from,
        to,
    }
}

fn first_open_before(
    document: &Document,
    rows: &[Option<StageExecution>],
    stage_name: &str,
) -> Result<Option<String>> {
    let index = document
        .stage_index(stage_name)
        .ok_or_else(|| DocflowError::unknown_stage(&document.id, stage_name))?;
    Ok(document.stages[..index]
        .iter()
        .zip(rows)
        .find(|(_, row)| !row.as_ref().is_some_and(|r| r.status.is_done()))
        .map(|(name, _)| name.clone()))
}
