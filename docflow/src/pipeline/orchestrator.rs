//! Retry orchestration for failed stages.
//!
//! On a failure the orchestrator classifies the error and either fails the
//! stage terminally or takes the stage's advisory lock and drives the retry
//! chain itself: backoff, re-invoke, repeat until the stage recovers or the
//! budget is spent. The lock is held for the whole chain and released on
//! every exit path; its lease covers a crashed holder.

use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use super::classifier::{Classification, ErrorClassifier};
use super::retry::RetryPolicy;
use super::state::StageStateStore;
use crate::cancellation::CancellationToken;
use crate::core::{
    ErrorKind, PipelineErrorRecord, StageOutput, StageStatus, CANCELLED_SUMMARY,
    RESOLUTION_PERMANENT, RESOLUTION_RETRIES_EXHAUSTED, RESOLUTION_RETRY_SCHEDULED,
};
use crate::errors::{DocflowError, Result, StageError};
use crate::events::{EventSink, NoOpEventSink, PipelineEvent};
use crate::metrics::MetricsCollector;
use crate::stages::{ProgressReporter, StageInput, StageProcessor};
use crate::store::LockKey;

/// How a failure was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    /// A retry succeeded and the stage is completed.
    Recovered {
        /// Output of the successful attempt.
        output: StageOutput,
        /// Attempts made in total.
        attempts: u32,
    },
    /// The failure is permanent; the stage failed after this attempt.
    PermanentFailure {
        /// Summary of the failure.
        summary: String,
    },
    /// The retry budget is spent; the stage failed.
    RetriesExhausted {
        /// Attempts made in total.
        attempts: u32,
        /// Summary of the last failure.
        summary: String,
    },
    /// Another caller is already retrying this stage.
    RetryInProgress,
    /// The stage was cancelled while retrying.
    Cancelled,
}

impl RetryOutcome {
    /// Returns a short name for logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recovered { .. } => "recovered",
            Self::PermanentFailure { .. } => "permanent_failure",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::RetryInProgress => "retry_in_progress",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns true if the stage ended in terminal failure.
    #[must_use]
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            Self::PermanentFailure { .. } | Self::RetriesExhausted { .. } | Self::Cancelled
        )
    }
}

/// Result of one processor invocation.
#[derive(Debug)]
pub(crate) enum Attempt {
    Succeeded(StageOutput),
    Failed(StageError),
    Cancelled,
}

/// Lock ownership for one retry chain.
struct LockGuard {
    key: LockKey,
    owner: Uuid,
    held: bool,
}

/// Decides whether and when failed stages are retried.
#[derive(Debug, Clone)]
pub struct RetryOrchestrator {
    state: StageStateStore,
    policy: RetryPolicy,
    classifier: Arc<ErrorClassifier>,
    metrics: Arc<MetricsCollector>,
    events: Arc<dyn EventSink>,
}

impl RetryOrchestrator {
    /// Creates an orchestrator with the default classifier and no event sink.
    #[must_use]
    pub fn new(state: StageStateStore, policy: RetryPolicy) -> Self {
        Self {
            state,
            policy,
            classifier: Arc::new(ErrorClassifier::default()),
            metrics: Arc::new(MetricsCollector::default()),
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the error classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Sets the metrics collector.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the retry policy.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Returns the stage state store.
    #[must_use]
    pub fn state(&self) -> &StageStateStore {
        &self.state
    }

    /// Classifies a failure.
    #[must_use]
    pub fn classify(&self, error: &StageError) -> Classification {
        self.classifier.classify(error)
    }

    /// Invokes a processor once, recording duration and outcome.
    ///
    /// The stage must already be running.
    pub(crate) async fn run_attempt(
        &self,
        processor: &dyn StageProcessor,
        input: &StageInput,
        cancel: &CancellationToken,
    ) -> Attempt {
        let reporter =
            ProgressReporter::new(self.state.clone(), input.document_id(), &input.stage_name);
        let tags = &input.document.tags;
        let started = Instant::now();

        let result = tokio::select! {
            () = cancel.cancelled() => return Attempt::Cancelled,
            result = processor.run(input, &reporter) => result,
        };

        let elapsed = started.elapsed();
        match result {
            Ok(output) => {
                self.metrics.record_success(&input.stage_name, tags, elapsed);
                Attempt::Succeeded(output)
            }
            Err(error) => {
                let label = self.classifier.classify(&error).label;
                self.metrics
                    .record_failure(&input.stage_name, tags, &label, elapsed);
                Attempt::Failed(error)
            }
        }
    }

    /// Handles a failed attempt of a running stage.
    ///
    /// Returns once the failure is resolved: the stage recovered, failed
    /// terminally, was cancelled, or is already being retried elsewhere.
    pub async fn handle_failure(
        &self,
        processor: &dyn StageProcessor,
        input: &StageInput,
        error: StageError,
        cancel: &CancellationToken,
    ) -> Result<RetryOutcome> {
        let document_id = input.document_id();
        let stage = input.stage_name.as_str();
        let span = tracing::info_span!("retry_chain", document_id, stage);

        let mut guard = LockGuard {
            key: LockKey::new(document_id, stage),
            owner: Uuid::new_v4(),
            held: false,
        };

        let result = self
            .retry_chain(processor, input, error, cancel, &mut guard)
            .instrument(span)
            .await;

        if guard.held {
            match self
                .state
                .store()
                .release_lock(&guard.key, guard.owner)
                .await
            {
                Ok(released) => debug!(lock = %guard.key, released, "Retry lock released"),
                Err(e) => warn!(lock = %guard.key, error = %e, "Failed to release retry lock"),
            }
        }

        result
    }

    async fn retry_chain(
        &self,
        processor: &dyn StageProcessor,
        input: &StageInput,
        mut error: StageError,
        cancel: &CancellationToken,
        guard: &mut LockGuard,
    ) -> Result<RetryOutcome> {
        let document_id = input.document_id();
        let stage = input.stage_name.as_str();

        loop {
            let row = self.state.stage(document_id, stage).await?;
            let retry = row.retries_performed();
            let verdict = self.classifier.classify(&error);
            let summary = error.summary();

            if verdict.kind == ErrorKind::Permanent {
                if !self.state.try_fail_stage(document_id, stage, &summary).await? {
                    return self.superseded(document_id, stage).await;
                }
                self.record_error(document_id, stage, retry, ErrorKind::Permanent, RESOLUTION_PERMANENT)
                    .await?;
                warn!(attempt = row.attempt_count, error = %summary, "Permanent failure");
                self.emit(
                    PipelineEvent::StageFailed,
                    json!({
                        "document_id": document_id,
                        "stage": stage,
                        "error_kind": ErrorKind::Permanent.as_str(),
                        "error": summary,
                    }),
                )
                .await;
                return Ok(RetryOutcome::PermanentFailure { summary });
            }

            let allowed = verdict.allowed_retries(self.policy.max_retries);
            if retry >= allowed {
                if !self.state.try_fail_stage(document_id, stage, &summary).await? {
                    return self.superseded(document_id, stage).await;
                }
                self.record_error(
                    document_id,
                    stage,
                    retry,
                    ErrorKind::Transient,
                    RESOLUTION_RETRIES_EXHAUSTED,
                )
                .await?;
                warn!(
                    attempts = row.attempt_count,
                    allowed_retries = allowed,
                    error = %summary,
                    "Retries exhausted"
                );
                self.emit(
                    PipelineEvent::RetriesExhausted,
                    json!({
                        "document_id": document_id,
                        "stage": stage,
                        "attempts": row.attempt_count,
                        "error": summary,
                    }),
                )
                .await;
                return Ok(RetryOutcome::RetriesExhausted {
                    attempts: row.attempt_count,
                    summary,
                });
            }

            if !guard.held {
                if !self
                    .state
                    .store()
                    .try_acquire_lock(&guard.key, guard.owner, self.policy.lock_ttl())
                    .await?
                {
                    info!("Retry already in progress");
                    self.emit(
                        PipelineEvent::RetryInProgress,
                        json!({ "document_id": document_id, "stage": stage }),
                    )
                    .await;
                    return Ok(RetryOutcome::RetryInProgress);
                }
                guard.held = true;
            }

            if !self.state.reschedule_stage(document_id, stage, &summary).await? {
                return self.superseded(document_id, stage).await;
            }
            let record = self
                .record_error(document_id, stage, retry, ErrorKind::Transient, RESOLUTION_RETRY_SCHEDULED)
                .await?;

            let delay = self.policy.delay_for(retry);
            info!(
                correlation_id = %record.correlation_id,
                retry,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %summary,
                "Retry scheduled"
            );
            self.emit(
                PipelineEvent::RetryScheduled,
                json!({
                    "document_id": document_id,
                    "stage": stage,
                    "correlation_id": record.correlation_id,
                    "retry": retry,
                    "delay_ms": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "error": summary,
                }),
            )
            .await;

            tokio::select! {
                () = cancel.cancelled() => {
                    return self.cancel(document_id, stage, guard).await;
                }
                () = tokio::time::sleep(delay) => {}
            }

            if !self.reclaim_lease(guard).await? {
                return self.superseded(document_id, stage).await;
            }

            let row = match self.state.resume_stage(document_id, stage, guard.owner).await {
                Ok(row) => row,
                Err(DocflowError::InvalidTransition {
                    from: StageStatus::Failed,
                    ..
                }) => {
                    // Cancelled while waiting.
                    return Ok(RetryOutcome::Cancelled);
                }
                Err(e) if e.is_informational() => {
                    return self.superseded(document_id, stage).await;
                }
                Err(e) => return Err(e),
            };
            self.emit(
                PipelineEvent::StageStarted,
                json!({
                    "document_id": document_id,
                    "stage": stage,
                    "attempt": row.attempt_count,
                }),
            )
            .await;

            match self
                .run_attempt(processor, &input.for_attempt(row.attempt_count), cancel)
                .await
            {
                Attempt::Succeeded(output) => {
                    self.state.complete_stage(document_id, stage).await?;
                    info!(attempts = row.attempt_count, "Stage recovered");
                    self.emit(
                        PipelineEvent::StageCompleted,
                        json!({
                            "document_id": document_id,
                            "stage": stage,
                            "attempt": row.attempt_count,
                        }),
                    )
                    .await;
                    return Ok(RetryOutcome::Recovered {
                        output,
                        attempts: row.attempt_count,
                    });
                }
                Attempt::Failed(next) => {
                    debug!(attempt = row.attempt_count, error = %next, "Retry attempt failed");
                    error = next;
                }
                Attempt::Cancelled => return self.cancel(document_id, stage, guard).await,
            }
        }
    }

    /// Renews the lease, re-acquiring it if it lapsed unclaimed.
    async fn reclaim_lease(&self, guard: &mut LockGuard) -> Result<bool> {
        let store = self.state.store();
        let ttl = self.policy.lock_ttl();
        if store.renew_lock(&guard.key, guard.owner, ttl).await? {
            return Ok(true);
        }
        warn!(lock = %guard.key, "Retry lock lease lapsed");
        guard.held = store.try_acquire_lock(&guard.key, guard.owner, ttl).await?;
        Ok(guard.held)
    }

    /// Outcome for a chain whose stage row moved under another caller.
    async fn superseded(&self, document_id: &str, stage: &str) -> Result<RetryOutcome> {
        let row = self.state.stage(document_id, stage).await?;
        let cancelled = row.status == StageStatus::Failed
            && row.last_error_summary.as_deref() == Some(CANCELLED_SUMMARY);
        if cancelled {
            return Ok(RetryOutcome::Cancelled);
        }
        info!(status = %row.status, "Stage handled by another caller");
        self.emit(
            PipelineEvent::RetryInProgress,
            json!({ "document_id": document_id, "stage": stage }),
        )
        .await;
        Ok(RetryOutcome::RetryInProgress)
    }

    async fn cancel(
        &self,
        document_id: &str,
        stage: &str,
        guard: &mut LockGuard,
    ) -> Result<RetryOutcome> {
        self.state.cancel_stage(document_id, stage).await?;
        // cancel_stage force-releases the lock.
        guard.held = false;
        warn!(reason = CANCELLED_SUMMARY, "Retry chain cancelled");
        self.emit(
            PipelineEvent::StageCancelled,
            json!({ "document_id": document_id, "stage": stage }),
        )
        .await;
        Ok(RetryOutcome::Cancelled)
    }

    async fn record_error(
        &self,
        document_id: &str,
        stage: &str,
        retry: u32,
        kind: ErrorKind,
        resolution: &str,
    ) -> Result<PipelineErrorRecord> {
        let record = PipelineErrorRecord::new(document_id, stage, retry, kind, resolution);
        self.state.store().append_error(&record).await?;
        Ok(record)
    }

    pub(crate) async fn emit(&self, event: PipelineEvent, data: serde_json::Value) {
        self.events.emit(event, data).await;
    }

    pub(crate) fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Document;
    use crate::errors::ErrorHint;
    use crate::events::CollectingEventSink;
    use crate::pipeline::retry::JitterStrategy;
    use crate::store::{DurableStore, InMemoryStore};
    use crate::testing::ScriptedProcessor;
    use std::time::Duration;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_retries(max_retries)
            .with_base_delay_ms(1)
            .with_max_delay_ms(5)
            .with_jitter(JitterStrategy::None)
    }

    async fn setup(policy: RetryPolicy) -> (RetryOrchestrator, InMemoryStore, StageInput) {
        let memory = InMemoryStore::new();
        let state = StageStateStore::new(Arc::new(memory.clone()));
        let document = Document::new("doc-1", vec!["embedding".to_string()]);
        state.register_document(&document).await.unwrap();
        state.start_stage("doc-1", "embedding").await.unwrap();
        let orchestrator = RetryOrchestrator::new(state, policy);
        (orchestrator, memory, StageInput::new(document, "embedding"))
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let (orchestrator, memory, input) = setup(fast_policy(3)).await;
        let processor = ScriptedProcessor::always_ok("embedding");

        let outcome = orchestrator
            .handle_failure(
                &processor,
                &input,
                StageError::validation("bad page"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, RetryOutcome::PermanentFailure { .. }));
        assert_eq!(processor.calls(), 0);
        let errors = memory.list_errors("doc-1").await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_kind, ErrorKind::Permanent);
        assert_eq!(errors[0].resolution_notes, RESOLUTION_PERMANENT);
        let row = orchestrator.state().stage("doc-1", "embedding").await.unwrap();
        assert_eq!(row.status, StageStatus::Failed);
        assert_eq!(row.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let (orchestrator, memory, input) = setup(fast_policy(3)).await;
        let processor = ScriptedProcessor::new("embedding")
            .then_fail(StageError::timeout("slow"))
            .then_ok();

        let outcome = orchestrator
            .handle_failure(
                &processor,
                &input,
                StageError::timeout("slow"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, RetryOutcome::Recovered { attempts: 3, .. }));
        let correlation: Vec<String> = memory
            .list_errors("doc-1")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.correlation_id)
            .collect();
        assert_eq!(
            correlation,
            vec![
                "req_doc-1.stage_embedding.retry_0".to_string(),
                "req_doc-1.stage_embedding.retry_1".to_string(),
            ]
        );
        assert_eq!(memory.live_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_exhaustion_after_max_retries() {
        let (orchestrator, memory, input) = setup(fast_policy(2)).await;
        let processor = ScriptedProcessor::always_fail("embedding", StageError::http(503, "busy"));

        let outcome = orchestrator
            .handle_failure(
                &processor,
                &input,
                StageError::http(503, "busy"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, RetryOutcome::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(processor.calls(), 2);
        let errors = memory.list_errors("doc-1").await.unwrap();
        let notes: Vec<&str> = errors.iter().map(|e| e.resolution_notes.as_str()).collect();
        assert_eq!(
            notes,
            vec![
                RESOLUTION_RETRY_SCHEDULED,
                RESOLUTION_RETRY_SCHEDULED,
                RESOLUTION_RETRIES_EXHAUSTED
            ]
        );
        assert_eq!(errors[2].correlation_id, "req_doc-1.stage_embedding.retry_2");
        assert_eq!(memory.live_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_errors_use_conservative_cap() {
        let (orchestrator, _, input) = setup(fast_policy(5)).await;
        let processor =
            ScriptedProcessor::always_fail("embedding", StageError::new(ErrorHint::Unknown, "??"));

        let outcome = orchestrator
            .handle_failure(
                &processor,
                &input,
                StageError::new(ErrorHint::Unknown, "??"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, RetryOutcome::RetriesExhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_held_lock_reports_retry_in_progress() {
        let (orchestrator, memory, input) = setup(fast_policy(3)).await;
        memory
            .try_acquire_lock(
                &LockKey::new("doc-1", "embedding"),
                Uuid::new_v4(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        let events = Arc::new(CollectingEventSink::new());
        let orchestrator = orchestrator.with_event_sink(events.clone());
        let processor = ScriptedProcessor::always_ok("embedding");

        let outcome = orchestrator
            .handle_failure(
                &processor,
                &input,
                StageError::timeout("slow"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, RetryOutcome::RetryInProgress);
        assert_eq!(processor.calls(), 0);
        assert_eq!(memory.error_count(), 0);
        assert_eq!(events.count(PipelineEvent::RetryInProgress), 1);
        // The other holder's lease is untouched.
        assert_eq!(memory.live_lock_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let policy = fast_policy(3).with_base_delay_ms(10_000).with_max_delay_ms(10_000);
        let (orchestrator, memory, input) = setup(policy).await;
        let processor = ScriptedProcessor::always_ok("embedding");
        let cancel = CancellationToken::new();

        let trigger = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel("shutdown");
            })
        };

        let outcome = orchestrator
            .handle_failure(&processor, &input, StageError::timeout("slow"), &cancel)
            .await
            .unwrap();
        trigger.await.unwrap();

        assert_eq!(outcome, RetryOutcome::Cancelled);
        assert_eq!(processor.calls(), 0);
        let row = orchestrator.state().stage("doc-1", "embedding").await.unwrap();
        assert_eq!(row.status, StageStatus::Failed);
        assert_eq!(row.last_error_summary.as_deref(), Some(CANCELLED_SUMMARY));
        assert_eq!(memory.live_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_external_cancel_of_scheduled_retry() {
        let policy = fast_policy(3).with_base_delay_ms(50).with_max_delay_ms(50);
        let (orchestrator, memory, input) = setup(policy).await;
        let processor = ScriptedProcessor::always_ok("embedding");

        let state = orchestrator.state().clone();
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            state.cancel_stage("doc-1", "embedding").await.unwrap()
        });

        let outcome = orchestrator
            .handle_failure(
                &processor,
                &input,
                StageError::timeout("slow"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(canceller.await.unwrap());
        assert_eq!(outcome, RetryOutcome::Cancelled);
        assert_eq!(processor.calls(), 0);
        assert_eq!(memory.live_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_start_during_backoff_is_refused() {
        let policy = fast_policy(3).with_base_delay_ms(100).with_max_delay_ms(100);
        let (orchestrator, memory, input) = setup(policy).await;
        let processor = ScriptedProcessor::always_ok("embedding");

        let state = orchestrator.state().clone();
        let intruder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            state.start_stage("doc-1", "embedding").await
        });

        let outcome = orchestrator
            .handle_failure(
                &processor,
                &input,
                StageError::timeout("slow"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let refused = intruder.await.unwrap().unwrap_err();
        assert!(matches!(refused, DocflowError::RetryInProgress { .. }));
        assert!(matches!(outcome, RetryOutcome::Recovered { attempts: 2, .. }));
        assert_eq!(processor.calls(), 1);
        let row = orchestrator.state().stage("doc-1", "embedding").await.unwrap();
        assert_eq!(row.status, StageStatus::Completed);
        assert_eq!(row.attempt_count, 2);
        assert_eq!(memory.live_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_late_permanent_failure_leaves_scheduled_retry_alone() {
        let policy = fast_policy(3).with_base_delay_ms(100).with_max_delay_ms(100);
        let (orchestrator, memory, input) = setup(policy).await;
        let processor = ScriptedProcessor::always_ok("embedding");
        let cancel = CancellationToken::new();

        let (first, second) = tokio::join!(
            orchestrator.handle_failure(&processor, &input, StageError::timeout("slow"), &cancel),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                orchestrator
                    .handle_failure(&processor, &input, StageError::validation("bad page"), &cancel)
                    .await
            }
        );

        assert!(matches!(first.unwrap(), RetryOutcome::Recovered { attempts: 2, .. }));
        assert_eq!(second.unwrap(), RetryOutcome::RetryInProgress);
        let errors = memory.list_errors("doc-1").await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].resolution_notes, RESOLUTION_RETRY_SCHEDULED);
        let row = orchestrator.state().stage("doc-1", "embedding").await.unwrap();
        assert_eq!(row.status, StageStatus::Completed);
    }

    #[tokio::test]
    async fn test_outcome_helpers() {
        assert!(RetryOutcome::Cancelled.is_terminal_failure());
        assert!(!RetryOutcome::RetryInProgress.is_terminal_failure());
        assert_eq!(RetryOutcome::RetryInProgress.as_str(), "retry_in_progress");
    }
}
