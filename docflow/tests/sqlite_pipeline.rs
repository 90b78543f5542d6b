//! Pipelines persisted in a SQLite file, driven through the public API.

#![cfg(feature = "sqlite")]

use std::sync::Arc;
use std::time::Duration;

use docflow::core::{ErrorKind, StageStatus, RESOLUTION_RETRIES_EXHAUSTED};
use docflow::errors::{ErrorHint, StageError};
use docflow::events::PipelineEvent;
use docflow::pipeline::{JitterStrategy, ShutdownMode};
use docflow::prelude::*;
use docflow::store::LockKey;
use docflow::testing::{ScriptedProcessor, TestHarness};
use pretty_assertions::assert_eq;
use tokio_test::assert_ok;
use uuid::Uuid;

fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new()
        .with_max_retries(max_retries)
        .with_base_delay_ms(1)
        .with_max_delay_ms(4)
        .with_jitter(JitterStrategy::None)
}

fn pipeline(second: Arc<ScriptedProcessor>) -> anyhow::Result<PipelineDefinition> {
    Ok(PipelineDefinition::builder("ingest")
        .stage(Arc::new(ScriptedProcessor::always_ok("upload")))?
        .stage(second)?
        .stage(Arc::new(ScriptedProcessor::always_ok("search_indexing")))?
        .build()?)
}

async fn sqlite_store(dir: &tempfile::TempDir) -> anyhow::Result<Arc<dyn DurableStore>> {
    let url = format!("sqlite://{}", dir.path().join("docflow.db").display());
    Ok(Arc::new(SqliteStore::connect(&url).await?))
}

#[tokio::test]
async fn recovers_transient_failures_on_sqlite() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ocr = Arc::new(
        ScriptedProcessor::new("text_extraction")
            .then_fail(StageError::new(ErrorHint::RateLimited, "slow down"))
            .then_fail(StageError::timeout("deadline exceeded"))
            .then_ok(),
    );
    let harness = TestHarness::with_store(sqlite_store(&dir).await?, pipeline(ocr.clone())?, fast_policy(3));

    let report = harness.submit_and_run("doc-1").await?;
    assert!(report.is_complete());
    assert_eq!(report.progress, 100);

    let row = harness.state().stage("doc-1", "text_extraction").await?;
    assert_eq!(row.attempt_count, 3);
    assert_eq!(row.status, StageStatus::Completed);

    let errors = harness.state().list_errors("doc-1").await?;
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0].correlation_id, "req_doc-1.stage_text_extraction.retry_0");
    assert_eq!(errors[1].correlation_id, "req_doc-1.stage_text_extraction.retry_1");
    assert_eq!(harness.events().count(PipelineEvent::RetryScheduled), 2);
    Ok(())
}

#[tokio::test]
async fn exhausts_retries_and_survives_reopen() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ocr = Arc::new(ScriptedProcessor::always_fail(
        "text_extraction",
        StageError::new(ErrorHint::ServiceUnavailable, "maintenance"),
    ));
    let harness = TestHarness::with_store(sqlite_store(&dir).await?, pipeline(ocr.clone())?, fast_policy(2));

    let report = harness.submit_and_run("doc-1").await?;
    assert_eq!(report.status, DocumentStatus::Failed);
    assert_eq!(ocr.calls(), 3);

    // A fresh connection sees the same durable state.
    let reopened = StageStateStore::new(sqlite_store(&dir).await?);
    let row = reopened.stage("doc-1", "text_extraction").await?;
    assert_eq!(row.status, StageStatus::Failed);
    assert_eq!(row.attempt_count, 3);
    assert_eq!(reopened.document_status("doc-1").await?, DocumentStatus::Failed);
    assert_eq!(reopened.get_current_stage("doc-1").await?.as_deref(), Some("text_extraction"));
    assert_eq!(reopened.get_progress("doc-1").await?, 33);

    let errors = reopened.list_errors("doc-1").await?;
    assert_eq!(errors.len(), 3);
    assert!(errors.iter().all(|e| e.error_kind == ErrorKind::Transient));
    assert_eq!(errors[2].resolution_notes, RESOLUTION_RETRIES_EXHAUSTED);
    Ok(())
}

#[tokio::test]
async fn permanent_failure_is_not_retried_on_sqlite() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ocr = Arc::new(ScriptedProcessor::always_fail(
        "text_extraction",
        StageError::new(ErrorHint::Unauthorized, "token rejected"),
    ));
    let harness = TestHarness::with_store(sqlite_store(&dir).await?, pipeline(ocr.clone())?, fast_policy(4));

    assert_ok!(harness.submit_and_run("doc-1").await);
    assert_eq!(ocr.calls(), 1);

    let errors = harness.state().list_errors("doc-1").await?;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error_kind, ErrorKind::Permanent);
    Ok(())
}

#[tokio::test]
async fn runner_processes_many_documents_against_one_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = sqlite_store(&dir).await?;
    let ocr = Arc::new(
        ScriptedProcessor::new("text_extraction")
            .then_fail(StageError::timeout("first call is slow"))
            .with_delay(Duration::from_millis(2)),
    );
    let orchestrator = RetryOrchestrator::new(StageStateStore::new(store.clone()), fast_policy(3));
    let scheduler = PipelineScheduler::new(Arc::new(pipeline(ocr)?), orchestrator);
    let runner = DocumentRunner::new(scheduler.clone());

    for i in 0..4 {
        runner.submit(&scheduler.pipeline().document(format!("doc-{i}"))).await?;
    }
    let results = runner.shutdown(ShutdownMode::Drain).await;
    assert_eq!(results.len(), 4);
    for (document_id, result) in results {
        let report = result?;
        assert!(report.is_complete(), "{document_id} did not complete: {report:?}");
    }

    // Exactly one document hit the scripted failure.
    let mut error_rows = 0;
    for i in 0..4 {
        error_rows += scheduler.state().list_errors(&format!("doc-{i}")).await?.len();
    }
    assert_eq!(error_rows, 1);
    Ok(())
}

#[tokio::test]
async fn configured_store_and_orchestrator() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = DocflowConfig::from_toml_str(&format!(
        r#"
        [retry]
        max_retries = 1
        base_delay_ms = 1
        max_delay_ms = 1
        jitter = "none"

        [classifier]
        permanent_patterns = ["(?i)password protected"]

        [store]
        url = "sqlite://{}"
        "#,
        dir.path().join("configured.db").display()
    ))?;

    let store = config.store.open().await?;
    let orchestrator = config.orchestrator(
        StageStateStore::new(store),
        Arc::new(MetricsCollector::new(config.metrics.clone())),
        Arc::new(NoOpEventSink),
    )?;
    let ocr = Arc::new(ScriptedProcessor::always_fail(
        "text_extraction",
        StageError::new(ErrorHint::Unknown, "PDF is password protected"),
    ));
    let scheduler = PipelineScheduler::new(Arc::new(pipeline(ocr.clone())?), orchestrator);
    scheduler.submit(&scheduler.pipeline().document("doc-1")).await?;

    let report = scheduler.run_document("doc-1", &CancellationToken::new()).await?;
    assert_eq!(report.status, DocumentStatus::Failed);
    assert_eq!(ocr.calls(), 1);
    Ok(())
}

#[tokio::test]
async fn retry_lease_gates_stage_transitions_on_sqlite() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = sqlite_store(&dir).await?;
    let state = StageStateStore::new(store.clone());
    state
        .register_document(&Document::new(
            "doc-1",
            vec!["upload".to_string(), "text_extraction".to_string()],
        ))
        .await?;

    // Nothing to cancel on a stage that never started.
    assert!(!state.cancel_stage("doc-1", "text_extraction").await?);
    assert_eq!(
        state.stage("doc-1", "text_extraction").await?.status,
        StageStatus::Pending
    );

    state.start_stage("doc-1", "upload").await?;
    assert!(state.reschedule_stage("doc-1", "upload", "timeout").await?);
    let owner = Uuid::new_v4();
    assert!(
        store
            .try_acquire_lock(&LockKey::new("doc-1", "upload"), owner, Duration::from_secs(60))
            .await?
    );

    let err = state.start_stage("doc-1", "upload").await.unwrap_err();
    assert!(matches!(err, DocflowError::RetryInProgress { .. }));
    assert!(state.resume_stage("doc-1", "upload", Uuid::new_v4()).await.is_err());

    let row = state.resume_stage("doc-1", "upload", owner).await?;
    assert_eq!(row.status, StageStatus::Running);
    assert_eq!(row.attempt_count, 2);
    Ok(())
}
