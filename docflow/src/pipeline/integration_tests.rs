//! End-to-end behaviour of the scheduler, orchestrator and state store.

#[cfg(test)]
mod tests {
    use crate::cancellation::CancellationToken;
    use crate::core::{
        correlation_id, Document, DocumentStatus, ErrorKind, StageStatus,
        RESOLUTION_RETRIES_EXHAUSTED, RESOLUTION_RETRY_SCHEDULED,
    };
    use crate::errors::{DocflowError, ErrorHint, StageError};
    use crate::events::PipelineEvent;
    use crate::pipeline::{
        JitterStrategy, PipelineDefinition, RetryOutcome, RetryPolicy, StopReason,
    };
    use crate::stages::{ProgressReporter, StageInput, StageProcessor};
    use crate::testing::{RecordingProcessor, ScriptedProcessor, TestHarness};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    fn three_stages(second: Arc<ScriptedProcessor>) -> PipelineDefinition {
        PipelineDefinition::builder("ingest")
            .stage(Arc::new(ScriptedProcessor::always_ok("upload")))
            .unwrap()
            .stage(second)
            .unwrap()
            .stage(Arc::new(ScriptedProcessor::always_ok("embedding")))
            .unwrap()
            .build()
            .unwrap()
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_retries(max_retries)
            .with_base_delay_ms(1)
            .with_max_delay_ms(2)
            .with_jitter(JitterStrategy::None)
    }

    #[tokio::test]
    async fn test_fail_twice_then_succeed_scenario() {
        let ocr = Arc::new(
            ScriptedProcessor::new("text_extraction")
                .then_fail(StageError::new(ErrorHint::ConnectionReset, "connection reset"))
                .then_fail(StageError::http(503, "unavailable"))
                .then_ok(),
        );
        let harness = TestHarness::with_policy(three_stages(ocr.clone()), policy(3));

        let report = harness.submit_and_run("doc-1").await.unwrap();
        assert_eq!(report.status, DocumentStatus::Completed);
        assert_eq!(report.progress, 100);
        assert_eq!(harness.state().get_progress("doc-1").await.unwrap(), 100);

        let row = harness.state().stage("doc-1", "text_extraction").await.unwrap();
        assert_eq!(row.status, StageStatus::Completed);
        assert_eq!(row.attempt_count, 3);
        assert_eq!(ocr.attempts(), vec![1, 2, 3]);

        let errors = harness.state().list_errors("doc-1").await.unwrap();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.stage_name == "text_extraction"));
        assert!(errors.iter().all(|e| e.resolution_notes == RESOLUTION_RETRY_SCHEDULED));
    }

    #[tokio::test]
    async fn test_transient_failure_attempted_max_retries_plus_one() {
        let ocr = Arc::new(ScriptedProcessor::always_fail(
            "text_extraction",
            StageError::timeout("deadline exceeded"),
        ));
        let harness = TestHarness::with_policy(three_stages(ocr.clone()), policy(2));

        let report = harness.submit_and_run("doc-1").await.unwrap();
        assert_eq!(report.status, DocumentStatus::Failed);
        assert_eq!(
            report.stopped,
            Some(StopReason::Failed { stage: "text_extraction".to_string() })
        );

        assert_eq!(ocr.calls(), 3);
        let row = harness.state().stage("doc-1", "text_extraction").await.unwrap();
        assert_eq!(row.status, StageStatus::Failed);
        assert_eq!(row.attempt_count, 3);

        let errors = harness.state().list_errors("doc-1").await.unwrap();
        let last = errors.last().unwrap();
        assert_eq!(last.resolution_notes, RESOLUTION_RETRIES_EXHAUSTED);
        assert_eq!(harness.events().count(PipelineEvent::RetriesExhausted), 1);
        assert_eq!(harness.events().count(PipelineEvent::DocumentFailed), 1);

        let embedding = harness.state().stage("doc-1", "embedding").await.unwrap();
        assert_eq!(embedding.status, StageStatus::Pending);
    }

    #[tokio::test]
    async fn test_correlation_ids_are_numbered_in_order() {
        let ocr = Arc::new(ScriptedProcessor::always_fail(
            "text_extraction",
            StageError::new(ErrorHint::ConnectionRefused, "connection refused"),
        ));
        let harness = TestHarness::with_policy(three_stages(ocr), policy(2));
        harness.submit_and_run("doc-7").await.unwrap();

        let ids: Vec<String> = harness
            .state()
            .list_errors("doc-7")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.correlation_id)
            .collect();
        assert_eq!(
            ids,
            vec![
                "req_doc-7.stage_text_extraction.retry_0".to_string(),
                "req_doc-7.stage_text_extraction.retry_1".to_string(),
                "req_doc-7.stage_text_extraction.retry_2".to_string(),
            ]
        );
        assert_eq!(ids[1], correlation_id("doc-7", "text_extraction", 1));
    }

    #[tokio::test]
    async fn test_permanent_failure_single_attempt_no_transient_records() {
        let ocr = Arc::new(ScriptedProcessor::always_fail(
            "text_extraction",
            StageError::http(422, "schema mismatch"),
        ));
        let harness = TestHarness::with_policy(three_stages(ocr.clone()), policy(5));

        let report = harness.submit_and_run("doc-1").await.unwrap();
        assert_eq!(report.status, DocumentStatus::Failed);
        assert_eq!(ocr.calls(), 1);

        let row = harness.state().stage("doc-1", "text_extraction").await.unwrap();
        assert_eq!(row.status, StageStatus::Failed);
        assert_eq!(row.attempt_count, 1);
        assert_eq!(row.last_error_summary.as_deref(), Some("unknown (status 422): schema mismatch"));

        let errors = harness.state().list_errors("doc-1").await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_kind, ErrorKind::Permanent);
        assert!(errors.iter().all(|e| e.error_kind != ErrorKind::Transient));
        assert_eq!(harness.events().count(PipelineEvent::RetryScheduled), 0);
    }

    #[tokio::test]
    async fn test_concurrent_failure_handlers_start_one_retry() {
        let harness = TestHarness::with_policy(
            PipelineDefinition::builder("single")
                .stage(Arc::new(ScriptedProcessor::always_ok("classification")))
                .unwrap()
                .build()
                .unwrap(),
            RetryPolicy::new()
                .with_max_retries(3)
                .with_base_delay_ms(50)
                .with_max_delay_ms(50)
                .with_jitter(JitterStrategy::None),
        );
        let document = Document::new("doc-1", vec!["classification".to_string()]);
        harness.state().register_document(&document).await.unwrap();
        harness.state().start_stage("doc-1", "classification").await.unwrap();

        let processor = ScriptedProcessor::always_ok("classification");
        let input = StageInput::new(document, "classification");
        let cancel = CancellationToken::new();
        let orchestrator = harness.orchestrator();

        let (first, second) = tokio::join!(
            orchestrator.handle_failure(&processor, &input, StageError::timeout("slow"), &cancel),
            orchestrator.handle_failure(&processor, &input, StageError::timeout("slow"), &cancel),
        );
        let mut outcomes = vec![first.unwrap(), second.unwrap()];
        outcomes.sort_by_key(|o| o.as_str());

        assert!(matches!(outcomes[0], RetryOutcome::Recovered { attempts: 2, .. }));
        assert_eq!(outcomes[1], RetryOutcome::RetryInProgress);
        assert_eq!(processor.calls(), 1);
        assert_eq!(harness.state().list_errors("doc-1").await.unwrap().len(), 1);
        assert_eq!(harness.events().count(PipelineEvent::RetryInProgress), 1);
        assert_eq!(harness.memory().live_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_stages_never_start_before_predecessors() {
        let ocr = Arc::new(
            ScriptedProcessor::new("text_extraction").then_fail(StageError::timeout("slow")),
        );
        let harness = TestHarness::with_policy(three_stages(ocr), policy(0));
        let document = harness.scheduler().pipeline().document("doc-1");
        harness.scheduler().submit(&document).await.unwrap();

        let err = harness.state().start_stage("doc-1", "embedding").await.unwrap_err();
        assert!(matches!(err, DocflowError::OutOfOrder { .. }));

        harness.run("doc-1").await.unwrap();
        assert!(!harness.state().can_start_stage("doc-1", "embedding").await.unwrap());
        let embedding = harness.state().stage("doc-1", "embedding").await.unwrap();
        assert_eq!(embedding.attempt_count, 0);

        let kinds = harness.events().kinds();
        let started: Vec<String> = harness
            .events()
            .events()
            .into_iter()
            .filter(|(kind, _)| *kind == PipelineEvent::StageStarted)
            .map(|(_, data)| data["stage"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(started, vec!["upload".to_string(), "text_extraction".to_string()]);
        assert!(kinds.contains(&PipelineEvent::RetriesExhausted));
    }

    #[tokio::test]
    async fn test_progress_is_full_only_when_every_stage_is_done() {
        let harness = TestHarness::new(three_stages(Arc::new(ScriptedProcessor::always_ok(
            "text_extraction",
        ))));
        let state = harness.state();
        let document = harness.scheduler().pipeline().document("doc-1");
        state.register_document(&document).await.unwrap();

        assert_eq!(state.get_progress("doc-1").await.unwrap(), 0);
        state.start_stage("doc-1", "upload").await.unwrap();
        state.complete_stage("doc-1", "upload").await.unwrap();
        assert_eq!(state.get_progress("doc-1").await.unwrap(), 33);

        state.skip_stage("doc-1", "text_extraction", "no text layer").await.unwrap();
        assert_eq!(state.get_progress("doc-1").await.unwrap(), 66);
        assert_eq!(
            state.get_current_stage("doc-1").await.unwrap().as_deref(),
            Some("embedding")
        );

        state.start_stage("doc-1", "embedding").await.unwrap();
        assert!(state.get_progress("doc-1").await.unwrap() < 100);
        state.complete_stage("doc-1", "embedding").await.unwrap();
        assert_eq!(state.get_progress("doc-1").await.unwrap(), 100);
        assert_eq!(state.get_current_stage("doc-1").await.unwrap(), None);
        assert_eq!(state.document_status("doc-1").await.unwrap(), DocumentStatus::Completed);
    }

    #[tokio::test]
    async fn test_complete_twice_keeps_first_timestamps() {
        let harness = TestHarness::new(three_stages(Arc::new(ScriptedProcessor::always_ok(
            "text_extraction",
        ))));
        harness.submit_and_run("doc-1").await.unwrap();

        let before = harness.state().stage("doc-1", "upload").await.unwrap();
        harness.state().complete_stage("doc-1", "upload").await.unwrap();
        let after = harness.state().stage("doc-1", "upload").await.unwrap();
        assert_eq!(before.attempt_count, after.attempt_count);
        assert_eq!(before.completed_at, after.completed_at);

        let report = harness.run("doc-1").await.unwrap();
        assert!(report.completed.is_empty());
        assert_eq!(harness.events().count(PipelineEvent::DocumentCompleted), 1);
    }

    #[tokio::test]
    async fn test_upstream_outputs_reach_later_stages() {
        let recorder = Arc::new(RecordingProcessor::new("embedding"));
        let pipeline = PipelineDefinition::builder("ingest")
            .stage(Arc::new(RecordingProcessor::new("upload")))
            .unwrap()
            .stage(recorder.clone())
            .unwrap()
            .build()
            .unwrap();
        let harness = TestHarness::new(pipeline);
        harness.submit_and_run("doc-1").await.unwrap();

        let inputs = recorder.inputs();
        assert_eq!(inputs.len(), 1);
        assert_eq!(
            inputs[0]
                .upstream_output("upload")
                .and_then(|o| o.get("processed_by")),
            Some(&serde_json::json!("upload"))
        );
        let progress = harness.state().stage("doc-1", "embedding").await.unwrap();
        assert_eq!(progress.progress_percent, Some(100));
    }

    #[tokio::test]
    async fn test_metrics_follow_attempts() {
        let ocr = Arc::new(
            ScriptedProcessor::new("text_extraction")
                .then_fail(StageError::new(ErrorHint::ConnectionReset, "reset"))
                .then_ok(),
        );
        let harness = TestHarness::new(three_stages(ocr));
        let document = harness
            .scheduler()
            .pipeline()
            .document("doc-1")
            .with_manufacturer("acme")
            .with_document_type("invoice");
        harness.scheduler().submit(&document).await.unwrap();
        harness.run("doc-1").await.unwrap();

        let snapshot = harness.metrics().snapshot();
        assert_eq!(snapshot.success_total("text_extraction"), 1);
        assert_eq!(snapshot.failure_total("text_extraction"), 1);
        assert_eq!(harness.metrics().sample_count("text_extraction"), 2);
        assert!(harness.metrics().p95("text_extraction").is_some());

        let text = harness.metrics().render_prometheus();
        assert!(text.contains("manufacturer=\"acme\""));
        assert!(text.contains("document_type=\"invoice\""));
    }

    #[tokio::test]
    async fn test_restart_resumes_from_reclaimed_stage() {
        let ocr = Arc::new(ScriptedProcessor::always_ok("text_extraction"));
        let harness = TestHarness::new(three_stages(ocr.clone()));
        let document = harness.scheduler().pipeline().document("doc-1");
        let state = harness.state();
        state.register_document(&document).await.unwrap();
        state.start_stage("doc-1", "upload").await.unwrap();
        state.complete_stage("doc-1", "upload").await.unwrap();
        // Simulates a scheduler that died mid-stage.
        state.start_stage("doc-1", "text_extraction").await.unwrap();

        let report = harness.run("doc-1").await.unwrap();
        assert_eq!(
            report.stopped,
            Some(StopReason::AlreadyRunning { stage: "text_extraction".to_string() })
        );

        tokio::time::sleep(Duration::from_millis(5)).await;
        let reclaimed = state.reclaim_stale_stages(Duration::from_millis(1)).await.unwrap();
        assert_eq!(reclaimed.len(), 1);

        let report = harness.run("doc-1").await.unwrap();
        assert!(report.is_complete());
        let row = state.stage("doc-1", "text_extraction").await.unwrap();
        assert_eq!(row.attempt_count, 2);
        assert_eq!(ocr.calls(), 1);
    }

    #[tokio::test]
    async fn test_processor_can_be_invoked_directly() {
        let processor = ScriptedProcessor::always_ok("upload");
        let input = StageInput::new(Document::standard("doc-1"), "upload");
        let output = processor.run(&input, &ProgressReporter::detached()).await.unwrap();
        assert!(output.data.is_empty());
    }
}
