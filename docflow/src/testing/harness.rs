use std::sync::Arc;

use crate::cancellation::CancellationToken;
use crate::errors::Result;
use crate::events::CollectingEventSink;
use crate::metrics::MetricsCollector;
use crate::pipeline::{
    JitterStrategy, PipelineDefinition, PipelineScheduler, RetryOrchestrator, RetryPolicy,
    RunReport, StageStateStore,
};
use crate::store::{DurableStore, InMemoryStore};

/// An in-memory pipeline with collecting sinks and millisecond backoff.
#[derive(Debug, Clone)]
pub struct TestHarness {
    memory: Arc<InMemoryStore>,
    events: Arc<CollectingEventSink>,
    scheduler: PipelineScheduler,
}

impl TestHarness {
    /// Creates a harness with [`fast_policy`](Self::fast_policy).
    #[must_use]
    pub fn new(pipeline: PipelineDefinition) -> Self {
        Self::with_policy(pipeline, Self::fast_policy())
    }

    /// Creates a harness with the given retry policy.
    #[must_use]
    pub fn with_policy(pipeline: PipelineDefinition, policy: RetryPolicy) -> Self {
        let memory = Arc::new(InMemoryStore::new());
        let store: Arc<dyn DurableStore> = memory.clone();
        Self::build(memory, StageStateStore::new(store), pipeline, policy)
    }

    /// Creates a harness over an arbitrary store. [`memory`](Self::memory)
    /// then returns an unused in-memory store.
    #[must_use]
    pub fn with_store(
        store: Arc<dyn DurableStore>,
        pipeline: PipelineDefinition,
        policy: RetryPolicy,
    ) -> Self {
        Self::build(
            Arc::new(InMemoryStore::new()),
            StageStateStore::new(store),
            pipeline,
            policy,
        )
    }

    fn build(
        memory: Arc<InMemoryStore>,
        state: StageStateStore,
        pipeline: PipelineDefinition,
        policy: RetryPolicy,
    ) -> Self {
        let events = Arc::new(CollectingEventSink::new());
        let orchestrator = RetryOrchestrator::new(state, policy)
            .with_metrics(Arc::new(MetricsCollector::default()))
            .with_event_sink(events.clone());
        Self {
            memory,
            events,
            scheduler: PipelineScheduler::new(Arc::new(pipeline), orchestrator),
        }
    }

    /// Three retries, 1ms base delay capped at 5ms, no jitter.
    #[must_use]
    pub fn fast_policy() -> RetryPolicy {
        RetryPolicy::new()
            .with_max_retries(3)
            .with_base_delay_ms(1)
            .with_max_delay_ms(5)
            .with_jitter(JitterStrategy::None)
    }

    /// Registers a document requiring every pipeline stage and runs it.
    pub async fn submit_and_run(&self, document_id: &str) -> Result<RunReport> {
        let document = self.scheduler.pipeline().document(document_id);
        self.scheduler.submit(&document).await?;
        self.run(document_id).await
    }

    /// Runs an already registered document with a fresh token.
    pub async fn run(&self, document_id: &str) -> Result<RunReport> {
        self.scheduler
            .run_document(document_id, &CancellationToken::new())
            .await
    }

    /// The scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &PipelineScheduler {
        &self.scheduler
    }

    /// The orchestrator.
    #[must_use]
    pub fn orchestrator(&self) -> &RetryOrchestrator {
        self.scheduler.orchestrator()
    }

    /// The stage state store.
    #[must_use]
    pub fn state(&self) -> &StageStateStore {
        self.scheduler.state()
    }

    /// The in-memory store backing [`state`](Self::state).
    #[must_use]
    pub fn memory(&self) -> &Arc<InMemoryStore> {
        &self.memory
    }

    /// Events emitted so far.
    #[must_use]
    pub fn events(&self) -> &CollectingEventSink {
        &self.events
    }

    /// The metrics collector.
    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        self.scheduler.metrics()
    }
}
