//! Event sink trait and implementations.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn, Level};

use super::PipelineEvent;

/// Receives pipeline events.
#[async_trait]
pub trait EventSink: Send + Sync + std::fmt::Debug {
    /// Emits an event.
    async fn emit(&self, event: PipelineEvent, data: Value);

    /// Emits an event without blocking. Must never fail.
    fn try_emit(&self, event: PipelineEvent, data: Value);
}

/// Discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: PipelineEvent, _data: Value) {}

    fn try_emit(&self, _event: PipelineEvent, _data: Value) {}
}

/// Writes events to the tracing subscriber.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink at the given level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: PipelineEvent, data: &Value) {
        let event_type = event.as_str();
        if self.level == Level::DEBUG || self.level == Level::TRACE {
            debug!(event_type, event_data = %data, "pipeline event");
        } else if self.level == Level::WARN || self.level == Level::ERROR {
            warn!(event_type, event_data = %data, "pipeline event");
        } else {
            info!(event_type, event_data = %data, "pipeline event");
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: PipelineEvent, data: Value) {
        self.log_event(event, &data);
    }

    fn try_emit(&self, event: PipelineEvent, data: Value) {
        self.log_event(event, &data);
    }
}

/// Keeps every event in memory, for tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<(PipelineEvent, Value)>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<(PipelineEvent, Value)> {
        self.events.read().clone()
    }

    /// Returns the collected event kinds in order.
    #[must_use]
    pub fn kinds(&self) -> Vec<PipelineEvent> {
        self.events.read().iter().map(|(event, _)| *event).collect()
    }

    /// Counts events of one kind.
    #[must_use]
    pub fn count(&self, event: PipelineEvent) -> usize {
        self.events.read().iter().filter(|(e, _)| *e == event).count()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: PipelineEvent, data: Value) {
        self.events.write().push((event, data));
    }

    fn try_emit(&self, event: PipelineEvent, data: Value) {
        self.events.write().push((event, data));
    }
}
