//! Event sink trait and implementations.

use async_trait::async_trait;
use tracing::{error, info, warn, Level};

use super::{EventType, PipelineEvent};

/// Receives pipeline lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event.
    ///
    /// Sinks must not fail the pipeline; errors are logged and dropped.
    async fn emit(&self, event: &PipelineEvent);
}

/// A no-op event sink that discards all events.
///
/// Used as the default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: &PipelineEvent) {}
}

/// An event sink that logs events using the tracing framework.
///
/// Failure events are always logged at `warn` or `error`, whatever the
/// configured level.
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
    /// Creates a new logging event sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: &PipelineEvent) {
        let detail = event.detail.as_deref().unwrap_or("");
        match event.event_type {
            EventType::PipelineFailedCleanup => error!(
                event_type = %event.event_type,
                job_id = %event.job_id,
                service = %event.service_name,
                stage = %event.stage,
                attempt = event.attempt,
                detail,
                "Event: {}", event.event_type
            ),
            EventType::StageRetrying | EventType::StageFailed | EventType::PipelineFailed => warn!(
                event_type = %event.event_type,
                job_id = %event.job_id,
                service = %event.service_name,
                stage = %event.stage,
                attempt = event.attempt,
                detail,
                "Event: {}", event.event_type
            ),
            _ if self.level == Level::DEBUG => tracing::debug!(
                event_type = %event.event_type,
                job_id = %event.job_id,
                service = %event.service_name,
                stage = %event.stage,
                attempt = event.attempt,
                "Event: {}", event.event_type
            ),
            _ => info!(
                event_type = %event.event_type,
                job_id = %event.job_id,
                service = %event.service_name,
                stage = %event.stage,
                attempt = event.attempt,
                "Event: {}", event.event_type
            ),
        }
    }
}

/// A collecting event sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<PipelineEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.read().clone()
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

    /// Returns events of one type.
    #[must_use]
    pub fn events_of_type(&self, event_type: EventType) -> Vec<PipelineEvent> {
        self.events
            .read()
            .iter()
            .filter(|event| event.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Returns the event type sequence, in emission order.
    #[must_use]
    pub fn types(&self) -> Vec<EventType> {
        self.events.read().iter().map(|event| event.event_type).collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: &PipelineEvent) {
        self.events.write().push(event.clone());
    }
}
