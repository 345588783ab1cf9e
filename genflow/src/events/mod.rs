//! Pipeline lifecycle events.
//!
//! The coordinator reports every state transition to an injected
//! [`EventSink`]. Sinks are plain values handed to the coordinator builder;
//! there is no process-wide sink.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::{JobId, Stage};

/// Kinds of lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// A service request was accepted.
    #[serde(rename = "job.submitted")]
    JobSubmitted,
    /// A worker took the job.
    #[serde(rename = "stage.activated")]
    StageActivated,
    /// A stage finished successfully.
    #[serde(rename = "stage.completed")]
    StageCompleted,
    /// A failed attempt was scheduled for retry.
    #[serde(rename = "stage.retrying")]
    StageRetrying,
    /// A stage failed for good.
    #[serde(rename = "stage.failed")]
    StageFailed,
    /// A stage was abandoned at a cancellation checkpoint.
    #[serde(rename = "stage.cancelled")]
    StageCancelled,
    /// Deployment completed.
    #[serde(rename = "pipeline.deployed")]
    PipelineDeployed,
    /// Cleanup finished after a failure.
    #[serde(rename = "pipeline.failed")]
    PipelineFailed,
    /// Cleanup itself failed.
    #[serde(rename = "pipeline.failed_cleanup")]
    PipelineFailedCleanup,
    /// Cleanup finished after a cancellation.
    #[serde(rename = "pipeline.cancelled")]
    PipelineCancelled,
}

impl EventType {
    /// Dotted event name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::JobSubmitted => "job.submitted",
            Self::StageActivated => "stage.activated",
            Self::StageCompleted => "stage.completed",
            Self::StageRetrying => "stage.retrying",
            Self::StageFailed => "stage.failed",
            Self::StageCancelled => "stage.cancelled",
            Self::PipelineDeployed => "pipeline.deployed",
            Self::PipelineFailed => "pipeline.failed",
            Self::PipelineFailedCleanup => "pipeline.failed_cleanup",
            Self::PipelineCancelled => "pipeline.cancelled",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// What happened.
    pub event_type: EventType,
    /// The job.
    pub job_id: JobId,
    /// The service.
    pub service_name: String,
    /// The stage involved.
    pub stage: Stage,
    /// The attempt involved.
    pub attempt: u32,
    /// When it happened.
    pub at: DateTime<Utc>,
    /// Error message or other context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl PipelineEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(
        event_type: EventType,
        job_id: JobId,
        service_name: impl Into<String>,
        stage: Stage,
        attempt: u32,
    ) -> Self {
        Self {
            event_type,
            job_id,
            service_name: service_name.into(),
            stage,
            attempt,
            at: Utc::now(),
            detail: None,
        }
    }

    /// Attaches detail text.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
