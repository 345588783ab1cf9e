//! Job queue abstraction.
//!
//! This module provides:
//!
//! - [`JobQueue`]: at-least-once, per-stage message queue
//! - [`QueueMessage`]: the wire payload, a tagged union keyed by stage
//! - [`InMemoryJobQueue`]: visibility-timeout queue for tests and single
//!   process deployments
//! - [`ReconnectingQueue`]: retries operations while the broker is away
//! - [`QueueConnection`]: the lazily opened, explicitly closed broker handle
//!
//! The queue never deduplicates. Message ids are derived from
//! `(service, stage, attempt)` so that consumers can recognise a redelivery,
//! and the coordinator checks every delivery against the job store before
//! acting on it.

mod connection;
mod memory;
mod reconnect;

pub use connection::{Connector, QueueConnection};
pub use memory::InMemoryJobQueue;
pub use reconnect::ReconnectingQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::core::{validate_service_name, ArtifactRef, JobId, JobRecord, Stage};
use crate::errors::{PipelineError, Result, ValidationError};

/// Deterministic message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Derives the id of the message for one attempt of one stage of one run.
    ///
    /// The run's correlation id keeps a later pipeline for the same service
    /// from reusing the ids of an earlier one.
    #[must_use]
    pub fn derive(service_name: &str, correlation_id: Uuid, stage: Stage, attempt: u32) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(service_name.as_bytes());
        hasher.update([0]);
        hasher.update(correlation_id.as_bytes());
        hasher.update([0]);
        hasher.update(stage.to_string().as_bytes());
        hasher.update([0]);
        hasher.update(attempt.to_be_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-stage fields of a queue message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StagePayload {
    /// Render the template.
    Generation {
        /// Template to render.
        template_id: String,
        /// Target environment.
        target_env: String,
    },
    /// Build the generated project.
    Build {
        /// The generated tree.
        artifact_ref: ArtifactRef,
    },
    /// Deploy the built project.
    Deployment {
        /// The build output.
        artifact_ref: ArtifactRef,
        /// Target environment.
        target_env: String,
    },
    /// Tear down whatever was produced.
    Cleanup {
        /// Latest artifact, if any stage produced one.
        #[serde(default)]
        artifact_ref: Option<ArtifactRef>,
        /// The stage that was running when the job was routed to cleanup.
        stage_reached: Stage,
    },
}

impl StagePayload {
    /// The stage this payload belongs to.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        match self {
            Self::Generation { .. } => Stage::Generation,
            Self::Build { .. } => Stage::Build,
            Self::Deployment { .. } => Stage::Deployment,
            Self::Cleanup { .. } => Stage::Cleanup,
        }
    }
}

/// A message on a stage queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// The job.
    pub job_id: JobId,
    /// The service.
    pub service_name: String,
    /// Attempt of the stage, 1-indexed.
    pub attempt: u32,
    /// Enabled feature flags.
    #[serde(default)]
    pub feature_flags: Vec<String>,
    /// When the message was produced.
    pub requested_at: DateTime<Utc>,
    /// Correlates the whole pipeline run.
    pub correlation_id: Uuid,
    /// Stage-specific fields, including the `stage` tag.
    #[serde(flatten)]
    pub payload: StagePayload,
}

impl QueueMessage {
    /// Builds the message for the job's current stage and attempt.
    ///
    /// Fails if the job has not produced the artifact the stage needs.
    pub fn for_job(job: &JobRecord) -> Result<Self> {
        let missing = || {
            PipelineError::from(ValidationError::new(
                "artifact_ref",
                format!("{} stage requires an artifact", job.stage),
            ))
        };

        let payload = match job.stage {
            Stage::Generation => StagePayload::Generation {
                template_id: job.service.template_id.clone(),
                target_env: job.service.target_env.clone(),
            },
            Stage::Build => StagePayload::Build {
                artifact_ref: job.artifact_ref.clone().ok_or_else(missing)?,
            },
            Stage::Deployment => StagePayload::Deployment {
                artifact_ref: job.artifact_ref.clone().ok_or_else(missing)?,
                target_env: job.service.target_env.clone(),
            },
            Stage::Cleanup => StagePayload::Cleanup {
                artifact_ref: job.artifact_ref.clone(),
                stage_reached: job.failed_stage.unwrap_or(Stage::Generation),
            },
        };

        Ok(Self {
            job_id: job.id,
            service_name: job.service.name.clone(),
            attempt: job.attempt(),
            feature_flags: job.service.feature_flags.iter().cloned().collect(),
            requested_at: Utc::now(),
            correlation_id: job.correlation_id,
            payload,
        })
    }

    /// The stage of the message.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.payload.stage()
    }

    /// The deterministic id of this message.
    #[must_use]
    pub fn message_id(&self) -> MessageId {
        MessageId::derive(&self.service_name, self.correlation_id, self.stage(), self.attempt)
    }

    /// Checks the message at the queue boundary.
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        validate_service_name(&self.service_name)?;
        if self.attempt == 0 {
            return Err(ValidationError::new("attempt", "must be at least 1"));
        }
        match &self.payload {
            StagePayload::Generation { template_id, .. } if template_id.is_empty() => {
                Err(ValidationError::new("template_id", "must not be empty"))
            }
            StagePayload::Build { artifact_ref } | StagePayload::Deployment { artifact_ref, .. }
                if artifact_ref.as_str().is_empty() =>
            {
                Err(ValidationError::new("artifact_ref", "must not be empty"))
            }
            _ => Ok(()),
        }
    }

    /// Decodes and validates a message from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let message: Self = serde_json::from_str(json)?;
        message.validate()?;
        Ok(message)
    }
}

/// Options for enqueueing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Delay before the message becomes visible.
    pub delay: Option<Duration>,
    /// Tie-breaker between messages enqueued at the same time (lower first).
    pub priority: i32,
}

impl EnqueueOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the delay.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sets the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Handle identifying one delivery of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Receipt(pub u64);

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// The message.
    pub message: QueueMessage,
    /// Its deterministic id.
    pub message_id: MessageId,
    /// Delivery handle for ack/nack.
    pub receipt: Receipt,
    /// How many times the message has been delivered, including this one.
    pub delivery_count: u32,
}

/// At-least-once message queue with one logical queue per stage.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueues a message on its stage's queue.
    async fn enqueue(&self, message: QueueMessage, options: EnqueueOptions) -> Result<MessageId>;

    /// Receives the next visible message, waiting up to `wait`.
    ///
    /// The message stays invisible until acked, nacked or its visibility
    /// timeout passes.
    async fn receive(&self, stage: Stage, wait: Duration) -> Result<Option<ReceivedMessage>>;

    /// Removes a delivered message.
    async fn ack(&self, receipt: Receipt) -> Result<()>;

    /// Returns a delivered message to the queue after `delay`.
    async fn nack(&self, receipt: Receipt, delay: Duration) -> Result<()>;

    /// Messages waiting on a stage's queue, delayed ones included.
    async fn depth(&self, stage: Stage) -> Result<usize>;

    /// Releases the broker connection. Later operations may fail.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A received message bound to the queue it came from.
pub struct Delivery {
    received: ReceivedMessage,
    queue: Arc<dyn JobQueue>,
}

impl Delivery {
    /// Wraps a received message.
    #[must_use]
    pub fn new(received: ReceivedMessage, queue: Arc<dyn JobQueue>) -> Self {
        Self { received, queue }
    }

    /// The payload.
    #[must_use]
    pub fn message(&self) -> &QueueMessage {
        &self.received.message
    }

    /// The message id.
    #[must_use]
    pub fn message_id(&self) -> &MessageId {
        &self.received.message_id
    }

    /// How many times this message has been delivered.
    #[must_use]
    pub fn delivery_count(&self) -> u32 {
        self.received.delivery_count
    }

    /// Acknowledges the message.
    pub async fn ack(self) -> Result<()> {
        self.queue.ack(self.received.receipt).await
    }

    /// Returns the message to the queue.
    pub async fn nack(self, delay: Duration) -> Result<()> {
        self.queue.nack(self.received.receipt, delay).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message_id", &self.received.message_id)
            .field("stage", &self.received.message.stage())
            .field("attempt", &self.received.message.attempt)
            .finish_non_exhaustive()
    }
}

/// Turns a stage queue into a stream of deliveries.
///
/// Each poll of the stream blocks in `receive` for up to `wait` at a time
/// and only yields once a message or an error arrives. A consumer that
/// stops polling stops receiving, which is how stage concurrency limits
/// keep surplus jobs queued.
pub fn consume(
    queue: Arc<dyn JobQueue>,
    stage: Stage,
    wait: Duration,
) -> BoxStream<'static, Result<Delivery>> {
    Box::pin(stream::unfold(queue, move |queue| async move {
        loop {
            match queue.receive(stage, wait).await {
                Ok(Some(received)) => {
                    let delivery = Delivery::new(received, queue.clone());
                    return Some((Ok(delivery), queue));
                }
                Ok(None) => {}
                Err(e) => return Some((Err(e), queue)),
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ServiceSpec;
    use futures::StreamExt;

    fn job() -> JobRecord {
        JobRecord::new(ServiceSpec::new("foo-api", "rest-api", "staging", "team-a").with_flags(["redis", "database"]))
    }

    #[test]
    fn test_message_id_is_deterministic() {
        let run = Uuid::now_v7();
        let a = MessageId::derive("foo-api", run, Stage::Build, 2);
        let b = MessageId::derive("foo-api", run, Stage::Build, 2);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);

        assert_ne!(a, MessageId::derive("foo-api", run, Stage::Build, 3));
        assert_ne!(a, MessageId::derive("foo-api", run, Stage::Deployment, 2));
        assert_ne!(a, MessageId::derive("foo-apj", run, Stage::Build, 2));
    }

    #[test]
    fn test_second_run_of_a_service_gets_fresh_message_ids() {
        let first = QueueMessage::for_job(&job()).unwrap();
        let second = QueueMessage::for_job(&job()).unwrap();

        assert_eq!(first.service_name, second.service_name);
        assert_eq!(first.stage(), second.stage());
        assert_eq!(first.attempt, second.attempt);
        assert_ne!(first.message_id(), second.message_id());
    }

    #[test]
    fn test_wire_format() {
        let message = QueueMessage::for_job(&job()).unwrap();
        let json = serde_json::to_value(&message).unwrap();

        assert_eq!(json["stage"], "generation");
        assert_eq!(json["service_name"], "foo-api");
        assert_eq!(json["attempt"], 1);
        assert_eq!(json["feature_flags"], serde_json::json!(["database", "redis"]));
        assert_eq!(json["template_id"], "rest-api");
        assert!(json["requested_at"].is_string());
        assert!(json["correlation_id"].is_string());

        let back = QueueMessage::from_json(&json.to_string()).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_build_message_requires_artifact() {
        let mut job = job();
        job.enter_stage(Stage::Build);
        assert!(QueueMessage::for_job(&job).is_err());

        job.artifact_ref = Some(ArtifactRef::new("workspace://foo-api/abc"));
        let message = QueueMessage::for_job(&job).unwrap();
        assert_eq!(message.stage(), Stage::Build);
    }

    #[test]
    fn test_cleanup_payload_carries_stage_reached() {
        let mut job = job();
        job.failed_stage = Some(Stage::Deployment);
        job.enter_stage(Stage::Cleanup);

        let message = QueueMessage::for_job(&job).unwrap();
        assert_eq!(
            message.payload,
            StagePayload::Cleanup {
                artifact_ref: None,
                stage_reached: Stage::Deployment
            }
        );
    }

    #[test]
    fn test_validate_rejects_bad_messages() {
        let mut message = QueueMessage::for_job(&job()).unwrap();
        message.attempt = 0;
        assert!(message.validate().is_err());

        let json = r#"{"job_id":"0190b3c2-6a2e-7c4e-8a57-0b7b0f6f1a11","service_name":"Bad_Name","attempt":1,
            "requested_at":"2024-01-01T00:00:00Z","correlation_id":"0190b3c2-6a2e-7c4e-8a57-0b7b0f6f1a12",
            "stage":"build","artifact_ref":"x"}"#;
        assert!(matches!(
            QueueMessage::from_json(json),
            Err(PipelineError::Validation(_))
        ));

        let unknown_stage = json.replace("\"build\"", "\"publish\"").replace("Bad_Name", "foo-api");
        assert!(QueueMessage::from_json(&unknown_stage).is_err());
    }

    #[tokio::test]
    async fn test_consume_yields_deliveries() {
        let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::new(Duration::from_secs(30)));
        let message = QueueMessage::for_job(&job()).unwrap();
        queue.enqueue(message.clone(), EnqueueOptions::new()).await.unwrap();

        let mut deliveries = consume(queue.clone(), Stage::Generation, Duration::from_millis(10));
        let delivery = deliveries.next().await.unwrap().unwrap();
        assert_eq!(delivery.message(), &message);
        assert_eq!(delivery.delivery_count(), 1);
        delivery.ack().await.unwrap();

        assert_eq!(queue.depth(Stage::Generation).await.unwrap(), 0);
    }
}
