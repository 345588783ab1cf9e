use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::{EnqueueOptions, JobQueue, MessageId, QueueMessage, Receipt, ReceivedMessage};
use crate::core::Stage;
use crate::errors::{PipelineError, Result};
use crate::retry::{with_retry, RetryPolicy};

fn is_unavailable(error: &PipelineError) -> bool {
    matches!(error, PipelineError::QueueUnavailable(_))
}

/// Wraps a queue and retries operations that fail with `QueueUnavailable`,
/// using bounded exponential backoff. Once the budget is spent the error
/// is surfaced to the caller. Other errors pass through untouched.
pub struct ReconnectingQueue {
    inner: Arc<dyn JobQueue>,
    policy: RetryPolicy,
}

impl ReconnectingQueue {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn JobQueue>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// The reconnect policy.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl std::fmt::Debug for ReconnectingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectingQueue")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl JobQueue for ReconnectingQueue {
    async fn enqueue(&self, message: QueueMessage, options: EnqueueOptions) -> Result<MessageId> {
        with_retry(&self.policy, "queue.enqueue", is_unavailable, || {
            self.inner.enqueue(message.clone(), options)
        })
        .await
    }

    async fn receive(&self, stage: Stage, wait: Duration) -> Result<Option<ReceivedMessage>> {
        with_retry(&self.policy, "queue.receive", is_unavailable, || {
            self.inner.receive(stage, wait)
        })
        .await
    }

    async fn ack(&self, receipt: Receipt) -> Result<()> {
        with_retry(&self.policy, "queue.ack", is_unavailable, || self.inner.ack(receipt)).await
    }

    async fn nack(&self, receipt: Receipt, delay: Duration) -> Result<()> {
        with_retry(&self.policy, "queue.nack", is_unavailable, || {
            self.inner.nack(receipt, delay)
        })
        .await
    }

    async fn depth(&self, stage: Stage) -> Result<usize> {
        with_retry(&self.policy, "queue.depth", is_unavailable, || self.inner.depth(stage)).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
