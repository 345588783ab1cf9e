use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::{EnqueueOptions, JobQueue, MessageId, QueueMessage, Receipt, ReceivedMessage};
use crate::core::Stage;
use crate::errors::{PipelineError, Result};

/// Opens a broker connection.
pub type Connector = Box<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn JobQueue>>> + Send + Sync>;

/// Process-wide broker handle.
///
/// The connection is opened on first use, shared by every caller after
/// that, and released with [`QueueConnection::shutdown`], which closes the
/// underlying queue. A failed open is not cached, so the next caller tries
/// again.
pub struct QueueConnection {
    connector: Connector,
    slot: RwLock<Option<Arc<dyn JobQueue>>>,
    closed: AtomicBool,
}

impl QueueConnection {
    /// Creates an unopened handle.
    #[must_use]
    pub fn new(connector: Connector) -> Self {
        Self {
            connector,
            slot: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Creates a handle that opens an existing queue.
    #[must_use]
    pub fn from_queue(queue: Arc<dyn JobQueue>) -> Self {
        Self::new(Box::new(move || {
            let queue = queue.clone();
            Box::pin(async move { Ok(queue) })
        }))
    }

    fn closed_error() -> PipelineError {
        PipelineError::QueueUnavailable("connection closed".to_string())
    }

    /// Returns the shared connection, opening it if needed.
    pub async fn get(&self) -> Result<Arc<dyn JobQueue>> {
        if self.is_closed() {
            return Err(Self::closed_error());
        }
        if let Some(queue) = self.slot.read().await.as_ref() {
            return Ok(queue.clone());
        }

        let mut slot = self.slot.write().await;
        if self.is_closed() {
            return Err(Self::closed_error());
        }
        if let Some(queue) = slot.as_ref() {
            return Ok(queue.clone());
        }
        tracing::info!("Opening queue connection");
        let queue = (self.connector)().await?;
        *slot = Some(queue.clone());
        Ok(queue)
    }

    /// Returns true while an opened connection is held.
    pub async fn is_open(&self) -> bool {
        !self.is_closed() && self.slot.read().await.is_some()
    }

    /// Returns true after shutdown.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Releases the connection. Later operations fail with `QueueUnavailable`.
    ///
    /// Safe to call more than once; only the first call closes the queue.
    pub async fn shutdown(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let Some(queue) = self.slot.write().await.take() else {
            return Ok(());
        };
        queue.close().await?;
        tracing::info!("Queue connection closed");
        Ok(())
    }
}

impl std::fmt::Debug for QueueConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConnection")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl JobQueue for QueueConnection {
    async fn enqueue(&self, message: QueueMessage, options: EnqueueOptions) -> Result<MessageId> {
        self.get().await?.enqueue(message, options).await
    }

    async fn receive(&self, stage: Stage, wait: Duration) -> Result<Option<ReceivedMessage>> {
        self.get().await?.receive(stage, wait).await
    }

    async fn ack(&self, receipt: Receipt) -> Result<()> {
        self.get().await?.ack(receipt).await
    }

    async fn nack(&self, receipt: Receipt, delay: Duration) -> Result<()> {
        self.get().await?.nack(receipt, delay).await
    }

    async fn depth(&self, stage: Stage) -> Result<usize> {
        self.get().await?.depth(stage).await
    }

    async fn close(&self) -> Result<()> {
        self.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryJobQueue;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_opens_once() {
        let opened = Arc::new(AtomicU32::new(0));
        let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::default());
        let connection = {
            let opened = opened.clone();
            QueueConnection::new(Box::new(move || {
                opened.fetch_add(1, Ordering::SeqCst);
                let queue = queue.clone();
                Box::pin(async move { Ok(queue) })
            }))
        };

        assert!(!connection.is_open().await);
        connection.depth(Stage::Build).await.unwrap();
        connection.depth(Stage::Cleanup).await.unwrap();
        assert!(connection.is_open().await);
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_open_is_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let connection = {
            let attempts = attempts.clone();
            QueueConnection::new(Box::new(move || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    if n == 0 {
                        Err(PipelineError::QueueUnavailable("refused".to_string()))
                    } else {
                        Ok(Arc::new(InMemoryJobQueue::default()) as Arc<dyn JobQueue>)
                    }
                })
            }))
        };

        assert!(connection.get().await.is_err());
        assert!(connection.get().await.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_closes_underlying_queue() {
        let broker = Arc::new(InMemoryJobQueue::default());
        let connection = QueueConnection::from_queue(broker.clone());
        connection.depth(Stage::Generation).await.unwrap();

        connection.shutdown().await.unwrap();
        assert!(connection.is_closed());
        assert!(!connection.is_open().await);
        assert!(broker.is_closed());

        let err = connection.depth(Stage::Generation).await.unwrap_err();
        assert!(matches!(err, PipelineError::QueueUnavailable(_)));
        connection.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_before_open_never_connects() {
        let opened = Arc::new(AtomicU32::new(0));
        let connection = {
            let opened = opened.clone();
            QueueConnection::new(Box::new(move || {
                opened.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(Arc::new(InMemoryJobQueue::default()) as Arc<dyn JobQueue>) })
            }))
        };

        connection.shutdown().await.unwrap();
        assert!(connection.get().await.is_err());
        assert_eq!(opened.load(Ordering::SeqCst), 0);
    }
}
