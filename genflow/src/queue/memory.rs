//! In-memory job queue.
//!
//! Supports visibility timeouts, delayed messages, nack with delay and an
//! availability switch that makes every operation fail with
//! `QueueUnavailable`, which is how broker loss is simulated in tests.
//!
//! Messages on a stage queue are handed out FIFO by the millisecond at which
//! they became visible, ties broken by priority (lower first) and then by
//! enqueue order. Time is read from `tokio::time`, so paused-clock tests
//! are deterministic.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{EnqueueOptions, JobQueue, MessageId, QueueMessage, Receipt, ReceivedMessage};
use crate::core::Stage;
use crate::errors::{PipelineError, Result};

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    message_id: MessageId,
    message: QueueMessage,
    priority: i32,
    visible_at: Instant,
    delivery_count: u32,
}

#[derive(Debug)]
struct InFlight {
    entry: Entry,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: HashMap<Stage, Vec<Entry>>,
    in_flight: HashMap<u64, InFlight>,
    next_seq: u64,
    next_receipt: u64,
    available: bool,
    closed: bool,
}

/// In-memory, single-process job queue.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    visibility_timeout: Duration,
    epoch: Instant,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl InMemoryJobQueue {
    /// Creates a queue with the given visibility timeout.
    #[must_use]
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                available: true,
                ..QueueState::default()
            }),
            notify: Notify::new(),
            visibility_timeout,
            epoch: Instant::now(),
        }
    }

    /// Simulates broker loss (`false`) and recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
        if available {
            self.notify.notify_waiters();
        }
    }

    /// Returns true if the broker is reachable.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.state.lock().available
    }

    /// Returns true once the queue has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of messages currently held by consumers.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Snapshot of the messages waiting on a stage, in delivery order.
    #[must_use]
    pub fn pending_messages(&self, stage: Stage) -> Vec<QueueMessage> {
        let state = self.state.lock();
        let mut entries: Vec<&Entry> = state
            .pending
            .get(&stage)
            .map(|entries| entries.iter().collect())
            .unwrap_or_default();
        entries.sort_by_key(|entry| self.order_key(entry));
        entries.into_iter().map(|entry| entry.message.clone()).collect()
    }

    fn order_key(&self, entry: &Entry) -> (u128, i32, u64) {
        let visible_ms = entry
            .visible_at
            .saturating_duration_since(self.epoch)
            .as_millis();
        (visible_ms, entry.priority, entry.seq)
    }

    fn check_available(state: &QueueState) -> Result<()> {
        if state.closed {
            Err(PipelineError::QueueUnavailable("queue closed".to_string()))
        } else if state.available {
            Ok(())
        } else {
            Err(PipelineError::QueueUnavailable("broker unreachable".to_string()))
        }
    }

    /// Moves in-flight messages whose visibility timeout passed back to
    /// their queue.
    fn reclaim_expired(state: &mut QueueState, now: Instant) -> bool {
        let expired: Vec<u64> = state
            .in_flight
            .iter()
            .filter(|(_, held)| held.deadline <= now)
            .map(|(receipt, _)| *receipt)
            .collect();

        for receipt in &expired {
            if let Some(held) = state.in_flight.remove(receipt) {
                tracing::debug!(
                    message_id = %held.entry.message_id,
                    "Visibility timeout passed, message will be redelivered"
                );
                let mut entry = held.entry;
                entry.visible_at = now;
                state.pending.entry(entry.message.stage()).or_default().push(entry);
            }
        }
        !expired.is_empty()
    }

    fn try_take(&self, state: &mut QueueState, stage: Stage, now: Instant) -> Option<ReceivedMessage> {
        let entries = state.pending.get_mut(&stage)?;
        let index = entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.visible_at <= now)
            .min_by_key(|(_, entry)| self.order_key(entry))
            .map(|(index, _)| index)?;

        let mut entry = entries.swap_remove(index);
        entry.delivery_count += 1;

        state.next_receipt += 1;
        let receipt = state.next_receipt;
        let received = ReceivedMessage {
            message: entry.message.clone(),
            message_id: entry.message_id.clone(),
            receipt: Receipt(receipt),
            delivery_count: entry.delivery_count,
        };
        state.in_flight.insert(
            receipt,
            InFlight {
                entry,
                deadline: now + self.visibility_timeout,
            },
        );
        Some(received)
    }

    /// Earliest instant at which something may become receivable.
    fn next_wakeup(state: &QueueState, stage: Stage) -> Option<Instant> {
        let delayed = state
            .pending
            .get(&stage)
            .and_then(|entries| entries.iter().map(|entry| entry.visible_at).min());
        let reclaim = state.in_flight.values().map(|held| held.deadline).min();
        match (delayed, reclaim) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, message: QueueMessage, options: EnqueueOptions) -> Result<MessageId> {
        let message_id = message.message_id();
        {
            let mut state = self.state.lock();
            Self::check_available(&state)?;

            state.next_seq += 1;
            let entry = Entry {
                seq: state.next_seq,
                message_id: message_id.clone(),
                priority: options.priority,
                visible_at: Instant::now() + options.delay.unwrap_or(Duration::ZERO),
                delivery_count: 0,
                message,
            };
            state.pending.entry(entry.message.stage()).or_default().push(entry);
        }
        self.notify.notify_waiters();
        Ok(message_id)
    }

    async fn receive(&self, stage: Stage, wait: Duration) -> Result<Option<ReceivedMessage>> {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.notify.notified();
            let now = Instant::now();

            let wakeup = {
                let mut state = self.state.lock();
                Self::check_available(&state)?;
                Self::reclaim_expired(&mut state, now);
                if let Some(received) = self.try_take(&mut state, stage, now) {
                    return Ok(Some(received));
                }
                Self::next_wakeup(&state, stage)
            };

            if now >= deadline {
                return Ok(None);
            }
            let until = wakeup.map_or(deadline, |at| at.min(deadline)).max(now);
            // Either a notification or the timer ends the wait; both re-check.
            let _ = tokio::time::timeout_at(until, notified).await;
        }
    }

    async fn ack(&self, receipt: Receipt) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        if state.in_flight.remove(&receipt.0).is_none() {
            tracing::debug!(receipt = receipt.0, "Ack for unknown or expired receipt");
        }
        Ok(())
    }

    async fn nack(&self, receipt: Receipt, delay: Duration) -> Result<()> {
        {
            let mut state = self.state.lock();
            Self::check_available(&state)?;
            let Some(held) = state.in_flight.remove(&receipt.0) else {
                tracing::debug!(receipt = receipt.0, "Nack for unknown or expired receipt");
                return Ok(());
            };
            let mut entry = held.entry;
            entry.visible_at = Instant::now() + delay;
            state.pending.entry(entry.message.stage()).or_default().push(entry);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn depth(&self, stage: Stage) -> Result<usize> {
        let state = self.state.lock();
        Self::check_available(&state)?;
        Ok(state.pending.get(&stage).map_or(0, Vec::len))
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{JobRecord, ServiceSpec};

    fn message(name: &str) -> QueueMessage {
        let job = JobRecord::new(ServiceSpec::new(name, "rest-api", "staging", "team-a"));
        QueueMessage::for_job(&job).unwrap()
    }

    async fn receive_now(queue: &InMemoryJobQueue) -> Option<ReceivedMessage> {
        queue.receive(Stage::Generation, Duration::ZERO).await.unwrap()
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = InMemoryJobQueue::default();
        for name in ["svc-one", "svc-two", "svc-three"] {
            queue.enqueue(message(name), EnqueueOptions::new()).await.unwrap();
        }

        let mut order = Vec::new();
        while let Some(received) = receive_now(&queue).await {
            order.push(received.message.service_name.clone());
        }
        assert_eq!(order, vec!["svc-one", "svc-two", "svc-three"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_breaks_ties() {
        let queue = InMemoryJobQueue::default();
        queue.enqueue(message("low-prio"), EnqueueOptions::new().with_priority(5)).await.unwrap();
        queue.enqueue(message("high-prio"), EnqueueOptions::new().with_priority(-1)).await.unwrap();

        let first = receive_now(&queue).await.unwrap();
        assert_eq!(first.message.service_name, "high-prio");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_message() {
        let queue = InMemoryJobQueue::default();
        queue
            .enqueue(message("later"), EnqueueOptions::new().with_delay(Duration::from_secs(5)))
            .await
            .unwrap();

        assert!(receive_now(&queue).await.is_none());
        assert_eq!(queue.depth(Stage::Generation).await.unwrap(), 1);

        let received = queue
            .receive(Stage::Generation, Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.message.service_name, "later");
    }

    #[tokio::test(start_paused = true)]
    async fn test_visibility_timeout_redelivers() {
        let queue = InMemoryJobQueue::new(Duration::from_secs(2));
        queue.enqueue(message("crashy"), EnqueueOptions::new()).await.unwrap();

        let first = receive_now(&queue).await.unwrap();
        assert_eq!(first.delivery_count, 1);
        assert!(receive_now(&queue).await.is_none());
        assert_eq!(queue.in_flight(), 1);

        tokio::time::advance(Duration::from_secs(3)).await;

        let second = receive_now(&queue).await.unwrap();
        assert_eq!(second.delivery_count, 2);
        assert_eq!(second.message_id, first.message_id);

        // The stale receipt no longer refers to anything.
        queue.ack(first.receipt).await.unwrap();
        assert_eq!(queue.in_flight(), 1);
        queue.ack(second.receipt).await.unwrap();
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nack_with_delay() {
        let queue = InMemoryJobQueue::default();
        queue.enqueue(message("again"), EnqueueOptions::new()).await.unwrap();

        let received = receive_now(&queue).await.unwrap();
        queue.nack(received.receipt, Duration::from_secs(1)).await.unwrap();
        assert!(receive_now(&queue).await.is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        let again = receive_now(&queue).await.unwrap();
        assert_eq!(again.delivery_count, 2);
    }

    #[tokio::test]
    async fn test_blocking_receive_wakes_on_enqueue() {
        let queue = std::sync::Arc::new(InMemoryJobQueue::default());
        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive(Stage::Generation, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(message("wake-up"), EnqueueOptions::new()).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), receiver)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(received.message.service_name, "wake-up");
    }

    #[tokio::test]
    async fn test_stages_are_separate() {
        let queue = InMemoryJobQueue::default();
        queue.enqueue(message("gen-only"), EnqueueOptions::new()).await.unwrap();

        assert!(queue.receive(Stage::Build, Duration::ZERO).await.unwrap().is_none());
        assert!(receive_now(&queue).await.is_some());
    }

    #[tokio::test]
    async fn test_unavailable() {
        let queue = InMemoryJobQueue::default();
        queue.set_available(false);

        let err = queue.enqueue(message("nope"), EnqueueOptions::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::QueueUnavailable(_)));
        assert!(queue.receive(Stage::Generation, Duration::ZERO).await.is_err());

        queue.set_available(true);
        assert!(queue.enqueue(message("yes"), EnqueueOptions::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_fails_later_operations() {
        let queue = InMemoryJobQueue::default();
        queue.enqueue(message("svc-a"), EnqueueOptions::new()).await.unwrap();

        queue.close().await.unwrap();
        assert!(queue.is_closed());
        assert!(queue.depth(Stage::Generation).await.is_err());

        queue.set_available(true);
        let err = queue.enqueue(message("svc-b"), EnqueueOptions::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::QueueUnavailable(_)));
    }
}
