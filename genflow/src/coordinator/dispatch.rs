//! Per-stage dispatch loops.

use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

use super::transitions::{activate, apply_outcome, decide_delivery, DeliveryAction, Transition};
use super::Inner;
use crate::core::{JobRecord, PipelineOutcome, Stage};
use crate::errors::{PipelineError, Result};
use crate::events::{EventType, PipelineEvent};
use crate::queue::{consume, Delivery, EnqueueOptions, QueueMessage};
use crate::store::{collect_garbage, WriteResult};
use crate::telemetry::stage_span;
use crate::workers::{WorkContext, WorkOutcome};

/// Attempts at storing a stage result before giving up on the delivery.
const MAX_COMMIT_ATTEMPTS: usize = 16;

/// What to do with a message once it has been handled.
#[derive(Debug)]
enum Disposition {
    Ack,
    Requeue(Duration),
}

/// Receives and runs one stage's messages until shutdown.
///
/// A permit is taken before each receive, so the stage never holds more
/// messages than its concurrency limit.
pub(super) async fn run_stage(inner: Arc<Inner>, stage: Stage, mut shutdown: watch::Receiver<bool>) {
    let gate = match inner.gate(stage) {
        Ok(gate) => gate.clone(),
        Err(e) => {
            tracing::error!(stage = %stage, error = %e, "Dispatcher not started");
            return;
        }
    };
    let poll_interval = inner.config.queue.poll_interval();
    let mut deliveries = consume(inner.queue.clone(), stage, poll_interval);
    let mut running = JoinSet::new();

    tracing::debug!(stage = %stage, limit = gate.limit(), "Dispatcher started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let permit = tokio::select! {
            _ = shutdown.changed() => break,
            permit = gate.acquire() => match permit {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::warn!(stage = %stage, error = %e, "Gate closed");
                    break;
                }
            },
        };

        let next = tokio::select! {
            _ = shutdown.changed() => break,
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                running.spawn(handle(inner.clone(), delivery, permit));
            }
            Some(Err(e)) => {
                drop(permit);
                tracing::warn!(stage = %stage, error = %e, "Receive failed");
                tokio::time::sleep(poll_interval).await;
            }
            None => break,
        }

        while running.try_join_next().is_some() {}
    }

    while running.join_next().await.is_some() {}
    tracing::debug!(stage = %stage, "Dispatcher stopped");
}

/// Periodically re-enqueues jobs left waiting without a message.
///
/// Runs once at start, then every visibility timeout. Only jobs idle for a
/// full period are touched; a duplicate for a job whose message is still
/// queued is dropped as stale by the dispatcher.
pub(super) async fn run_resume_sweep(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let period = inner.config.queue.visibility_timeout();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = inner.resume(Some(period)).await {
            tracing::warn!(error = %e, "Resume sweep failed");
        }
    }
}

async fn handle(inner: Arc<Inner>, delivery: Delivery, _permit: OwnedSemaphorePermit) {
    let message = delivery.message().clone();

    if let Err(e) = message.validate() {
        tracing::warn!(
            message_id = %delivery.message_id(),
            error = %e,
            "Dropping malformed message"
        );
        if let Err(e) = delivery.ack().await {
            tracing::warn!(error = %e, "Ack failed");
        }
        return;
    }

    let settled = match process(&inner, &message).await {
        Ok(Disposition::Ack) => delivery.ack().await,
        Ok(Disposition::Requeue(delay)) => delivery.nack(delay).await,
        Err(e) => {
            tracing::warn!(
                job_id = %message.job_id,
                stage = %message.stage(),
                attempt = message.attempt,
                error = %e,
                "Delivery failed, returning it to the queue"
            );
            delivery.nack(inner.config.queue.poll_interval()).await
        }
    };

    if let Err(e) = settled {
        tracing::warn!(job_id = %message.job_id, error = %e, "Could not settle delivery");
    }
}

async fn process(inner: &Inner, message: &QueueMessage) -> Result<Disposition> {
    let Some(job) = inner.store.get(message.job_id).await? else {
        tracing::debug!(job_id = %message.job_id, "Message for unknown job");
        return Ok(Disposition::Ack);
    };

    match decide_delivery(&job, message, Utc::now(), &inner.config) {
        DeliveryAction::Drop => {
            tracing::warn!(
                job_id = %job.id,
                stage = %message.stage(),
                attempt = message.attempt,
                "Dropping stale delivery"
            );
            Ok(Disposition::Ack)
        }
        DeliveryAction::Requeue(delay) => Ok(Disposition::Requeue(delay)),
        DeliveryAction::Expire => {
            tracing::warn!(job_id = %job.id, stage = %job.stage, "Lease expired");
            let outcome = WorkOutcome::Failure(PipelineError::transient("worker lease expired"));
            settle(inner, job, &outcome).await
        }
        DeliveryAction::Cancel => {
            let outcome = WorkOutcome::Cancelled("cancel requested".to_string());
            settle(inner, job, &outcome).await
        }
        DeliveryAction::TimeOut { elapsed } => {
            let outcome = WorkOutcome::Failure(PipelineError::PipelineTimeout {
                elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                limit_ms: inner.config.pipeline_timeout_ms,
            });
            settle(inner, job, &outcome).await
        }
        DeliveryAction::Activate => run(inner, job).await,
    }
}

/// Applies an outcome nobody ran a worker for.
async fn settle(inner: &Inner, job: JobRecord, outcome: &WorkOutcome) -> Result<Disposition> {
    let expected = job.version;
    let transition = apply_outcome(job, outcome, &inner.config, inner.classifier.as_ref(), Utc::now())?;

    match inner.store.update(transition.record.clone(), expected).await? {
        WriteResult::Success { .. } => {
            finish(inner, transition).await;
            Ok(Disposition::Ack)
        }
        WriteResult::PreconditionFailed { .. } => Ok(Disposition::Requeue(Duration::ZERO)),
    }
}

async fn run(inner: &Inner, job: JobRecord) -> Result<Disposition> {
    let stage = job.stage;
    let worker = inner
        .workers
        .get(&stage)
        .cloned()
        .ok_or_else(|| PipelineError::Config(format!("no worker for the {stage} stage")))?;

    let expected = job.version;
    let mut active = job;
    activate(&mut active, Utc::now(), &inner.config);
    match inner.store.update(active.clone(), expected).await? {
        WriteResult::Success { version } => active.version = version,
        WriteResult::PreconditionFailed { .. } => return Ok(Disposition::Requeue(Duration::ZERO)),
    }

    let attempt = active.attempt();
    inner
        .emit(PipelineEvent::new(
            EventType::StageActivated,
            active.id,
            active.service.name.clone(),
            stage,
            attempt,
        ))
        .await;

    let span = stage_span(active.id, &active.service.name, stage, attempt);
    let ctx = WorkContext::new(inner.cancellations.token(active.id), inner.config.stage(stage).timeout());
    let outcome = async {
        tracing::info!("Stage started");
        let outcome = worker.execute(&active, &ctx).await;
        match &outcome {
            WorkOutcome::Success { .. } => tracing::info!("Stage completed"),
            WorkOutcome::Failure(e) => tracing::warn!(error = %e, "Stage failed"),
            WorkOutcome::Cancelled(reason) => tracing::info!(reason = %reason, "Stage cancelled"),
        }
        outcome
    }
    .instrument(span)
    .await;

    commit(inner, active, &outcome).await
}

/// Stores the result of an attempt, re-reading the job on version conflicts.
///
/// The result is discarded when the attempt has been superseded, i.e. the
/// job moved on, lost its lease or finished while the worker ran.
async fn commit(inner: &Inner, active: JobRecord, outcome: &WorkOutcome) -> Result<Disposition> {
    let (job_id, stage, attempt) = (active.id, active.stage, active.attempt());
    let mut current = active;

    for _ in 0..MAX_COMMIT_ATTEMPTS {
        let expected = current.version;
        let transition = apply_outcome(
            current.clone(),
            outcome,
            &inner.config,
            inner.classifier.as_ref(),
            Utc::now(),
        )?;

        match inner.store.update(transition.record.clone(), expected).await? {
            WriteResult::Success { .. } => {
                finish(inner, transition).await;
                return Ok(Disposition::Ack);
            }
            WriteResult::PreconditionFailed { current: actual } => {
                tracing::debug!(job_id = %job_id, expected, actual, "Version conflict, re-reading job");
                let Some(latest) = inner.store.get(job_id).await? else {
                    return Ok(Disposition::Ack);
                };
                let superseded = latest.stage != stage
                    || latest.attempt() != attempt
                    || !latest.is_held()
                    || latest.outcome.is_terminal();
                if superseded {
                    tracing::warn!(
                        job_id = %job_id,
                        stage = %stage,
                        attempt,
                        result = outcome.label(),
                        "Discarding result of a superseded attempt"
                    );
                    return Ok(Disposition::Ack);
                }
                current = latest;
            }
        }
    }

    Err(PipelineError::VersionConflict {
        job_id,
        expected: current.version,
        actual: current.version + 1,
    })
}

/// Side effects of a stored transition.
async fn finish(inner: &Inner, transition: Transition) {
    let Transition {
        record,
        follow_up,
        events,
    } = transition;

    for event in &events {
        inner.events.emit(event).await;
    }

    if let Some(follow_up) = follow_up {
        let mut options = EnqueueOptions::new().with_priority(record.priority);
        if let Some(delay) = follow_up.delay {
            options = options.with_delay(delay);
        }
        let stage = follow_up.message.stage();
        if let Some(delay) = follow_up.delay {
            tracing::warn!(
                job_id = %record.id,
                stage = %stage,
                attempt = follow_up.message.attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Retry scheduled"
            );
        }
        if let Err(e) = inner.queue.enqueue(follow_up.message, options).await {
            tracing::warn!(
                job_id = %record.id,
                stage = %stage,
                error = %e,
                "Could not enqueue next stage, job waits for resume"
            );
        }
    }

    if record.outcome == PipelineOutcome::FailedCleanup {
        tracing::error!(
            job_id = %record.id,
            service = %record.service.name,
            error = ?record.last_error,
            "Cleanup failed, manual intervention required"
        );
    } else if record.outcome.is_terminal() {
        tracing::info!(
            job_id = %record.id,
            service = %record.service.name,
            outcome = %record.outcome,
            "Pipeline finished"
        );
    }

    if record.outcome.is_terminal() {
        inner.cancellations.remove(record.id);
        match collect_garbage(inner.store.as_ref(), &inner.config.retention).await {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(removed, "Removed finished jobs past retention"),
            Err(e) => tracing::warn!(error = %e, "Retention sweep failed"),
        }
        inner.outcomes.notify_waiters();
    }
}
