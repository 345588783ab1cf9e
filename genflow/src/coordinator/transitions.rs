//! The job state machine as pure functions.
//!
//! [`decide_delivery`] looks at a delivered message and the stored record
//! and says what to do with it. [`apply_outcome`] takes the record and the
//! result of a stage and produces the next record, the follow-up message
//! and the events to emit. Neither touches the store or the queue.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::config::PipelineConfig;
use crate::core::{JobRecord, JobStatus, PipelineOutcome, Stage};
use crate::errors::{ErrorClassifier, JobError, PipelineError, Result};
use crate::events::{EventType, PipelineEvent};
use crate::queue::QueueMessage;
use crate::retry::RetryDecision;
use crate::workers::WorkOutcome;

/// What to do with a delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryAction {
    /// The message is a duplicate or refers to an attempt that is over.
    Drop,
    /// Another worker holds the job, or the attempt is not due yet.
    Requeue(Duration),
    /// The holder's lease ran out; fail the attempt.
    Expire,
    /// Cancellation was requested; route to cleanup without running.
    Cancel,
    /// The job outlived the pipeline timeout.
    TimeOut {
        /// Age of the job.
        elapsed: Duration,
    },
    /// Run the stage.
    Activate,
}

/// Decides how to handle `message` given the stored `record`.
#[must_use]
pub fn decide_delivery(
    record: &JobRecord,
    message: &QueueMessage,
    now: DateTime<Utc>,
    config: &PipelineConfig,
) -> DeliveryAction {
    let stale = record.outcome.is_terminal()
        || record.status.is_terminal()
        || message.stage() != record.stage
        || message.attempt != record.attempt();
    if stale {
        return DeliveryAction::Drop;
    }

    if let Some(lease) = record.lease_expires_at {
        if lease > now {
            return DeliveryAction::Requeue(until(lease, now));
        }
        return DeliveryAction::Expire;
    }

    if record.cancel_requested && record.stage != Stage::Cleanup {
        return DeliveryAction::Cancel;
    }

    if record.status == JobStatus::Retrying {
        if let Some(due) = record.retry_at.filter(|due| *due > now) {
            return DeliveryAction::Requeue(until(due, now));
        }
    }

    if record.stage != Stage::Cleanup {
        let elapsed = until(now, record.created_at);
        if elapsed > config.pipeline_timeout() {
            return DeliveryAction::TimeOut { elapsed };
        }
    }

    DeliveryAction::Activate
}

fn until(later: DateTime<Utc>, earlier: DateTime<Utc>) -> Duration {
    (later - earlier).to_std().unwrap_or(Duration::ZERO)
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Moves a record into `Active` and takes the lease.
pub fn activate(record: &mut JobRecord, now: DateTime<Utc>, config: &PipelineConfig) {
    if record.status == JobStatus::Retrying {
        record.record(JobStatus::Queued, None);
    }
    record.retry_at = None;
    let hold = config.stage(record.stage).timeout() + config.queue.visibility_timeout();
    record.lease_expires_at = Some(after(now, hold));
    record.record(JobStatus::Active, None);
}

/// A message to enqueue after the transition is stored.
#[derive(Debug, Clone)]
pub struct FollowUp {
    /// The message.
    pub message: QueueMessage,
    /// Delay before it becomes visible.
    pub delay: Option<Duration>,
}

/// The result of applying a stage outcome.
#[derive(Debug, Clone)]
pub struct Transition {
    /// The record to store.
    pub record: JobRecord,
    /// Next message, if the pipeline continues.
    pub follow_up: Option<FollowUp>,
    /// Events to emit once stored.
    pub events: Vec<PipelineEvent>,
}

impl Transition {
    /// Returns true if the pipeline reached its final outcome.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.record.outcome.is_terminal()
    }
}

struct Builder {
    record: JobRecord,
    follow_up: Option<FollowUp>,
    events: Vec<PipelineEvent>,
}

impl Builder {
    fn event(&mut self, event_type: EventType, detail: Option<String>) {
        let mut event = PipelineEvent::new(
            event_type,
            self.record.id,
            self.record.service.name.clone(),
            self.record.stage,
            self.record.attempt(),
        );
        if let Some(detail) = detail {
            event = event.with_detail(detail);
        }
        self.events.push(event);
    }

    fn follow(&mut self, delay: Option<Duration>) -> Result<()> {
        self.follow_up = Some(FollowUp {
            message: QueueMessage::for_job(&self.record)?,
            delay,
        });
        Ok(())
    }

    /// Leaves the current stage for cleanup.
    fn route_to_cleanup(&mut self) -> Result<()> {
        self.record.failed_stage = Some(self.record.stage);
        self.record.enter_stage(Stage::Cleanup);
        self.follow(None)
    }

    fn finish(&mut self, outcome: PipelineOutcome) {
        self.record.outcome = outcome;
        let event_type = match outcome {
            PipelineOutcome::Deployed => EventType::PipelineDeployed,
            PipelineOutcome::Cancelled => EventType::PipelineCancelled,
            PipelineOutcome::FailedCleanup => EventType::PipelineFailedCleanup,
            PipelineOutcome::Failed | PipelineOutcome::Running => EventType::PipelineFailed,
        };
        let detail = self.record.last_error.as_ref().map(ToString::to_string);
        self.event(event_type, detail);
    }

    fn build(self) -> Transition {
        Transition {
            record: self.record,
            follow_up: self.follow_up,
            events: self.events,
        }
    }
}

/// Applies the result of a stage attempt to `record`.
///
/// - success moves to the next stage, or to `Deployed` after deployment;
///   a success that lands after a cancel request goes to cleanup instead
/// - a cancelled attempt goes to cleanup
/// - a retryable failure with budget left schedules the next attempt
/// - any other failure goes to cleanup, or ends in `FailedCleanup` when
///   cleanup itself failed
pub fn apply_outcome(
    record: JobRecord,
    outcome: &WorkOutcome,
    config: &PipelineConfig,
    classifier: &dyn ErrorClassifier,
    now: DateTime<Utc>,
) -> Result<Transition> {
    let mut t = Builder {
        record,
        follow_up: None,
        events: Vec::new(),
    };
    t.record.lease_expires_at = None;
    let stage = t.record.stage;

    match outcome {
        WorkOutcome::Success { artifact_ref, checksum } => {
            if artifact_ref.is_some() {
                t.record.artifact_ref.clone_from(artifact_ref);
            }
            if checksum.is_some() {
                t.record.checksum.clone_from(checksum);
            }
            t.record.record(JobStatus::Completed, None);
            t.event(EventType::StageCompleted, None);

            if stage == Stage::Cleanup {
                let outcome = if t.record.cancel_requested {
                    PipelineOutcome::Cancelled
                } else {
                    PipelineOutcome::Failed
                };
                t.finish(outcome);
            } else if t.record.cancel_requested {
                t.route_to_cleanup()?;
            } else if let Some(next) = stage.next() {
                t.record.enter_stage(next);
                t.follow(None)?;
            } else {
                t.finish(PipelineOutcome::Deployed);
            }
        }

        WorkOutcome::Cancelled(reason) => {
            if stage == Stage::Cleanup {
                let error = PipelineError::Cancelled(reason.clone());
                fail_terminally(&mut t, &error, classifier);
            } else {
                t.record.record(JobStatus::Cancelled, Some(reason.clone()));
                t.event(EventType::StageCancelled, Some(reason.clone()));
                t.route_to_cleanup()?;
            }
        }

        WorkOutcome::Failure(error) => {
            let class = classifier.classify(error);
            let attempt = t.record.attempt();
            t.record.last_error = Some(JobError::from_error(error, class, stage, attempt));
            let message = error.to_string();

            match config.stage(stage).retry.decide(attempt, class) {
                RetryDecision::Retry { next_attempt, delay } => {
                    if t.record.cancel_requested && stage != Stage::Cleanup {
                        t.record.record(JobStatus::Failed, Some(message.clone()));
                        t.event(EventType::StageFailed, Some(message));
                        t.route_to_cleanup()?;
                    } else {
                        t.record.attempts.insert(stage, next_attempt);
                        t.record.retry_at = Some(after(now, delay));
                        t.record.record(JobStatus::Retrying, Some(message.clone()));
                        t.event(EventType::StageRetrying, Some(message));
                        t.follow(Some(delay))?;
                    }
                }
                RetryDecision::GiveUp | RetryDecision::NotRetryable => {
                    fail_terminally(&mut t, error, classifier);
                    if stage != Stage::Cleanup {
                        t.route_to_cleanup()?;
                    }
                }
            }
        }
    }

    Ok(t.build())
}

/// Marks the current stage failed; in cleanup this ends the pipeline.
fn fail_terminally(t: &mut Builder, error: &PipelineError, classifier: &dyn ErrorClassifier) {
    let stage = t.record.stage;
    let class = classifier.classify(error);
    t.record.last_error = Some(JobError::from_error(error, class, stage, t.record.attempt()));
    let message = error.to_string();
    t.record.record(JobStatus::Failed, Some(message.clone()));
    t.event(EventType::StageFailed, Some(message));
    if stage == Stage::Cleanup {
        t.finish(PipelineOutcome::FailedCleanup);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ArtifactRef, ServiceSpec};
    use crate::errors::DefaultClassifier;
    use crate::queue::StagePayload;
    use pretty_assertions::assert_eq;

    fn config() -> PipelineConfig {
        PipelineConfig::default()
    }

    fn job() -> JobRecord {
        JobRecord::new(ServiceSpec::new("foo-api", "rest-api", "staging", "team-a"))
    }

    fn active(stage: Stage) -> JobRecord {
        let mut job = job();
        if stage != Stage::Generation {
            job.artifact_ref = Some(ArtifactRef::new("workspace://foo-api/abc"));
            job.enter_stage(stage);
        }
        activate(&mut job, Utc::now(), &config());
        job
    }

    fn apply(record: JobRecord, outcome: &WorkOutcome) -> Transition {
        apply_outcome(record, outcome, &config(), &DefaultClassifier::new(), Utc::now()).unwrap()
    }

    fn success() -> WorkOutcome {
        WorkOutcome::produced(ArtifactRef::new("workspace://foo-api/def"))
    }

    #[test]
    fn test_decide_fresh_delivery_activates() {
        let job = job();
        let message = QueueMessage::for_job(&job).unwrap();
        assert_eq!(decide_delivery(&job, &message, Utc::now(), &config()), DeliveryAction::Activate);
    }

    #[test]
    fn test_decide_drops_stale_deliveries() {
        let mut job = job();
        let message = QueueMessage::for_job(&job).unwrap();

        job.attempts.insert(Stage::Generation, 2);
        assert_eq!(decide_delivery(&job, &message, Utc::now(), &config()), DeliveryAction::Drop);

        let mut moved_on = self::job();
        moved_on.artifact_ref = Some(ArtifactRef::new("workspace://foo-api/abc"));
        moved_on.enter_stage(Stage::Build);
        assert_eq!(decide_delivery(&moved_on, &message, Utc::now(), &config()), DeliveryAction::Drop);
    }

    #[test]
    fn test_decide_requeues_while_held() {
        let job = active(Stage::Generation);
        let message = QueueMessage::for_job(&job).unwrap();

        let action = decide_delivery(&job, &message, Utc::now(), &config());
        assert!(matches!(action, DeliveryAction::Requeue(delay) if delay > Duration::ZERO));

        let later = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(decide_delivery(&job, &message, later, &config()), DeliveryAction::Expire);
    }

    #[test]
    fn test_decide_cancel_and_timeout() {
        let mut job = job();
        let message = QueueMessage::for_job(&job).unwrap();
        job.created_at = Utc::now() - chrono::Duration::hours(2);
        assert!(matches!(
            decide_delivery(&job, &message, Utc::now(), &config()),
            DeliveryAction::TimeOut { .. }
        ));

        job.cancel_requested = true;
        assert_eq!(decide_delivery(&job, &message, Utc::now(), &config()), DeliveryAction::Cancel);
    }

    #[test]
    fn test_decide_cleanup_runs_despite_cancel() {
        let mut job = job();
        job.cancel_requested = true;
        job.failed_stage = Some(Stage::Generation);
        job.enter_stage(Stage::Cleanup);
        let message = QueueMessage::for_job(&job).unwrap();

        assert_eq!(decide_delivery(&job, &message, Utc::now(), &config()), DeliveryAction::Activate);
    }

    #[test]
    fn test_activate_from_retrying() {
        let mut job = job();
        job.attempts.insert(Stage::Generation, 2);
        job.record(JobStatus::Retrying, Some("boom".into()));
        activate(&mut job, Utc::now(), &config());

        let statuses: Vec<JobStatus> = job.history.iter().map(|h| h.status).collect();
        assert_eq!(
            statuses,
            vec![JobStatus::Queued, JobStatus::Retrying, JobStatus::Queued, JobStatus::Active]
        );
        assert!(job.is_held());
    }

    #[test]
    fn test_success_advances_stage() {
        let t = apply(active(Stage::Generation), &success());

        assert_eq!(t.record.stage, Stage::Build);
        assert_eq!(t.record.status, JobStatus::Queued);
        assert_eq!(t.record.attempt(), 1);
        assert!(!t.record.is_held());
        assert_eq!(t.record.completed_stages(), vec![Stage::Generation]);
        let follow = t.follow_up.unwrap();
        assert_eq!(follow.message.stage(), Stage::Build);
        assert!(follow.delay.is_none());
        assert_eq!(t.events[0].event_type, EventType::StageCompleted);
    }

    #[test]
    fn test_deployment_success_is_terminal() {
        let t = apply(active(Stage::Deployment), &success());

        assert!(t.is_terminal());
        assert_eq!(t.record.outcome, PipelineOutcome::Deployed);
        assert!(t.follow_up.is_none());
        assert_eq!(t.events.last().unwrap().event_type, EventType::PipelineDeployed);
    }

    #[test]
    fn test_success_after_cancel_goes_to_cleanup() {
        let mut job = active(Stage::Generation);
        job.cancel_requested = true;
        let t = apply(job, &success());

        assert_eq!(t.record.stage, Stage::Cleanup);
        assert_eq!(t.record.failed_stage, Some(Stage::Generation));
        assert!(matches!(
            t.follow_up.unwrap().message.payload,
            StagePayload::Cleanup { stage_reached: Stage::Generation, .. }
        ));
    }

    #[test]
    fn test_retryable_failure_schedules_retry() {
        let t = apply(
            active(Stage::Build),
            &WorkOutcome::Failure(PipelineError::executor_failure(1, "flaky")),
        );

        assert_eq!(t.record.stage, Stage::Build);
        assert_eq!(t.record.status, JobStatus::Retrying);
        assert_eq!(t.record.attempt(), 2);
        assert!(t.record.retry_at.is_some());
        let error = t.record.last_error.clone().unwrap();
        assert!(error.retryable);
        assert_eq!(error.attempt, 1);

        let follow = t.follow_up.unwrap();
        assert_eq!(follow.message.attempt, 2);
        assert_eq!(follow.delay, Some(Duration::from_millis(2000)));
        assert_eq!(t.events[0].event_type, EventType::StageRetrying);
    }

    #[test]
    fn test_exhausted_retries_go_to_cleanup() {
        let mut job = active(Stage::Build);
        job.attempts.insert(Stage::Build, 3);
        let t = apply(job, &WorkOutcome::Failure(PipelineError::transient("still busy")));

        assert_eq!(t.record.stage, Stage::Cleanup);
        assert_eq!(t.record.failed_stage, Some(Stage::Build));
        assert_eq!(t.record.attempt_for(Stage::Build), 3);
        assert_eq!(t.record.outcome, PipelineOutcome::Running);
    }

    #[test]
    fn test_terminal_error_skips_retry() {
        let error = PipelineError::Template(crate::errors::TemplateError::malformed("bad"));
        let t = apply(active(Stage::Generation), &WorkOutcome::Failure(error));

        assert_eq!(t.record.stage, Stage::Cleanup);
        assert_eq!(t.record.attempt_for(Stage::Generation), 1);
        assert!(!t.record.last_error.unwrap().retryable);
    }

    #[test]
    fn test_cancelled_attempt_goes_to_cleanup() {
        let mut job = active(Stage::Generation);
        job.cancel_requested = true;
        let t = apply(job, &WorkOutcome::Cancelled("user request".into()));

        assert_eq!(t.record.stage, Stage::Cleanup);
        assert!(t
            .record
            .history
            .iter()
            .any(|h| h.stage == Stage::Generation && h.status == JobStatus::Cancelled));
        assert_eq!(t.events[0].event_type, EventType::StageCancelled);
    }

    #[test]
    fn test_cleanup_outcomes() {
        let mut cancelled = active(Stage::Cleanup);
        cancelled.cancel_requested = true;
        assert_eq!(apply(cancelled, &success()).record.outcome, PipelineOutcome::Cancelled);

        assert_eq!(apply(active(Stage::Cleanup), &success()).record.outcome, PipelineOutcome::Failed);

        let mut exhausted = active(Stage::Cleanup);
        exhausted.attempts.insert(Stage::Cleanup, 3);
        let t = apply(exhausted, &WorkOutcome::Failure(PipelineError::transient("target busy")));
        assert_eq!(t.record.outcome, PipelineOutcome::FailedCleanup);
        assert!(t.follow_up.is_none());
        assert_eq!(t.events.last().unwrap().event_type, EventType::PipelineFailedCleanup);
    }

    #[test]
    fn test_attempt_never_exceeds_budget() {
        let mut record = active(Stage::Generation);
        let max = config().generation.retry.max_attempts;
        for _ in 0..10 {
            let t = apply(record, &WorkOutcome::Failure(PipelineError::transient("again")));
            assert!(t.record.attempt_for(Stage::Generation) <= max);
            if t.record.stage != Stage::Generation {
                return;
            }
            record = t.record;
            activate(&mut record, Utc::now(), &config());
        }
        panic!("retries never ran out");
    }
}
