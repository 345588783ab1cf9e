//! Job records as held by the job store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::{ArtifactRef, JobStatus, PipelineOutcome, ServiceSpec, Stage};
use crate::errors::JobError;

/// Identifier of a pipeline job.
///
/// Backed by a v7 UUID so ids sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generates a new time-ordered id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One entry in a job's transition history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    /// The stage.
    pub stage: Stage,
    /// The status entered.
    pub status: JobStatus,
    /// The attempt at the time of the transition.
    pub attempt: u32,
    /// When the transition happened.
    pub at: DateTime<Utc>,
    /// Error message attached to the transition, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The authoritative record of one pipeline run for one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job id.
    pub id: JobId,
    /// Correlates queue messages and log lines for this run.
    pub correlation_id: Uuid,
    /// The request, copied at submission and never modified.
    pub service: ServiceSpec,
    /// Current stage.
    pub stage: Stage,
    /// Status within the current stage.
    pub status: JobStatus,
    /// Attempt number per stage, 1-indexed.
    #[serde(default)]
    pub attempts: BTreeMap<Stage, u32>,
    /// Optimistic concurrency version, bumped on every write.
    pub version: u64,
    /// Dispatch priority; lower runs first on timestamp ties.
    #[serde(default)]
    pub priority: i32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
    /// The most recent error.
    #[serde(default)]
    pub last_error: Option<JobError>,
    /// Output of the last completed stage.
    #[serde(default)]
    pub artifact_ref: Option<ArtifactRef>,
    /// Checksum of the generated tree.
    #[serde(default)]
    pub checksum: Option<String>,
    /// Outcome of the run as a whole.
    #[serde(default)]
    pub outcome: PipelineOutcome,
    /// The stage that was running when the job was routed to cleanup.
    #[serde(default)]
    pub failed_stage: Option<Stage>,
    /// Set once a cancel request has been accepted.
    #[serde(default)]
    pub cancel_requested: bool,
    /// Deadline of the worker currently holding the job.
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// When a scheduled retry becomes due.
    #[serde(default)]
    pub retry_at: Option<DateTime<Utc>>,
    /// Every transition in order.
    #[serde(default)]
    pub history: Vec<StageRecord>,
}

impl JobRecord {
    /// Creates a job queued for generation.
    #[must_use]
    pub fn new(service: ServiceSpec) -> Self {
        let now = Utc::now();
        let mut record = Self {
            id: JobId::new(),
            correlation_id: Uuid::now_v7(),
            service,
            stage: Stage::Generation,
            status: JobStatus::Queued,
            attempts: BTreeMap::new(),
            version: 0,
            priority: 0,
            created_at: now,
            updated_at: now,
            last_error: None,
            artifact_ref: None,
            checksum: None,
            outcome: PipelineOutcome::Running,
            failed_stage: None,
            cancel_requested: false,
            lease_expires_at: None,
            retry_at: None,
            history: Vec::new(),
        };
        record.attempts.insert(Stage::Generation, 1);
        record.record(JobStatus::Queued, None);
        record
    }

    /// Sets the dispatch priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// The service name.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service.name
    }

    /// Attempt number of the current stage.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt_for(self.stage)
    }

    /// Attempt number of a given stage (0 if never queued).
    #[must_use]
    pub fn attempt_for(&self, stage: Stage) -> u32 {
        self.attempts.get(&stage).copied().unwrap_or(0)
    }

    /// Returns true if a worker currently holds the job.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.lease_expires_at.is_some()
    }

    /// Returns true if the holder's lease ran out before `now`.
    #[must_use]
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at.is_some_and(|deadline| deadline <= now)
    }

    /// Sets the status and appends a history entry.
    pub fn record(&mut self, status: JobStatus, error: Option<String>) {
        self.status = status;
        self.history.push(StageRecord {
            stage: self.stage,
            status,
            attempt: self.attempt(),
            at: Utc::now(),
            error,
        });
    }

    /// Moves to a new stage, queued at attempt 1.
    pub fn enter_stage(&mut self, stage: Stage) {
        self.stage = stage;
        self.attempts.insert(stage, 1);
        self.lease_expires_at = None;
        self.retry_at = None;
        self.record(JobStatus::Queued, None);
    }

    /// Stages that reached `Completed`, in order.
    #[must_use]
    pub fn completed_stages(&self) -> Vec<Stage> {
        self.history
            .iter()
            .filter(|entry| entry.status == JobStatus::Completed)
            .map(|entry| entry.stage)
            .collect()
    }

    /// A read-only projection for status queries.
    #[must_use]
    pub fn view(&self) -> JobStatusView {
        JobStatusView {
            job_id: self.id,
            service_name: self.service.name.clone(),
            stage: self.stage,
            status: self.status,
            attempt: self.attempt(),
            last_error: self.last_error.clone(),
            artifact_ref: self.artifact_ref.clone(),
            checksum: self.checksum.clone(),
            outcome: self.outcome,
            updated_at: self.updated_at,
        }
    }
}

/// What `get_job_status` returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusView {
    /// Job id.
    pub job_id: JobId,
    /// Service name.
    pub service_name: String,
    /// Current stage.
    pub stage: Stage,
    /// Current status.
    pub status: JobStatus,
    /// Attempt of the current stage.
    pub attempt: u32,
    /// Most recent error.
    pub last_error: Option<JobError>,
    /// Latest artifact.
    pub artifact_ref: Option<ArtifactRef>,
    /// Checksum of the generated tree.
    pub checksum: Option<String>,
    /// Outcome of the run.
    pub outcome: PipelineOutcome,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}
