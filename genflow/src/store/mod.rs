//! The job store: the authoritative, version-checked record of every job.
//!
//! Every write is conditional on the version the writer last observed.
//! A stale writer gets [`WriteResult::PreconditionFailed`] back and must
//! refetch before deciding again.

mod memory;
mod read_model;
mod retention;

pub use memory::InMemoryJobStore;
pub use read_model::{PipelineReadModel, PipelineSummary};
pub use retention::collect_garbage;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{JobId, JobRecord, JobStatus, PipelineOutcome, Stage};
use crate::errors::Result;

/// Result of inserting a new job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    /// The job was stored at version 1.
    Inserted,
    /// A non-terminal pipeline already exists for the service.
    Conflict {
        /// The job that is still running.
        existing: JobId,
    },
}

/// Result of a conditional update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    /// The write was applied.
    Success {
        /// The version now stored.
        version: u64,
    },
    /// The stored version did not match the expected one.
    PreconditionFailed {
        /// The version currently stored.
        current: u64,
    },
}

impl WriteResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Filter for listing jobs. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    /// Current stage.
    #[serde(default)]
    pub stage: Option<Stage>,
    /// Current status.
    #[serde(default)]
    pub status: Option<JobStatus>,
    /// Pipeline outcome.
    #[serde(default)]
    pub outcome: Option<PipelineOutcome>,
    /// Exact service name.
    #[serde(default)]
    pub service_name: Option<String>,
}

impl JobFilter {
    /// Matches every job.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restricts to a stage.
    #[must_use]
    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Restricts to a status.
    #[must_use]
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Restricts to an outcome.
    #[must_use]
    pub fn with_outcome(mut self, outcome: PipelineOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    /// Restricts to a service.
    #[must_use]
    pub fn with_service(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    /// Returns true if `record` passes the filter.
    #[must_use]
    pub fn matches(&self, record: &JobRecord) -> bool {
        self.stage.map_or(true, |stage| record.stage == stage)
            && self.status.map_or(true, |status| record.status == status)
            && self.outcome.map_or(true, |outcome| record.outcome == outcome)
            && self
                .service_name
                .as_deref()
                .map_or(true, |name| record.service.name == name)
    }
}

/// Persistent job storage.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Stores a new job at version 1.
    ///
    /// Refuses the insert while another pipeline for the same service has
    /// not reached a terminal outcome.
    async fn insert(&self, record: JobRecord) -> Result<InsertResult>;

    /// Fetches a job.
    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>>;

    /// Replaces a job if its stored version equals `expected_version`.
    ///
    /// The store assigns the new version; the record's own `version` field
    /// is ignored on input.
    async fn update(&self, record: JobRecord, expected_version: u64) -> Result<WriteResult>;

    /// Jobs matching `filter`, oldest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>>;

    /// Removes a job. Returns false if it did not exist.
    async fn delete(&self, job_id: JobId) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ServiceSpec;

    #[test]
    fn test_filter_matches() {
        let record = JobRecord::new(ServiceSpec::new("foo-api", "rest-api", "staging", "team-a"));

        assert!(JobFilter::all().matches(&record));
        assert!(JobFilter::all()
            .with_stage(Stage::Generation)
            .with_status(JobStatus::Queued)
            .with_outcome(PipelineOutcome::Running)
            .with_service("foo-api")
            .matches(&record));
        assert!(!JobFilter::all().with_stage(Stage::Build).matches(&record));
        assert!(!JobFilter::all().with_service("bar-api").matches(&record));
    }
}
