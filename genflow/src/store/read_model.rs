//! Read-only projection of the job store for dashboards.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{JobFilter, JobStore};
use crate::core::{JobId, JobStatus, JobStatusView, PipelineOutcome, Stage};
use crate::errors::Result;

/// Counts of jobs per stage and status, and per outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSummary {
    /// Jobs per (stage, status).
    pub by_stage: BTreeMap<Stage, BTreeMap<JobStatus, usize>>,
    /// Jobs per pipeline outcome.
    pub by_outcome: BTreeMap<PipelineOutcome, usize>,
    /// All jobs.
    pub total: usize,
}

impl PipelineSummary {
    /// Jobs currently in `stage` with `status`.
    #[must_use]
    pub fn count(&self, stage: Stage, status: JobStatus) -> usize {
        self.by_stage
            .get(&stage)
            .and_then(|statuses| statuses.get(&status))
            .copied()
            .unwrap_or(0)
    }
}

/// Query-only view over a [`JobStore`]. It has no write path.
#[derive(Clone)]
pub struct PipelineReadModel {
    store: Arc<dyn JobStore>,
}

impl PipelineReadModel {
    /// Wraps a store.
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Status views of the jobs matching `filter`.
    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<JobStatusView>> {
        let jobs = self.store.list(filter).await?;
        Ok(jobs.iter().map(|job| job.view()).collect())
    }

    /// Status view of one job.
    pub async fn get(&self, job_id: JobId) -> Result<Option<JobStatusView>> {
        Ok(self.store.get(job_id).await?.map(|job| job.view()))
    }

    /// Aggregated counts over all jobs.
    pub async fn summary(&self) -> Result<PipelineSummary> {
        let jobs = self.store.list(&JobFilter::all()).await?;
        let mut summary = PipelineSummary {
            total: jobs.len(),
            ..PipelineSummary::default()
        };
        for job in &jobs {
            *summary
                .by_stage
                .entry(job.stage)
                .or_default()
                .entry(job.status)
                .or_default() += 1;
            *summary.by_outcome.entry(job.outcome).or_default() += 1;
        }
        Ok(summary)
    }
}

impl std::fmt::Debug for PipelineReadModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineReadModel").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{JobRecord, ServiceSpec};
    use crate::store::InMemoryJobStore;

    #[tokio::test]
    async fn test_summary_and_list() {
        let store = Arc::new(InMemoryJobStore::new());
        let queued = JobRecord::new(ServiceSpec::new("svc-a", "rest-api", "staging", "team-a"));
        let mut building = JobRecord::new(ServiceSpec::new("svc-b", "rest-api", "staging", "team-a"));
        building.enter_stage(Stage::Build);
        building.record(JobStatus::Active, None);
        let queued_id = queued.id;
        store.insert(queued).await.unwrap();
        store.insert(building).await.unwrap();

        let model = PipelineReadModel::new(store);
        let summary = model.summary().await.unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.count(Stage::Generation, JobStatus::Queued), 1);
        assert_eq!(summary.count(Stage::Build, JobStatus::Active), 1);
        assert_eq!(summary.count(Stage::Build, JobStatus::Queued), 0);
        assert_eq!(summary.by_outcome.get(&PipelineOutcome::Running), Some(&2));

        let active = model
            .list(&JobFilter::all().with_status(JobStatus::Active))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].service_name, "svc-b");

        assert_eq!(model.get(queued_id).await.unwrap().unwrap().stage, Stage::Generation);
    }
}
