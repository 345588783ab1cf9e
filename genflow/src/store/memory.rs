use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::{InsertResult, JobFilter, JobStore, WriteResult};
use crate::core::{JobId, JobRecord};
use crate::errors::Result;

/// Job store backed by a hash map.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl InMemoryJobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    /// Returns true if no jobs are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, mut record: JobRecord) -> Result<InsertResult> {
        let mut jobs = self.jobs.write();

        let running = jobs
            .values()
            .find(|job| job.service.name == record.service.name && !job.outcome.is_terminal());
        if let Some(existing) = running {
            return Ok(InsertResult::Conflict { existing: existing.id });
        }

        record.version = 1;
        jobs.insert(record.id, record);
        Ok(InsertResult::Inserted)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>> {
        Ok(self.jobs.read().get(&job_id).cloned())
    }

    async fn update(&self, mut record: JobRecord, expected_version: u64) -> Result<WriteResult> {
        let mut jobs = self.jobs.write();
        let Some(stored) = jobs.get_mut(&record.id) else {
            return Ok(WriteResult::PreconditionFailed { current: 0 });
        };

        if stored.version != expected_version {
            tracing::debug!(
                job_id = %record.id,
                expected = expected_version,
                current = stored.version,
                "Rejected stale write"
            );
            return Ok(WriteResult::PreconditionFailed {
                current: stored.version,
            });
        }

        record.version = expected_version + 1;
        record.updated_at = Utc::now();
        let version = record.version;
        *stored = record;
        Ok(WriteResult::Success { version })
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        let mut jobs: Vec<JobRecord> = self
            .jobs
            .read()
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn delete(&self, job_id: JobId) -> Result<bool> {
        Ok(self.jobs.write().remove(&job_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{JobStatus, PipelineOutcome, ServiceSpec};

    fn job(name: &str) -> JobRecord {
        JobRecord::new(ServiceSpec::new(name, "rest-api", "staging", "team-a"))
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = InMemoryJobStore::new();
        let record = job("foo-api");
        let id = record.id;

        assert_eq!(store.insert(record).await.unwrap(), InsertResult::Inserted);
        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert!(store.get(JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_one_running_pipeline_per_service() {
        let store = InMemoryJobStore::new();
        let first = job("foo-api");
        let first_id = first.id;
        store.insert(first).await.unwrap();

        let result = store.insert(job("foo-api")).await.unwrap();
        assert_eq!(result, InsertResult::Conflict { existing: first_id });

        let mut done = store.get(first_id).await.unwrap().unwrap();
        done.outcome = PipelineOutcome::Deployed;
        store.update(done, 1).await.unwrap();

        assert_eq!(store.insert(job("foo-api")).await.unwrap(), InsertResult::Inserted);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_conditional_update() {
        let store = InMemoryJobStore::new();
        let record = job("foo-api");
        let id = record.id;
        store.insert(record).await.unwrap();

        let mut a = store.get(id).await.unwrap().unwrap();
        let mut b = a.clone();

        a.record(JobStatus::Active, None);
        assert_eq!(store.update(a, 1).await.unwrap(), WriteResult::Success { version: 2 });

        b.record(JobStatus::Cancelling, None);
        assert_eq!(
            store.update(b, 1).await.unwrap(),
            WriteResult::PreconditionFailed { current: 2 }
        );

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Active);
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn test_update_unknown_job() {
        let store = InMemoryJobStore::new();
        let result = store.update(job("ghost-api"), 1).await.unwrap();
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let store = InMemoryJobStore::new();
        let a = job("svc-a");
        let b = job("svc-b");
        let a_id = a.id;
        store.insert(a).await.unwrap();
        store.insert(b).await.unwrap();

        let all = store.list(&JobFilter::all()).await.unwrap();
        assert_eq!(all.len(), 2);

        let only_b = store.list(&JobFilter::all().with_service("svc-b")).await.unwrap();
        assert_eq!(only_b.len(), 1);

        assert!(store.delete(a_id).await.unwrap());
        assert!(!store.delete(a_id).await.unwrap());
        assert_eq!(store.len(), 1);
    }
}
