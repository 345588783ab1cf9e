//! Bounded-growth garbage collection of finished jobs.

use std::cmp::Reverse;

use super::{JobFilter, JobStore};
use crate::config::RetentionConfig;
use crate::core::JobRecord;
use crate::errors::Result;

/// Deletes finished jobs beyond the retention counts.
///
/// Successful pipelines (deployed or cancelled) and failed ones are counted
/// separately; in each group the most recently updated jobs are kept.
/// Running jobs are never touched. Returns the number of deleted jobs.
pub async fn collect_garbage(store: &dyn JobStore, retention: &RetentionConfig) -> Result<usize> {
    let (mut failed, mut succeeded): (Vec<JobRecord>, Vec<JobRecord>) = store
        .list(&JobFilter::all())
        .await?
        .into_iter()
        .filter(|job| job.outcome.is_terminal())
        .partition(|job| job.outcome.is_failure());

    let mut deleted = 0;
    for (group, keep) in [
        (&mut succeeded, retention.remove_on_complete),
        (&mut failed, retention.remove_on_fail),
    ] {
        group.sort_by_key(|job| Reverse((job.updated_at, job.id)));
        for job in group.iter().skip(keep) {
            if store.delete(job.id).await? {
                deleted += 1;
            }
        }
    }

    if deleted > 0 {
        tracing::debug!(deleted, "Collected finished jobs");
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PipelineOutcome, ServiceSpec};
    use crate::store::InMemoryJobStore;
    use chrono::{Duration, Utc};

    async fn finished(store: &InMemoryJobStore, name: &str, outcome: PipelineOutcome, age_secs: i64) {
        let mut job = JobRecord::new(ServiceSpec::new(name, "rest-api", "staging", "team-a"));
        job.outcome = outcome;
        job.updated_at = Utc::now() - Duration::seconds(age_secs);
        store.insert(job).await.unwrap();
    }

    #[tokio::test]
    async fn test_keeps_newest_per_group() {
        let store = InMemoryJobStore::new();
        finished(&store, "ok-old", PipelineOutcome::Deployed, 300).await;
        finished(&store, "ok-mid", PipelineOutcome::Cancelled, 200).await;
        finished(&store, "ok-new", PipelineOutcome::Deployed, 100).await;
        finished(&store, "bad-old", PipelineOutcome::Failed, 300).await;
        finished(&store, "bad-new", PipelineOutcome::FailedCleanup, 100).await;
        store
            .insert(JobRecord::new(ServiceSpec::new("running", "rest-api", "staging", "team-a")))
            .await
            .unwrap();

        let retention = RetentionConfig {
            remove_on_complete: 2,
            remove_on_fail: 1,
        };
        let deleted = collect_garbage(&store, &retention).await.unwrap();
        assert_eq!(deleted, 2);

        let mut left: Vec<String> = store
            .list(&JobFilter::all())
            .await
            .unwrap()
            .into_iter()
            .map(|job| job.service.name)
            .collect();
        left.sort();
        assert_eq!(left, vec!["bad-new", "ok-mid", "ok-new", "running"]);
    }

    #[tokio::test]
    async fn test_nothing_to_collect() {
        let store = InMemoryJobStore::new();
        finished(&store, "only-one", PipelineOutcome::Deployed, 10).await;
        assert_eq!(collect_garbage(&store, &RetentionConfig::default()).await.unwrap(), 0);
    }
}
