//! Live cancellation tokens keyed by job.

use dashmap::DashMap;
use std::sync::Arc;

use super::CancellationToken;
use crate::core::JobId;

/// Maps jobs to the token of the worker currently running them.
///
/// A token is created on first use, so a cancel request that arrives
/// between two stages is still seen by the next worker.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    tokens: DashMap<JobId, Arc<CancellationToken>>,
}

impl CancellationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the token for a job, creating it if needed.
    pub fn token(&self, job_id: JobId) -> Arc<CancellationToken> {
        self.tokens
            .entry(job_id)
            .or_insert_with(|| Arc::new(CancellationToken::new()))
            .clone()
    }

    /// Cancels a job's token.
    pub fn cancel(&self, job_id: JobId, reason: &str) -> bool {
        self.token(job_id).cancel(reason)
    }

    /// Returns true if the job has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self, job_id: JobId) -> bool {
        self.tokens
            .get(&job_id)
            .is_some_and(|token| token.is_cancelled())
    }

    /// Drops the token once the job is terminal.
    pub fn remove(&self, job_id: JobId) {
        self.tokens.remove(&job_id);
    }

    /// Number of tracked jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Returns true if no jobs are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
