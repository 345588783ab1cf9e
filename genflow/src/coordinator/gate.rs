//! Per-stage concurrency gates.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::Stage;
use crate::errors::{PipelineError, Result};

/// Counting semaphore bounding how many jobs of one stage run at once.
///
/// A dispatcher takes a permit before it receives a message, so surplus
/// jobs stay queued instead of piling up in memory.
#[derive(Debug, Clone)]
pub struct StageGate {
    stage: Stage,
    limit: usize,
    semaphore: Arc<Semaphore>,
}

impl StageGate {
    /// Creates a gate with `limit` permits.
    #[must_use]
    pub fn new(stage: Stage, limit: usize) -> Self {
        Self {
            stage,
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
        }
    }

    /// The stage this gate guards.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    /// The configured limit.
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Waits for a permit.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Config(format!("{} gate closed", self.stage)))
    }

    /// Takes a permit if one is free.
    #[must_use]
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Free permits.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Permits currently held.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.limit.saturating_sub(self.available())
    }

    /// Waits until every permit is returned, then closes the gate.
    pub async fn drain(&self) {
        let permits = u32::try_from(self.limit).unwrap_or(u32::MAX);
        if let Ok(all) = self.semaphore.acquire_many(permits).await {
            all.forget();
        }
        self.semaphore.close();
    }
}
