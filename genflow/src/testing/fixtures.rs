//! Fixtures and a harness for coordinator tests.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::mocks::{InMemoryWorkspace, RecordingTeardown, ScriptedCapability};
use crate::config::{PipelineConfig, QueueConfig, StageConfig};
use crate::coordinator::{Coordinator, CoordinatorHandle};
use crate::core::{JobId, JobRecord, ServiceSpec, Stage};
use crate::errors::{PipelineError, Result};
use crate::events::CollectingEventSink;
use crate::queue::InMemoryJobQueue;
use crate::retry::RetryPolicy;
use crate::store::InMemoryJobStore;
use crate::workers::{StageCapability, StageWorker, TeardownCapability, WorkspaceWriter};

/// How long harness waits give up after.
pub const WAIT_LIMIT: Duration = Duration::from_secs(10);

/// A `rest-api` request for `staging`.
#[must_use]
pub fn service_spec(name: &str) -> ServiceSpec {
    ServiceSpec::new(name, "rest-api", "staging", "team-a")
}

/// Config with millisecond backoffs and short polls.
#[must_use]
pub fn fast_config() -> PipelineConfig {
    let stage = |concurrency| StageConfig {
        concurrency,
        retry: RetryPolicy::new()
            .with_max_attempts(3)
            .with_base_delay_ms(5)
            .with_max_delay_ms(50),
        timeout_ms: 2_000,
    };

    let mut config = PipelineConfig::default();
    for s in Stage::ALL {
        *config.stage_mut(s) = stage(2);
    }
    config.queue = QueueConfig {
        visibility_timeout_ms: 1_000,
        poll_interval_ms: 10,
        reconnect: RetryPolicy::new()
            .with_max_attempts(3)
            .with_base_delay_ms(5)
            .with_max_delay_ms(20),
    };
    config
}

/// Polls `condition` every few milliseconds until it holds.
pub async fn wait_until<F, Fut>(mut condition: F, limit: Duration) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(limit, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    waited.map_err(|_| PipelineError::PipelineTimeout {
        elapsed_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        limit_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
    })
}

/// A started coordinator over in-memory store and queue.
#[derive(Debug)]
pub struct TestHarness {
    /// The coordinator.
    pub coordinator: Coordinator,
    /// Every event emitted.
    pub events: Arc<CollectingEventSink>,
    /// The store behind the coordinator.
    pub store: Arc<InMemoryJobStore>,
    /// The broker behind the coordinator.
    pub queue: Arc<InMemoryJobQueue>,
    handle: Option<CoordinatorHandle>,
}

impl TestHarness {
    /// Starts building a harness.
    #[must_use]
    pub fn builder() -> TestHarnessBuilder {
        TestHarnessBuilder::default()
    }

    /// Starts the dispatchers if they are not running.
    pub fn start(&mut self) {
        if self.handle.is_none() {
            self.handle = Some(self.coordinator.start());
        }
    }

    /// Submits `service_spec(name)`.
    pub async fn submit(&self, name: &str) -> Result<JobId> {
        self.coordinator.submit_service(service_spec(name)).await
    }

    /// Waits for a job's final outcome.
    pub async fn finished(&self, job_id: JobId) -> Result<JobRecord> {
        self.coordinator.await_outcome(job_id, WAIT_LIMIT).await
    }

    /// Stops the dispatchers.
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown().await;
        }
    }
}

/// Builder for [`TestHarness`]. Unset capabilities succeed.
#[derive(Debug)]
pub struct TestHarnessBuilder {
    config: PipelineConfig,
    workspace: Arc<dyn WorkspaceWriter>,
    build: Arc<dyn StageCapability>,
    deploy: Arc<dyn StageCapability>,
    teardown: Arc<dyn TeardownCapability>,
    workers: Vec<Arc<dyn StageWorker>>,
    queue: Arc<InMemoryJobQueue>,
}

impl Default for TestHarnessBuilder {
    fn default() -> Self {
        let config = fast_config();
        Self {
            queue: Arc::new(InMemoryJobQueue::new(config.queue.visibility_timeout())),
            config,
            workspace: Arc::new(InMemoryWorkspace::new()),
            build: Arc::new(ScriptedCapability::new()),
            deploy: Arc::new(ScriptedCapability::new()),
            teardown: Arc::new(RecordingTeardown::new()),
            workers: Vec::new(),
        }
    }
}

impl TestHarnessBuilder {
    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.queue = Arc::new(InMemoryJobQueue::new(config.queue.visibility_timeout()));
        self.config = config;
        self
    }

    /// The broker the harness will use. Replaced by [`Self::with_config`].
    #[must_use]
    pub fn queue(&self) -> Arc<InMemoryJobQueue> {
        self.queue.clone()
    }

    /// Sets the generation workspace.
    #[must_use]
    pub fn with_workspace(mut self, workspace: Arc<dyn WorkspaceWriter>) -> Self {
        self.workspace = workspace;
        self
    }

    /// Sets the build capability.
    #[must_use]
    pub fn with_build(mut self, build: Arc<dyn StageCapability>) -> Self {
        self.build = build;
        self
    }

    /// Sets the deploy capability.
    #[must_use]
    pub fn with_deploy(mut self, deploy: Arc<dyn StageCapability>) -> Self {
        self.deploy = deploy;
        self
    }

    /// Sets the teardown.
    #[must_use]
    pub fn with_teardown(mut self, teardown: Arc<dyn TeardownCapability>) -> Self {
        self.teardown = teardown;
        self
    }

    /// Replaces a stage's worker.
    #[must_use]
    pub fn with_worker(mut self, worker: Arc<dyn StageWorker>) -> Self {
        self.workers.push(worker);
        self
    }

    /// Builds the coordinator without starting it.
    pub fn build(self) -> Result<TestHarness> {
        let events = Arc::new(CollectingEventSink::new());
        let store = Arc::new(InMemoryJobStore::new());

        let mut builder = Coordinator::builder()
            .with_config(self.config)
            .with_store(store.clone())
            .with_queue(self.queue.clone())
            .with_event_sink(events.clone())
            .with_workspace(self.workspace)
            .with_build_capability(self.build)
            .with_deploy_capability(self.deploy)
            .with_teardown(self.teardown);
        for worker in self.workers {
            builder = builder.with_worker(worker);
        }

        Ok(TestHarness {
            coordinator: builder.build()?,
            events,
            store,
            queue: self.queue,
            handle: None,
        })
    }

    /// Builds and starts the coordinator.
    pub fn start(self) -> Result<TestHarness> {
        let mut harness = self.build()?;
        harness.start();
        Ok(harness)
    }
}
