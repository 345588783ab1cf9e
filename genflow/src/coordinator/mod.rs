//! The pipeline coordinator.
//!
//! The coordinator owns the job state machine. It validates submissions,
//! creates jobs, runs one dispatcher per stage behind that stage's
//! concurrency gate, records every worker outcome with a version-checked
//! write and enqueues whatever comes next.
//!
//! ```rust,ignore
//! use genflow::prelude::*;
//!
//! let coordinator = Coordinator::builder()
//!     .with_config(PipelineConfig::default())
//!     .with_workspace(Arc::new(FsWorkspace::new("/var/lib/genflow")))
//!     .with_build_capability(build)
//!     .with_deploy_capability(deploy)
//!     .with_teardown(Arc::new(FsWorkspace::new("/var/lib/genflow")))
//!     .build()?;
//!
//! let handle = coordinator.start();
//! let job_id = coordinator
//!     .submit_service(ServiceSpec::new("foo-api", "rest-api", "staging", "team-a"))
//!     .await?;
//! let job = coordinator.await_outcome(job_id, Duration::from_secs(600)).await?;
//! handle.shutdown().await;
//! ```

mod dispatch;
mod gate;
mod transitions;


pub use gate::StageGate;
pub use transitions::{activate, apply_outcome, decide_delivery, DeliveryAction, FollowUp, Transition};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::cancellation::CancellationRegistry;
use crate::config::PipelineConfig;
use crate::core::{validate_service_name, JobId, JobRecord, JobStatus, JobStatusView, ServiceSpec, Stage};
use crate::errors::{DefaultClassifier, ErrorClassifier, PipelineError, Result, ValidationError};
use crate::events::{EventSink, EventType, NoOpEventSink, PipelineEvent};
use crate::queue::{EnqueueOptions, InMemoryJobQueue, JobQueue, QueueConnection, QueueMessage, ReconnectingQueue};
use crate::store::{InMemoryJobStore, InsertResult, JobFilter, JobStore, PipelineReadModel, WriteResult};
use crate::template::{TemplateCatalog, TemplateEngine};
use crate::workers::{
    CleanupWorker, ExecutionWorker, GenerationWorker, StageCapability, StageWorker, TeardownCapability,
    WorkspaceWriter,
};

/// Priority given to the message that routes a cancelled job.
const CANCEL_PRIORITY: i32 = -1;

/// How a cancel request was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelState {
    /// Cancellation was recorded; the job will reach cleanup at its next
    /// checkpoint.
    Requested,
    /// Cancellation had already been requested.
    AlreadyRequested,
    /// The job is already in cleanup or finished; nothing to do.
    NoOp,
}

/// Acknowledgement of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelAck {
    /// The job.
    pub job_id: JobId,
    /// What happened.
    pub state: CancelState,
}

pub(crate) struct Inner {
    pub(crate) config: PipelineConfig,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) queue: Arc<dyn JobQueue>,
    pub(crate) catalog: Arc<TemplateCatalog>,
    pub(crate) workers: BTreeMap<Stage, Arc<dyn StageWorker>>,
    pub(crate) gates: BTreeMap<Stage, StageGate>,
    pub(crate) classifier: Arc<dyn ErrorClassifier>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) cancellations: CancellationRegistry,
    pub(crate) outcomes: Notify,
}

impl Inner {
    pub(crate) fn gate(&self, stage: Stage) -> Result<&StageGate> {
        self.gates
            .get(&stage)
            .ok_or_else(|| PipelineError::Config(format!("no gate for {stage}")))
    }

    pub(crate) async fn emit(&self, event: PipelineEvent) {
        self.events.emit(&event).await;
    }

    /// Enqueues the message for the job's current stage and attempt.
    pub(crate) async fn enqueue_for(&self, job: &JobRecord, delay: Option<Duration>, priority: i32) -> Result<()> {
        let message = QueueMessage::for_job(job)?;
        let mut options = EnqueueOptions::new().with_priority(priority);
        if let Some(delay) = delay {
            options = options.with_delay(delay);
        }
        let message_id = self.queue.enqueue(message, options).await?;
        tracing::debug!(
            job_id = %job.id,
            stage = %job.stage,
            attempt = job.attempt(),
            message_id = %message_id,
            "Enqueued stage message"
        );
        Ok(())
    }

    /// Re-enqueues waiting jobs. With `idle`, only jobs left untouched for
    /// at least that long are considered.
    pub(crate) async fn resume(&self, idle: Option<Duration>) -> Result<usize> {
        let now = Utc::now();
        let mut resumed = 0;

        for job in self.store.list(&JobFilter::all()).await? {
            if job.outcome.is_terminal() {
                continue;
            }
            if let Some(idle) = idle {
                let touched = job.retry_at.map_or(job.updated_at, |due| due.max(job.updated_at));
                if (now - touched).to_std().unwrap_or(Duration::ZERO) < idle {
                    continue;
                }
            }
            let delay = match job.status {
                JobStatus::Retrying => Some(
                    job.retry_at
                        .and_then(|due| (due - now).to_std().ok())
                        .unwrap_or(Duration::ZERO),
                ),
                JobStatus::Queued | JobStatus::Cancelling if !job.is_held() => Some(Duration::ZERO),
                JobStatus::Active | JobStatus::Cancelling if job.lease_expired(now) => Some(Duration::ZERO),
                _ => None,
            };
            let Some(delay) = delay else { continue };

            let delay = (!delay.is_zero()).then_some(delay);
            match self.enqueue_for(&job, delay, job.priority).await {
                Ok(()) => resumed += 1,
                Err(e) => tracing::warn!(job_id = %job.id, error = %e, "Could not resume job"),
            }
        }

        if resumed > 0 {
            tracing::info!(resumed, "Resumed pending jobs");
        }
        Ok(resumed)
    }
}

/// The pipeline coordinator. Cheap to clone.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("templates", &self.inner.catalog.template_ids())
            .field("gates", &self.inner.gates)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Starts building a coordinator.
    #[must_use]
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::new()
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// The concurrency gate of a stage.
    pub fn gate(&self, stage: Stage) -> Result<&StageGate> {
        self.inner.gate(stage)
    }

    /// Validates a request and queues its pipeline.
    pub async fn submit_service(&self, spec: ServiceSpec) -> Result<JobId> {
        self.submit_with_priority(spec, 0).await
    }

    /// Like [`Coordinator::submit_service`], with a dispatch priority
    /// (lower runs first among jobs queued at the same time).
    pub async fn submit_with_priority(&self, spec: ServiceSpec, priority: i32) -> Result<JobId> {
        validate_service_name(&spec.name)?;
        let known_flags = self.inner.catalog.known_flags(&spec.template_id).map_err(|_| {
            ValidationError::new("template_id", format!("unknown template '{}'", spec.template_id))
        })?;
        spec.validate(&known_flags, &self.inner.config.allowed_envs)?;

        let job = JobRecord::new(spec).with_priority(priority);
        if let InsertResult::Conflict { existing } = self.inner.store.insert(job.clone()).await? {
            return Err(ValidationError::new(
                "name",
                format!("a pipeline for '{}' is already running (job {existing})", job.service.name),
            )
            .into());
        }

        if let Err(e) = self.inner.enqueue_for(&job, None, priority).await {
            tracing::warn!(
                job_id = %job.id,
                service = %job.service.name,
                error = %e,
                "Enqueue failed, job stays queued until resumed"
            );
        }

        tracing::info!(
            job_id = %job.id,
            service = %job.service.name,
            template_id = %job.service.template_id,
            "Submitted service"
        );
        self.inner
            .emit(PipelineEvent::new(
                EventType::JobSubmitted,
                job.id,
                job.service.name.clone(),
                Stage::Generation,
                1,
            ))
            .await;

        Ok(job.id)
    }

    /// Current status of a job.
    pub async fn get_job_status(&self, job_id: JobId) -> Result<JobStatusView> {
        Ok(self.get_job(job_id).await?.view())
    }

    /// The full record of a job, history included.
    pub async fn get_job(&self, job_id: JobId) -> Result<JobRecord> {
        self.inner
            .store
            .get(job_id)
            .await?
            .ok_or(PipelineError::JobNotFound(job_id))
    }

    /// Requests cancellation of a job.
    ///
    /// The job is marked `Cancelling` right away. A worker holding it stops
    /// at its next checkpoint; a waiting job is routed to cleanup as soon
    /// as its message is picked up.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<CancelAck> {
        loop {
            let job = self.get_job(job_id).await?;
            let ack = |state| CancelAck { job_id, state };

            if job.outcome.is_terminal() || job.stage == Stage::Cleanup {
                return Ok(ack(CancelState::NoOp));
            }
            if job.cancel_requested {
                return Ok(ack(CancelState::AlreadyRequested));
            }

            let mut updated = job.clone();
            updated.cancel_requested = true;
            updated.record(JobStatus::Cancelling, Some("cancel requested".to_string()));

            match self.inner.store.update(updated.clone(), job.version).await? {
                WriteResult::PreconditionFailed { .. } => continue,
                WriteResult::Success { .. } => {}
            }

            self.inner.cancellations.cancel(job_id, "cancel requested");
            tracing::info!(job_id = %job_id, stage = %job.stage, "Cancellation requested");

            if !updated.is_held() {
                if let Err(e) = self.inner.enqueue_for(&updated, None, CANCEL_PRIORITY).await {
                    tracing::warn!(job_id = %job_id, error = %e, "Could not enqueue cancellation");
                }
            }
            return Ok(ack(CancelState::Requested));
        }
    }

    /// Status views of the jobs matching `filter`.
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobStatusView>> {
        self.read_model().list(filter).await
    }

    /// A read-only view of the store.
    #[must_use]
    pub fn read_model(&self) -> PipelineReadModel {
        PipelineReadModel::new(self.inner.store.clone())
    }

    /// Re-enqueues messages for every job that is waiting for one.
    ///
    /// Covers queued and retrying jobs, cancelled jobs nobody holds and
    /// jobs whose holder's lease ran out. Used after a restart or after an
    /// enqueue failed. Duplicates are dropped by the dispatchers.
    pub async fn resume_pending(&self) -> Result<usize> {
        self.inner.resume(None).await
    }

    /// Waits until a job reaches its final outcome.
    pub async fn await_outcome(&self, job_id: JobId, timeout: Duration) -> Result<JobRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.outcomes.notified();
            let job = self.get_job(job_id).await?;
            if job.outcome.is_terminal() {
                return Ok(job);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                let limit_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                return Err(PipelineError::PipelineTimeout {
                    elapsed_ms: limit_ms,
                    limit_ms,
                });
            }
            let _ = tokio::time::timeout_at(deadline, notified).await;
        }
    }

    /// Starts one dispatcher per stage and the resume sweep.
    ///
    /// The sweep re-enqueues jobs that have waited a full visibility
    /// timeout without a write, so a job whose next message was lost to a
    /// broker outage is picked up again once the broker is back.
    #[must_use]
    pub fn start(&self) -> CoordinatorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks: Vec<JoinHandle<()>> = Stage::ALL
            .iter()
            .map(|&stage| tokio::spawn(dispatch::run_stage(self.inner.clone(), stage, shutdown_rx.clone())))
            .collect();
        tasks.push(tokio::spawn(dispatch::run_resume_sweep(self.inner.clone(), shutdown_rx)));

        tracing::info!("Coordinator started");
        CoordinatorHandle {
            inner: self.inner.clone(),
            shutdown_tx,
            tasks,
        }
    }
}

/// Running dispatchers. Call [`CoordinatorHandle::shutdown`] to stop them
/// and release the queue.
pub struct CoordinatorHandle {
    inner: Arc<Inner>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl CoordinatorHandle {
    /// Stops receiving, waits for in-flight stages to finish and closes
    /// the queue.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Dispatcher task failed");
            }
        }
        for gate in self.inner.gates.values() {
            gate.drain().await;
        }
        if let Err(e) = self.inner.queue.close().await {
            tracing::warn!(error = %e, "Could not close queue");
        }
        tracing::info!("Coordinator stopped");
    }
}

impl std::fmt::Debug for CoordinatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorHandle")
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Coordinator`].
///
/// Store and queue default to the in-memory implementations, the catalog
/// to the builtin templates. Every stage needs a worker, given directly or
/// built from a workspace, capabilities and a teardown.
#[derive(Default)]
pub struct CoordinatorBuilder {
    config: PipelineConfig,
    store: Option<Arc<dyn JobStore>>,
    queue: Option<Arc<dyn JobQueue>>,
    catalog: Option<TemplateCatalog>,
    classifier: Option<Arc<dyn ErrorClassifier>>,
    events: Option<Arc<dyn EventSink>>,
    workers: BTreeMap<Stage, Arc<dyn StageWorker>>,
    workspace: Option<Arc<dyn WorkspaceWriter>>,
    build: Option<Arc<dyn StageCapability>>,
    deploy: Option<Arc<dyn StageCapability>>,
    teardown: Option<Arc<dyn TeardownCapability>>,
}

impl CoordinatorBuilder {
    /// Creates a builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the job store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the queue. It is wrapped in a [`ReconnectingQueue`].
    #[must_use]
    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Uses the process-wide broker handle as the queue.
    ///
    /// The connection opens on first use and is released when the
    /// coordinator shuts down.
    #[must_use]
    pub fn with_connection(self, connection: Arc<QueueConnection>) -> Self {
        self.with_queue(connection)
    }

    /// Sets the template catalog.
    #[must_use]
    pub fn with_catalog(mut self, catalog: TemplateCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Sets the error classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Registers a worker for its stage, replacing any built one.
    #[must_use]
    pub fn with_worker(mut self, worker: Arc<dyn StageWorker>) -> Self {
        self.workers.insert(worker.stage(), worker);
        self
    }

    /// Workspace for the generation worker.
    #[must_use]
    pub fn with_workspace(mut self, workspace: Arc<dyn WorkspaceWriter>) -> Self {
        self.workspace = Some(workspace);
        self
    }

    /// Capability for the build worker.
    #[must_use]
    pub fn with_build_capability(mut self, capability: Arc<dyn StageCapability>) -> Self {
        self.build = Some(capability);
        self
    }

    /// Capability for the deployment worker.
    #[must_use]
    pub fn with_deploy_capability(mut self, capability: Arc<dyn StageCapability>) -> Self {
        self.deploy = Some(capability);
        self
    }

    /// Teardown for the cleanup worker.
    #[must_use]
    pub fn with_teardown(mut self, teardown: Arc<dyn TeardownCapability>) -> Self {
        self.teardown = Some(teardown);
        self
    }

    /// Validates the configuration and assembles the coordinator.
    pub fn build(self) -> Result<Coordinator> {
        self.config.validate()?;

        let catalog = Arc::new(self.catalog.unwrap_or_else(TemplateCatalog::builtin));
        let mut workers = self.workers;

        if let Some(workspace) = self.workspace {
            workers.entry(Stage::Generation).or_insert_with(|| {
                Arc::new(
                    GenerationWorker::new(catalog.clone(), Arc::new(TemplateEngine::new()), workspace)
                        .with_context_values(self.config.context_values.clone()),
                )
            });
        }
        if let Some(build) = self.build {
            workers
                .entry(Stage::Build)
                .or_insert_with(|| Arc::new(ExecutionWorker::build(build)));
        }
        if let Some(deploy) = self.deploy {
            workers
                .entry(Stage::Deployment)
                .or_insert_with(|| Arc::new(ExecutionWorker::deployment(deploy)));
        }
        if let Some(teardown) = self.teardown {
            workers
                .entry(Stage::Cleanup)
                .or_insert_with(|| Arc::new(CleanupWorker::new(teardown)));
        }

        if let Some(missing) = Stage::ALL.iter().find(|stage| !workers.contains_key(*stage)) {
            return Err(PipelineError::Config(format!("no worker for the {missing} stage")));
        }

        let gates = Stage::ALL
            .iter()
            .map(|&stage| (stage, StageGate::new(stage, self.config.stage(stage).concurrency)))
            .collect();

        let queue = self.queue.unwrap_or_else(|| {
            Arc::new(InMemoryJobQueue::new(self.config.queue.visibility_timeout()))
        });
        let queue: Arc<dyn JobQueue> = Arc::new(ReconnectingQueue::new(queue, self.config.queue.reconnect.clone()));

        Ok(Coordinator {
            inner: Arc::new(Inner {
                store: self.store.unwrap_or_else(|| Arc::new(InMemoryJobStore::new())),
                queue,
                catalog,
                workers,
                gates,
                classifier: self.classifier.unwrap_or_else(|| Arc::new(DefaultClassifier::new())),
                events: self.events.unwrap_or_else(|| Arc::new(NoOpEventSink)),
                cancellations: CancellationRegistry::new(),
                outcomes: Notify::new(),
                config: self.config,
            }),
        })
    }
}

impl std::fmt::Debug for CoordinatorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorBuilder")
            .field("config", &self.config)
            .field("workers", &self.workers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
