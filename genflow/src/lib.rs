//! # Genflow
//!
//! A pipeline coordination engine that turns a service request into a
//! generated, built and deployed project.
//!
//! Every request becomes a job that moves through four stages:
//!
//! - **Generation**: render the project tree from a template manifest
//! - **Build**: run the build capability against the generated artifact
//! - **Deployment**: run the deploy capability
//! - **Cleanup**: tear down partial work after a failure or cancellation
//!
//! Stages are decoupled by a durable queue and bounded by per-stage
//! concurrency limits. Retries follow each stage's backoff policy, and
//! every state change is a version-checked write to the job store.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use genflow::prelude::*;
//!
//! let mut config = PipelineConfig::default();
//! config.apply_env_overrides()?;
//!
//! let workspace = Arc::new(FsWorkspace::new("/var/lib/genflow"));
//! let coordinator = Coordinator::builder()
//!     .with_config(config)
//!     .with_workspace(workspace.clone())
//!     .with_build_capability(build)
//!     .with_deploy_capability(deploy)
//!     .with_teardown(workspace)
//!     .build()?;
//!
//! let handle = coordinator.start();
//! let job_id = coordinator
//!     .submit_service(ServiceSpec::new("foo-api", "rest-api", "staging", "team-a").with_flag("redis"))
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod errors;
pub mod events;
pub mod queue;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod template;
pub mod testing;
pub mod workers;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{CancellationRegistry, CancellationToken};
    pub use crate::config::{PipelineConfig, QueueConfig, RetentionConfig, StageConfig};
    pub use crate::coordinator::{CancelAck, CancelState, Coordinator, CoordinatorBuilder, CoordinatorHandle};
    pub use crate::core::{
        ArtifactRef, FileTree, JobId, JobRecord, JobStatus, JobStatusView, PipelineOutcome, ServiceSpec, Stage,
    };
    pub use crate::errors::{
        DefaultClassifier, ErrorClass, ErrorClassifier, ErrorKind, JobError, PipelineError, Result,
        TemplateError, ValidationError,
    };
    pub use crate::events::{EventSink, EventType, LoggingEventSink, NoOpEventSink, PipelineEvent};
    pub use crate::queue::{InMemoryJobQueue, JobQueue, QueueConnection, QueueMessage, ReconnectingQueue};
    pub use crate::retry::{BackoffStrategy, RetryPolicy};
    pub use crate::store::{InMemoryJobStore, JobFilter, JobStore, PipelineReadModel, PipelineSummary};
    pub use crate::telemetry::{init_tracing, LogFormat};
    pub use crate::template::{TemplateCatalog, TemplateEngine, TemplateManifest};
    pub use crate::workers::{
        CommandCapability, CommandSpec, FsWorkspace, LocalProcessExecutor, StageCapability, StageWorker,
        TeardownCapability, WorkspaceWriter,
    };
    pub use std::sync::Arc;
}
