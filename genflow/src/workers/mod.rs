//! Stage workers and the collaborator seams they call into.
//!
//! Workers share one contract: [`StageWorker::execute`] takes a job and
//! returns a [`WorkOutcome`]. They never write to the job store; the
//! coordinator records every outcome before deciding what happens next.
//!
//! Physical work is delegated:
//!
//! - [`WorkspaceWriter`] stores rendered trees and hands back references
//! - [`Executor`] runs one command in a working directory
//! - [`StageCapability`] is the build or deploy step of an artifact
//! - [`TeardownCapability`] removes whatever a pipeline produced

mod cleanup;
mod execution;
mod generation;
mod process;
mod workspace;

pub use cleanup::CleanupWorker;
pub use execution::{CommandCapability, ExecutionWorker};
pub use generation::GenerationWorker;
pub use process::LocalProcessExecutor;
pub use workspace::FsWorkspace;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::core::{ArtifactRef, FileTree, JobRecord, ServiceSpec, Stage};
use crate::errors::{PipelineError, Result};

/// Per-execution context handed to a worker.
#[derive(Debug, Clone)]
pub struct WorkContext {
    cancel: Arc<CancellationToken>,
    timeout: Duration,
}

impl WorkContext {
    /// Creates a context.
    #[must_use]
    pub fn new(cancel: Arc<CancellationToken>, timeout: Duration) -> Self {
        Self { cancel, timeout }
    }

    /// Fails with `Cancelled` if cancellation was requested.
    ///
    /// Called at the start of every unit of work.
    pub fn checkpoint(&self) -> Result<()> {
        self.cancel.check()
    }

    /// The job's cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The stage timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// What a worker reports back.
#[derive(Debug)]
pub enum WorkOutcome {
    /// The stage finished.
    Success {
        /// The stage output.
        artifact_ref: Option<ArtifactRef>,
        /// Checksum of a generated tree.
        checksum: Option<String>,
    },
    /// The stage failed; the coordinator classifies the error.
    Failure(PipelineError),
    /// The worker stopped at a cancellation checkpoint.
    Cancelled(String),
}

impl WorkOutcome {
    /// A success carrying an artifact.
    #[must_use]
    pub fn produced(artifact_ref: ArtifactRef) -> Self {
        Self::Success {
            artifact_ref: Some(artifact_ref),
            checksum: None,
        }
    }

    /// Maps a worker result, turning `Cancelled` errors into the
    /// `Cancelled` outcome.
    #[must_use]
    pub fn from_result(result: Result<Self>) -> Self {
        match result {
            Ok(outcome) => outcome,
            Err(PipelineError::Cancelled(reason)) => Self::Cancelled(reason),
            Err(e) => Self::Failure(e),
        }
    }

    /// Returns true for `Success`.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Short label for logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Failure(_) => "failure",
            Self::Cancelled(_) => "cancelled",
        }
    }
}

/// Worker for one stage.
#[async_trait]
pub trait StageWorker: Send + Sync + Debug {
    /// The stage this worker runs.
    fn stage(&self) -> Stage;

    /// Executes the job's current stage.
    async fn execute(&self, job: &JobRecord, ctx: &WorkContext) -> WorkOutcome;
}

/// Stores rendered trees.
#[async_trait]
pub trait WorkspaceWriter: Send + Sync + Debug {
    /// Writes a tree and returns its reference.
    async fn write(&self, service_name: &str, tree: &FileTree) -> Result<ArtifactRef>;

    /// Reads a tree back.
    async fn read(&self, artifact_ref: &ArtifactRef) -> Result<FileTree>;

    /// Finds a previously written tree by checksum.
    async fn find(&self, service_name: &str, checksum: &str) -> Result<Option<ArtifactRef>>;

    /// Local directory of an artifact, if the workspace is on disk.
    fn local_path(&self, _artifact_ref: &ArtifactRef) -> Option<PathBuf> {
        None
    }
}

/// One command for an [`Executor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program to run.
    pub program: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    /// Creates a command without arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Appends an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Result of running a command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    /// Exit code; -1 if the process was killed by a signal.
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl ExecOutput {
    /// A successful run.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed run.
    #[must_use]
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Returns true on exit code 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs commands. Timeouts surface as `TransientExecution` errors.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs `command` in `workdir`, giving up after `timeout`.
    async fn run(&self, command: &CommandSpec, workdir: &Path, timeout: Duration) -> Result<ExecOutput>;
}

/// The build or deploy step for an artifact.
#[async_trait]
pub trait StageCapability: Send + Sync + Debug {
    /// Processes `artifact` and returns the resulting reference.
    async fn invoke(&self, spec: &ServiceSpec, artifact: &ArtifactRef, ctx: &WorkContext) -> Result<ArtifactRef>;
}

/// Removes whatever a pipeline produced.
///
/// Must succeed on an already clean target.
#[async_trait]
pub trait TeardownCapability: Send + Sync + Debug {
    /// Tears down `artifact` for a pipeline that reached `stage_reached`.
    async fn teardown(
        &self,
        spec: &ServiceSpec,
        artifact: Option<&ArtifactRef>,
        stage_reached: Stage,
    ) -> Result<()>;
}
