//! Stage, job status and pipeline outcome enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One phase of the pipeline.
///
/// The derived ordering is the forward progression order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Render the template into a file tree.
    Generation,
    /// Build the generated project.
    Build,
    /// Deploy the built project.
    Deployment,
    /// Tear down whatever earlier stages produced.
    Cleanup,
}

impl Stage {
    /// All stages in progression order.
    pub const ALL: [Self; 4] = [Self::Generation, Self::Build, Self::Deployment, Self::Cleanup];

    /// Returns the stage that follows a successful completion of this one.
    ///
    /// Cleanup is only entered on failure or cancellation, so it is never
    /// returned here.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Generation => Some(Self::Build),
            Self::Build => Some(Self::Deployment),
            Self::Deployment | Self::Cleanup => None,
        }
    }

    /// Upper-case name used for environment variable overrides.
    #[must_use]
    pub const fn env_name(self) -> &'static str {
        match self {
            Self::Generation => "GENERATION",
            Self::Build => "BUILD",
            Self::Deployment => "DEPLOYMENT",
            Self::Cleanup => "CLEANUP",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generation => write!(f, "generation"),
            Self::Build => write!(f, "build"),
            Self::Deployment => write!(f, "deployment"),
            Self::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// The status of a job within its current stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker.
    Queued,
    /// A worker holds the job.
    Active,
    /// Waiting for the backoff delay before the next attempt.
    Retrying,
    /// The stage finished successfully.
    Completed,
    /// The stage failed.
    Failed,
    /// Cancellation was requested; waiting for a checkpoint.
    Cancelling,
    /// The job was cancelled.
    Cancelled,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Active => write!(f, "active"),
            Self::Retrying => write!(f, "retrying"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelling => write!(f, "cancelling"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl JobStatus {
    /// Returns true if the status is terminal for a stage.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the status counts against the one-in-flight rule.
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Active | Self::Retrying)
    }
}

/// The outcome of a pipeline run as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineOutcome {
    /// Stages are still progressing.
    Running,
    /// Deployment completed.
    Deployed,
    /// A stage failed and Cleanup finished.
    Failed,
    /// Cleanup itself exhausted its retry budget.
    FailedCleanup,
    /// Cancelled and cleaned up.
    Cancelled,
}

impl Default for PipelineOutcome {
    fn default() -> Self {
        Self::Running
    }
}

impl fmt::Display for PipelineOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Deployed => write!(f, "deployed"),
            Self::Failed => write!(f, "failed"),
            Self::FailedCleanup => write!(f, "failed_cleanup"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl PipelineOutcome {
    /// Returns true once the pipeline can no longer change.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Returns true for outcomes counted as failures by retention.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::FailedCleanup)
    }
}
