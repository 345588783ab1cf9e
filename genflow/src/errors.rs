//! Error types for the genflow pipeline engine.
//!
//! Every failure that can reach the job store is expressed as a
//! [`PipelineError`]. Retry decisions never look at error strings; they go
//! through an [`ErrorClassifier`] which maps each variant to an
//! [`ErrorClass`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

use crate::core::{JobId, Stage};

/// Convenience alias used across the crate.
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// The main error type for pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A service specification was malformed.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// Rendering a template failed.
    #[error("{0}")]
    Template(#[from] TemplateError),

    /// A timeout or transient resource contention.
    #[error("Transient execution error: {reason}")]
    TransientExecution {
        /// What went wrong.
        reason: String,
    },

    /// The executor ran the command but it exited non-zero.
    #[error("Executor failure (exit code {exit_code}): {stderr}")]
    ExecutorFailure {
        /// The process exit code.
        exit_code: i32,
        /// Tail of the process stderr.
        stderr: String,
    },

    /// The broker could not be reached.
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    /// An optimistic update was rejected.
    #[error("Version conflict on job {job_id}: expected {expected}, found {actual}")]
    VersionConflict {
        /// The job being updated.
        job_id: JobId,
        /// The version the writer held.
        expected: u64,
        /// The version currently stored.
        actual: u64,
    },

    /// No job exists with the given id.
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// Work was abandoned at a cancellation checkpoint.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The job exceeded the overall pipeline timeout.
    #[error("Pipeline timeout exceeded after {elapsed_ms}ms (limit {limit_ms}ms)")]
    PipelineTimeout {
        /// How long the job has existed.
        elapsed_ms: u64,
        /// The configured limit.
        limit_ms: u64,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The job store failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl PipelineError {
    /// Creates a transient execution error.
    #[must_use]
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::TransientExecution {
            reason: reason.into(),
        }
    }

    /// Creates an executor failure, keeping only the tail of stderr.
    #[must_use]
    pub fn executor_failure(exit_code: i32, stderr: &str) -> Self {
        Self::ExecutorFailure {
            exit_code,
            stderr: tail(stderr, STDERR_TAIL_BYTES),
        }
    }

    /// Creates a store error.
    #[must_use]
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Returns the stable kind tag for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Template(_) => ErrorKind::Template,
            Self::TransientExecution { .. } => ErrorKind::TransientExecution,
            Self::ExecutorFailure { .. } => ErrorKind::ExecutorFailure,
            Self::QueueUnavailable(_) => ErrorKind::QueueUnavailable,
            Self::VersionConflict { .. } => ErrorKind::VersionConflict,
            Self::JobNotFound(_) => ErrorKind::JobNotFound,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::PipelineTimeout { .. } => ErrorKind::PipelineTimeout,
            Self::Config(_) => ErrorKind::Config,
            Self::Store(_) => ErrorKind::Store,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Io(_) => ErrorKind::Io,
        }
    }
}

const STDERR_TAIL_BYTES: usize = 2048;

fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// Stable, serializable tag for a [`PipelineError`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`PipelineError::Validation`].
    Validation,
    /// See [`PipelineError::Template`].
    Template,
    /// See [`PipelineError::TransientExecution`].
    TransientExecution,
    /// See [`PipelineError::ExecutorFailure`].
    ExecutorFailure,
    /// See [`PipelineError::QueueUnavailable`].
    QueueUnavailable,
    /// See [`PipelineError::VersionConflict`].
    VersionConflict,
    /// See [`PipelineError::JobNotFound`].
    JobNotFound,
    /// See [`PipelineError::Cancelled`].
    Cancelled,
    /// See [`PipelineError::PipelineTimeout`].
    PipelineTimeout,
    /// See [`PipelineError::Config`].
    Config,
    /// See [`PipelineError::Store`].
    Store,
    /// See [`PipelineError::Serialization`].
    Serialization,
    /// See [`PipelineError::Io`].
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validation => "validation",
            Self::Template => "template",
            Self::TransientExecution => "transient_execution",
            Self::ExecutorFailure => "executor_failure",
            Self::QueueUnavailable => "queue_unavailable",
            Self::VersionConflict => "version_conflict",
            Self::JobNotFound => "job_not_found",
            Self::Cancelled => "cancelled",
            Self::PipelineTimeout => "pipeline_timeout",
            Self::Config => "config",
            Self::Store => "store",
            Self::Serialization => "serialization",
            Self::Io => "io",
        };
        f.write_str(name)
    }
}

/// Error raised when a service specification is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Validation failed for '{field}': {message}")]
pub struct ValidationError {
    /// The offending field.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl ValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Errors raised while composing a template.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// A template referenced a variable that is not in the context.
    #[error("Template '{file}' references undefined variable '{variable}'")]
    MissingVariable {
        /// The manifest path of the file being rendered.
        file: String,
        /// The missing variable.
        variable: String,
    },

    /// The manifest itself is invalid.
    #[error("Malformed manifest: {reason}")]
    MalformedManifest {
        /// Why the manifest was rejected.
        reason: String,
    },

    /// No manifest is registered under the template id.
    #[error("Unknown template: {template_id}")]
    UnknownTemplate {
        /// The requested template id.
        template_id: String,
    },

    /// An inclusion predicate could not be parsed.
    #[error("Invalid predicate '{expression}': {reason}")]
    InvalidPredicate {
        /// The textual predicate.
        expression: String,
        /// Parse failure details.
        reason: String,
    },

    /// Any other render failure.
    #[error("Failed to render '{file}': {message}")]
    Render {
        /// The manifest path of the file being rendered.
        file: String,
        /// Renderer message.
        message: String,
    },
}

impl TemplateError {
    /// Creates a malformed manifest error.
    #[must_use]
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedManifest {
            reason: reason.into(),
        }
    }
}

/// Whether a failure may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retry within the stage's attempt budget.
    Retryable,
    /// Fail the stage immediately.
    Terminal,
}

/// Maps errors to retry classes.
pub trait ErrorClassifier: Send + Sync + fmt::Debug {
    /// Classifies an error.
    fn classify(&self, error: &PipelineError) -> ErrorClass;
}

/// The standard classification.
///
/// Timeouts, contention, non-zero exits and broker loss are retryable;
/// everything else is terminal. Exit codes listed in
/// `terminal_exit_codes` are treated as terminal even though they come from
/// the executor.
#[derive(Debug, Clone, Default)]
pub struct DefaultClassifier {
    terminal_exit_codes: BTreeSet<i32>,
}

impl DefaultClassifier {
    /// Creates the default classifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks an executor exit code as terminal.
    #[must_use]
    pub fn with_terminal_exit_code(mut self, code: i32) -> Self {
        self.terminal_exit_codes.insert(code);
        self
    }
}

impl ErrorClassifier for DefaultClassifier {
    fn classify(&self, error: &PipelineError) -> ErrorClass {
        match error {
            PipelineError::ExecutorFailure { exit_code, .. } => {
                if self.terminal_exit_codes.contains(exit_code) {
                    ErrorClass::Terminal
                } else {
                    ErrorClass::Retryable
                }
            }
            PipelineError::TransientExecution { .. }
            | PipelineError::QueueUnavailable(_)
            | PipelineError::Io(_) => ErrorClass::Retryable,
            PipelineError::Validation(_)
            | PipelineError::Template(_)
            | PipelineError::VersionConflict { .. }
            | PipelineError::JobNotFound(_)
            | PipelineError::Cancelled(_)
            | PipelineError::PipelineTimeout { .. }
            | PipelineError::Config(_)
            | PipelineError::Store(_)
            | PipelineError::Serialization(_) => ErrorClass::Terminal,
        }
    }
}

/// A failure as persisted on a job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    /// Error kind.
    pub kind: ErrorKind,
    /// Human readable message.
    pub message: String,
    /// Whether the classifier considered it retryable.
    pub retryable: bool,
    /// The stage the error happened in.
    pub stage: Stage,
    /// The attempt the error happened on.
    pub attempt: u32,
}

impl JobError {
    /// Flattens a pipeline error for storage.
    #[must_use]
    pub fn from_error(error: &PipelineError, class: ErrorClass, stage: Stage, attempt: u32) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            retryable: class == ErrorClass::Retryable,
            stage,
            attempt,
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_message() {
        let err = ValidationError::new("name", "must start with a letter");
        assert_eq!(
            err.to_string(),
            "Validation failed for 'name': must start with a letter"
        );
    }

    #[test]
    fn test_missing_variable_names_file_and_variable() {
        let err = TemplateError::MissingVariable {
            file: "src/app.py".to_string(),
            variable: "db_url".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("src/app.py"));
        assert!(msg.contains("db_url"));
    }

    #[test]
    fn test_default_classifier() {
        let classifier = DefaultClassifier::new();

        assert_eq!(
            classifier.classify(&PipelineError::transient("timeout")),
            ErrorClass::Retryable
        );
        assert_eq!(
            classifier.classify(&PipelineError::executor_failure(1, "boom")),
            ErrorClass::Retryable
        );
        assert_eq!(
            classifier.classify(&ValidationError::new("name", "bad").into()),
            ErrorClass::Terminal
        );
        assert_eq!(
            classifier.classify(&TemplateError::malformed("empty path").into()),
            ErrorClass::Terminal
        );
    }

    #[test]
    fn test_terminal_exit_code_override() {
        let classifier = DefaultClassifier::new().with_terminal_exit_code(127);

        assert_eq!(
            classifier.classify(&PipelineError::executor_failure(127, "not found")),
            ErrorClass::Terminal
        );
        assert_eq!(
            classifier.classify(&PipelineError::executor_failure(1, "flaky")),
            ErrorClass::Retryable
        );
    }

    #[test]
    fn test_executor_failure_keeps_stderr_tail() {
        let long = "x".repeat(STDERR_TAIL_BYTES + 100);
        match PipelineError::executor_failure(2, &long) {
            PipelineError::ExecutorFailure { stderr, .. } => {
                assert_eq!(stderr.len(), STDERR_TAIL_BYTES);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_job_error_from_error() {
        let err = PipelineError::transient("executor timed out");
        let job_error = JobError::from_error(&err, ErrorClass::Retryable, Stage::Build, 2);

        assert_eq!(job_error.kind, ErrorKind::TransientExecution);
        assert!(job_error.retryable);
        assert_eq!(job_error.attempt, 2);
        assert!(job_error.to_string().starts_with("[transient_execution]"));
    }
}
