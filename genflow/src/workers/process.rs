use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use super::{CommandSpec, ExecOutput, Executor};
use crate::errors::{PipelineError, Result};

/// Runs commands as local child processes.
///
/// The child is killed when the timeout elapses.
#[derive(Debug, Clone, Default)]
pub struct LocalProcessExecutor;

impl LocalProcessExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Executor for LocalProcessExecutor {
    async fn run(&self, command: &CommandSpec, workdir: &Path, timeout: Duration) -> Result<ExecOutput> {
        let child = Command::new(&command.program)
            .args(&command.args)
            .envs(&command.env)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Dropping the output future on timeout drops the child, which kills it.
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                PipelineError::transient(format!(
                    "'{command}' timed out after {}ms",
                    timeout.as_millis()
                ))
            })??;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
