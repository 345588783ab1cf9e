//! Build and deployment workers.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

use super::{CommandSpec, Executor, StageCapability, StageWorker, WorkContext, WorkOutcome, WorkspaceWriter};
use crate::core::{ArtifactRef, JobRecord, ServiceSpec, Stage};
use crate::errors::{PipelineError, Result, ValidationError};

/// Runs a [`StageCapability`] under the stage timeout.
///
/// The worker only enforces the timeout and reports the result; the
/// capability does the actual building or deploying.
#[derive(Debug)]
pub struct ExecutionWorker {
    stage: Stage,
    capability: Arc<dyn StageCapability>,
}

impl ExecutionWorker {
    /// Worker for the build stage.
    #[must_use]
    pub fn build(capability: Arc<dyn StageCapability>) -> Self {
        Self {
            stage: Stage::Build,
            capability,
        }
    }

    /// Worker for the deployment stage.
    #[must_use]
    pub fn deployment(capability: Arc<dyn StageCapability>) -> Self {
        Self {
            stage: Stage::Deployment,
            capability,
        }
    }
}

#[async_trait]
impl StageWorker for ExecutionWorker {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn execute(&self, job: &JobRecord, ctx: &WorkContext) -> WorkOutcome {
        let Some(artifact) = job.artifact_ref.as_ref() else {
            return WorkOutcome::Failure(
                ValidationError::new("artifact_ref", format!("{} requires an artifact", self.stage)).into(),
            );
        };

        let invocation = self.capability.invoke(&job.service, artifact, ctx);
        match tokio::time::timeout(ctx.timeout(), invocation).await {
            Ok(result) => WorkOutcome::from_result(result.map(WorkOutcome::produced)),
            Err(_) => WorkOutcome::Failure(PipelineError::transient(format!(
                "{} timed out after {}ms",
                self.stage,
                ctx.timeout().as_millis()
            ))),
        }
    }
}

/// A capability that runs a fixed list of commands in the artifact's
/// working directory.
///
/// Cancellation is checked before each command. The first non-zero exit
/// fails the invocation with `ExecutorFailure`. Each command also gets
/// `GENFLOW_SERVICE` and `GENFLOW_ENV` in its environment.
pub struct CommandCapability {
    executor: Arc<dyn Executor>,
    workspace: Arc<dyn WorkspaceWriter>,
    commands: Vec<CommandSpec>,
    default_workdir: PathBuf,
}

impl CommandCapability {
    /// Creates a capability.
    #[must_use]
    pub fn new(
        executor: Arc<dyn Executor>,
        workspace: Arc<dyn WorkspaceWriter>,
        commands: Vec<CommandSpec>,
    ) -> Self {
        Self {
            executor,
            workspace,
            commands,
            default_workdir: PathBuf::from("."),
        }
    }

    /// Working directory used when the workspace has no local path.
    #[must_use]
    pub fn with_default_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.default_workdir = workdir.into();
        self
    }
}

impl std::fmt::Debug for CommandCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandCapability")
            .field("commands", &self.commands)
            .field("default_workdir", &self.default_workdir)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StageCapability for CommandCapability {
    async fn invoke(&self, spec: &ServiceSpec, artifact: &ArtifactRef, ctx: &WorkContext) -> Result<ArtifactRef> {
        let workdir = self
            .workspace
            .local_path(artifact)
            .unwrap_or_else(|| self.default_workdir.clone());

        for command in &self.commands {
            ctx.checkpoint()?;

            let command = command
                .clone()
                .env("GENFLOW_SERVICE", spec.name.as_str())
                .env("GENFLOW_ENV", spec.target_env.as_str());
            tracing::debug!(service = %spec.name, command = %command, workdir = %workdir.display(), "Running command");

            let output = self.executor.run(&command, &workdir, ctx.timeout()).await?;
            if !output.success() {
                return Err(PipelineError::executor_failure(output.exit_code, &output.stderr));
            }
        }

        Ok(artifact.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationToken;
    use crate::testing::{BlockingCapability, InMemoryWorkspace, ScriptedCapability};
    use crate::workers::{ExecOutput, MockExecutor};
    use mockall::predicate::always;
    use mockall::Sequence;
    use std::time::Duration;

    fn job_with_artifact() -> JobRecord {
        let mut job = JobRecord::new(ServiceSpec::new("foo-api", "rest-api", "staging", "team-a"));
        job.artifact_ref = Some(ArtifactRef::new("workspace://foo-api/abc"));
        job.enter_stage(Stage::Build);
        job
    }

    fn ctx(timeout: Duration) -> WorkContext {
        WorkContext::new(Arc::new(CancellationToken::new()), timeout)
    }

    fn commands() -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("npm").arg("ci"),
            CommandSpec::new("npm").args(["run", "build"]),
        ]
    }

    #[tokio::test]
    async fn test_missing_artifact_is_validation_failure() {
        let worker = ExecutionWorker::build(Arc::new(ScriptedCapability::new()));
        let job = JobRecord::new(ServiceSpec::new("foo-api", "rest-api", "staging", "team-a"));

        let outcome = worker.execute(&job, &ctx(Duration::from_secs(1))).await;
        assert!(matches!(outcome, WorkOutcome::Failure(PipelineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let worker = ExecutionWorker::deployment(Arc::new(BlockingCapability::new()));

        let outcome = worker.execute(&job_with_artifact(), &ctx(Duration::from_millis(20))).await;
        assert!(matches!(
            outcome,
            WorkOutcome::Failure(PipelineError::TransientExecution { .. })
        ));
    }

    #[tokio::test]
    async fn test_success_reports_artifact() {
        let worker = ExecutionWorker::build(Arc::new(ScriptedCapability::new()));
        let outcome = worker.execute(&job_with_artifact(), &ctx(Duration::from_secs(1))).await;

        assert!(matches!(
            outcome,
            WorkOutcome::Success { artifact_ref: Some(ref a), .. } if a.as_str() == "workspace://foo-api/abc"
        ));
    }

    #[tokio::test]
    async fn test_commands_run_in_order() {
        let mut executor = MockExecutor::new();
        let mut seq = Sequence::new();
        executor
            .expect_run()
            .withf(|command, _, _| command.args == ["ci"])
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(ExecOutput::ok("installed")));
        executor
            .expect_run()
            .withf(|command, _, _| {
                command.args == ["run", "build"]
                    && command.env.get("GENFLOW_SERVICE").map(String::as_str) == Some("foo-api")
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(ExecOutput::ok("built")));

        let capability = CommandCapability::new(Arc::new(executor), Arc::new(InMemoryWorkspace::new()), commands());
        let job = job_with_artifact();
        let artifact = job.artifact_ref.clone().unwrap();

        let result = capability
            .invoke(&job.service, &artifact, &ctx(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(result, artifact);
    }

    #[tokio::test]
    async fn test_non_zero_exit_stops() {
        let mut executor = MockExecutor::new();
        executor
            .expect_run()
            .with(always(), always(), always())
            .times(1)
            .returning(|_, _, _| Ok(ExecOutput::failed(2, "npm ERR! missing script")));

        let capability = CommandCapability::new(Arc::new(executor), Arc::new(InMemoryWorkspace::new()), commands());
        let job = job_with_artifact();

        let err = capability
            .invoke(&job.service, job.artifact_ref.as_ref().unwrap(), &ctx(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ExecutorFailure { exit_code: 2, .. }));
    }

    #[tokio::test]
    async fn test_cancel_checked_before_each_command() {
        let mut executor = MockExecutor::new();
        executor.expect_run().times(0);

        let capability = CommandCapability::new(Arc::new(executor), Arc::new(InMemoryWorkspace::new()), commands());
        let token = Arc::new(CancellationToken::new());
        token.cancel("user request");
        let ctx = WorkContext::new(token, Duration::from_secs(1));
        let job = job_with_artifact();

        let err = capability
            .invoke(&job.service, job.artifact_ref.as_ref().unwrap(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled(_)));
    }
}
