use async_trait::async_trait;
use std::sync::Arc;

use super::{StageWorker, TeardownCapability, WorkContext, WorkOutcome};
use crate::core::{JobRecord, Stage};
use crate::errors::PipelineError;

/// Tears down what a failed or cancelled pipeline left behind.
///
/// Cleanup runs for jobs that are already cancelled, so it has no
/// cancellation checkpoint.
#[derive(Debug)]
pub struct CleanupWorker {
    teardown: Arc<dyn TeardownCapability>,
}

impl CleanupWorker {
    /// Creates a worker.
    #[must_use]
    pub fn new(teardown: Arc<dyn TeardownCapability>) -> Self {
        Self { teardown }
    }
}

#[async_trait]
impl StageWorker for CleanupWorker {
    fn stage(&self) -> Stage {
        Stage::Cleanup
    }

    async fn execute(&self, job: &JobRecord, ctx: &WorkContext) -> WorkOutcome {
        let stage_reached = job.failed_stage.unwrap_or(job.stage);
        let teardown = self
            .teardown
            .teardown(&job.service, job.artifact_ref.as_ref(), stage_reached);

        match tokio::time::timeout(ctx.timeout(), teardown).await {
            Ok(Ok(())) => WorkOutcome::Success {
                artifact_ref: None,
                checksum: None,
            },
            Ok(Err(e)) => WorkOutcome::Failure(e),
            Err(_) => WorkOutcome::Failure(PipelineError::transient(format!(
                "cleanup timed out after {}ms",
                ctx.timeout().as_millis()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationToken;
    use crate::core::{ArtifactRef, ServiceSpec};
    use crate::testing::RecordingTeardown;
    use std::time::Duration;

    fn failed_job() -> JobRecord {
        let mut job = JobRecord::new(ServiceSpec::new("foo-api", "rest-api", "staging", "team-a"));
        job.artifact_ref = Some(ArtifactRef::new("workspace://foo-api/abc"));
        job.failed_stage = Some(Stage::Build);
        job.enter_stage(Stage::Cleanup);
        job
    }

    #[tokio::test]
    async fn test_tears_down_with_stage_reached() {
        let teardown = Arc::new(RecordingTeardown::new());
        let worker = CleanupWorker::new(teardown.clone());
        let ctx = WorkContext::new(Arc::new(CancellationToken::new()), Duration::from_secs(1));

        let outcome = worker.execute(&failed_job(), &ctx).await;
        assert!(outcome.is_success());

        let calls = teardown.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "foo-api");
        assert_eq!(calls[0].2, Stage::Build);
    }

    #[tokio::test]
    async fn test_ignores_cancellation() {
        let token = Arc::new(CancellationToken::new());
        token.cancel("user request");
        let worker = CleanupWorker::new(Arc::new(RecordingTeardown::new()));

        let outcome = worker
            .execute(&failed_job(), &WorkContext::new(token, Duration::from_secs(1)))
            .await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_teardown_failure_is_reported() {
        let worker = CleanupWorker::new(Arc::new(RecordingTeardown::failing()));
        let ctx = WorkContext::new(Arc::new(CancellationToken::new()), Duration::from_secs(1));

        let outcome = worker.execute(&failed_job(), &ctx).await;
        assert!(matches!(outcome, WorkOutcome::Failure(_)));
    }
}
