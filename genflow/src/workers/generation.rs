use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{StageWorker, WorkContext, WorkOutcome, WorkspaceWriter};
use crate::core::{JobRecord, Stage};
use crate::errors::{PipelineError, Result};
use crate::template::{TemplateCatalog, TemplateEngine};

/// Renders the job's template and hands the tree to the workspace.
///
/// Only the artifact reference travels onward. A retried attempt that
/// renders a tree the workspace already holds reuses it instead of
/// writing again.
#[derive(Debug)]
pub struct GenerationWorker {
    catalog: Arc<TemplateCatalog>,
    engine: Arc<TemplateEngine>,
    workspace: Arc<dyn WorkspaceWriter>,
    context_values: BTreeMap<String, Value>,
}

impl GenerationWorker {
    /// Creates a worker.
    #[must_use]
    pub fn new(
        catalog: Arc<TemplateCatalog>,
        engine: Arc<TemplateEngine>,
        workspace: Arc<dyn WorkspaceWriter>,
    ) -> Self {
        Self {
            catalog,
            engine,
            workspace,
            context_values: BTreeMap::new(),
        }
    }

    /// Sets the config values exposed to templates.
    #[must_use]
    pub fn with_context_values(mut self, values: BTreeMap<String, Value>) -> Self {
        self.context_values = values;
        self
    }

    async fn generate(&self, job: &JobRecord, ctx: &WorkContext) -> Result<WorkOutcome> {
        ctx.checkpoint()?;
        let manifest = self.catalog.get(&job.service.template_id)?;
        let rendered = self.engine.render(&manifest, &job.service, &self.context_values)?;

        ctx.checkpoint()?;
        let existing = self.workspace.find(&job.service.name, &rendered.checksum).await?;
        let artifact_ref = if let Some(artifact_ref) = existing {
            tracing::info!(
                job_id = %job.id,
                service = %job.service.name,
                checksum = %rendered.checksum,
                "Artifact already written, skipping write"
            );
            artifact_ref
        } else {
            self.workspace.write(&job.service.name, &rendered.files).await?
        };

        Ok(WorkOutcome::Success {
            artifact_ref: Some(artifact_ref),
            checksum: Some(rendered.checksum),
        })
    }
}

#[async_trait]
impl StageWorker for GenerationWorker {
    fn stage(&self) -> Stage {
        Stage::Generation
    }

    async fn execute(&self, job: &JobRecord, ctx: &WorkContext) -> WorkOutcome {
        match tokio::time::timeout(ctx.timeout(), self.generate(job, ctx)).await {
            Ok(result) => WorkOutcome::from_result(result),
            Err(_) => WorkOutcome::Failure(PipelineError::transient(format!(
                "generation timed out after {}ms",
                ctx.timeout().as_millis()
            ))),
        }
    }
}
