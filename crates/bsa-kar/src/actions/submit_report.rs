use std::sync::Arc;

use async_trait::async_trait;
use bsa_core::Resource;
use tracing::info;
use uuid::Uuid;

use crate::action::{ActionId, ActionNode};
use crate::context::ProcessingContext;
use crate::error::ExecutorError;
use crate::executor::{ActionExecutor, ActionOutcome};

/// One produced resource handed to the report transport.
#[derive(Debug, Clone, Copy)]
pub struct Submission<'a> {
    pub context_id: Uuid,
    pub source_action: &'a ActionId,
    pub requirement_id: &'a str,
    pub resource: &'a Resource,
}

/// Outbound report transport.
#[async_trait]
pub trait ReportSubmitter: Send + Sync {
    async fn submit(&self, submission: Submission<'_>) -> Result<(), ExecutorError>;
}

/// Submitter that only logs what would be sent.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSubmitter;

#[async_trait]
impl ReportSubmitter for LoggingSubmitter {
    async fn submit(&self, submission: Submission<'_>) -> Result<(), ExecutorError> {
        info!(
            context_id = %submission.context_id,
            source_action = %submission.source_action,
            requirement = submission.requirement_id,
            resource = %submission.resource.key(),
            "Report submitted"
        );
        Ok(())
    }
}

/// Submits every resource produced by other actions of the context.
pub struct SubmitReport {
    submitter: Arc<dyn ReportSubmitter>,
}

impl SubmitReport {
    pub fn new(submitter: Arc<dyn ReportSubmitter>) -> Self {
        Self { submitter }
    }
}

#[async_trait]
impl ActionExecutor for SubmitReport {
    fn name(&self) -> &str {
        "submit-report"
    }

    async fn execute(
        &self,
        ctx: &mut ProcessingContext,
        node: &ActionNode,
    ) -> Result<ActionOutcome, ExecutorError> {
        let context_id = ctx.id();
        let mut submitted = 0;
        for (source_action, outputs) in ctx.output_resources() {
            if *source_action == node.id {
                continue;
            }
            for (requirement_id, resource) in outputs {
                self.submitter
                    .submit(Submission {
                        context_id,
                        source_action,
                        requirement_id,
                        resource,
                    })
                    .await?;
                submitted += 1;
            }
        }

        info!(action_id = %node.id, context_id = %context_id, submitted, "Report submission finished");
        Ok(ActionOutcome::Proceed)
    }
}
