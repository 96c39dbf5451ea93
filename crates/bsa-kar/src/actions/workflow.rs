use async_trait::async_trait;
use tracing::debug;

use crate::action::ActionNode;
use crate::context::ProcessingContext;
use crate::error::ExecutorError;
use crate::executor::{ActionExecutor, ActionOutcome};

/// Workflow-control step with no work of its own; dependents always run.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkflowStep;

#[async_trait]
impl ActionExecutor for WorkflowStep {
    fn name(&self) -> &str {
        "workflow-step"
    }

    async fn execute(
        &self,
        ctx: &mut ProcessingContext,
        node: &ActionNode,
    ) -> Result<ActionOutcome, ExecutorError> {
        debug!(
            action_id = %node.id,
            action_type = %node.action_type,
            context_id = %ctx.id(),
            "Workflow step"
        );
        Ok(ActionOutcome::Proceed)
    }
}
