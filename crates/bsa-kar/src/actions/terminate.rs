use async_trait::async_trait;
use tracing::info;

use crate::action::ActionNode;
use crate::context::ProcessingContext;
use crate::error::ExecutorError;
use crate::executor::{ActionExecutor, ActionOutcome};

/// Ends the reporting workflow for the context. Pending resumes become no-ops.
#[derive(Debug, Clone, Copy, Default)]
pub struct Terminate;

#[async_trait]
impl ActionExecutor for Terminate {
    fn name(&self) -> &str {
        "terminate"
    }

    async fn execute(
        &self,
        ctx: &mut ProcessingContext,
        node: &ActionNode,
    ) -> Result<ActionOutcome, ExecutorError> {
        ctx.terminate();
        info!(action_id = %node.id, context_id = %ctx.id(), "Reporting workflow terminated");
        Ok(ActionOutcome::Halt)
    }
}
