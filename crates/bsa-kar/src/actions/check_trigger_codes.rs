use async_trait::async_trait;
use bsa_core::Resource;
use serde_json::json;
use tracing::info;

use crate::action::ActionNode;
use crate::condition::filter_resources;
use crate::context::ProcessingContext;
use crate::error::ExecutorError;
use crate::executor::{ActionExecutor, ActionOutcome};
use crate::matcher::TriggerCodeStatus;

/// Matches the patient's data against the code filters of the action's input
/// requirements.
///
/// Matching resources are recorded as a collection bundle under the
/// requirement id. Dependents run only when some trigger code matched.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckTriggerCodes;

#[async_trait]
impl ActionExecutor for CheckTriggerCodes {
    fn name(&self) -> &str {
        "check-trigger-codes"
    }

    async fn execute(
        &self,
        ctx: &mut ProcessingContext,
        node: &ActionNode,
    ) -> Result<ActionOutcome, ExecutorError> {
        let mut status = TriggerCodeStatus::default();

        for requirement in node.input_requirements.iter().filter(|dr| dr.has_code_filter()) {
            let (matched_status, matched) = filter_resources(requirement, ctx);
            status.merge(matched_status);
            if !matched.is_empty() {
                ctx.set_output(&node.id, requirement.id.clone(), collection(matched)?);
            }
        }

        let triggered = status.trigger_matched;
        info!(
            action_id = %node.id,
            triggered,
            codes = ?status.code_tokens(),
            values = ?status.value_tokens(),
            "Trigger code check finished"
        );
        ctx.record_trigger_status(&node.id, status);

        Ok(if triggered {
            ActionOutcome::Proceed
        } else {
            ActionOutcome::Halt
        })
    }
}

fn collection(resources: Vec<Resource>) -> Result<Resource, ExecutorError> {
    let entries: Vec<_> = resources
        .into_iter()
        .map(|r| json!({ "resource": r.into_value() }))
        .collect();
    Resource::from_value(json!({
        "resourceType": "Bundle",
        "type": "collection",
        "entry": entries,
    }))
    .map_err(|e| ExecutorError::Failed(e.to_string()))
}
