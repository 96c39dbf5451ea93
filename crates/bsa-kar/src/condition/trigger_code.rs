use tracing::warn;

use super::ConditionEvaluator;
use super::filter::filter_resources;
use crate::action::{ActionNode, ConditionSpec};
use crate::context::ProcessingContext;
use crate::error::ConditionError;
use crate::matcher::TriggerCodeStatus;

/// Met when the patient data holds a resource coded within the value set of
/// an input requirement.
///
/// The expression names the requirement (`Conditions` or `%conditions`). A
/// blank expression checks every code-filtered input requirement of the node.
/// Matches are recorded as the node's trigger status.
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerCodeEvaluator;

impl ConditionEvaluator for TriggerCodeEvaluator {
    fn evaluate(
        &self,
        condition: &ConditionSpec,
        node: &ActionNode,
        ctx: &mut ProcessingContext,
    ) -> Result<bool, ConditionError> {
        let expression = condition.expression.trim();
        let requirements: Vec<_> = if expression.is_empty() {
            node.input_requirements
                .iter()
                .filter(|dr| dr.has_code_filter())
                .collect()
        } else {
            match node.input_requirement(expression) {
                Some(dr) => vec![dr],
                None => {
                    warn!(
                        action_id = %node.id,
                        expression,
                        "Trigger-code condition names no input requirement of the action"
                    );
                    return Ok(false);
                }
            }
        };

        let mut status = TriggerCodeStatus::default();
        for requirement in requirements {
            let (matched, _) = filter_resources(requirement, ctx);
            status.merge(matched);
        }

        let met = status.trigger_matched;
        ctx.record_trigger_status(&node.id, status);
        Ok(met)
    }
}
