//! Condition evaluation.
//!
//! Evaluators are selected by [`ProcessorKind`] through a [`ConditionRegistry`].
//! A node's gate is the AND of all its conditions, every condition evaluated.

mod expression;
mod filter;
mod trigger_code;

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::action::{ActionNode, ConditionSpec, ProcessorKind};
use crate::context::ProcessingContext;
use crate::error::ConditionError;

pub use expression::{Expression, FhirPathEvaluator};
pub use filter::{filter_resources, requirement_resources};
pub use trigger_code::TriggerCodeEvaluator;

/// Evaluates one condition of a node against the processing context.
///
/// Evaluators may record trigger-code matches in the context but must not
/// depend on anything outside it.
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(
        &self,
        condition: &ConditionSpec,
        node: &ActionNode,
        ctx: &mut ProcessingContext,
    ) -> Result<bool, ConditionError>;
}

/// Registry of condition evaluators by processor kind.
#[derive(Clone, Default)]
pub struct ConditionRegistry {
    evaluators: HashMap<ProcessorKind, Arc<dyn ConditionEvaluator>>,
}

impl ConditionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in FHIRPath and trigger-code evaluators.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ProcessorKind::FhirPath, Arc::new(FhirPathEvaluator));
        registry.register(ProcessorKind::TriggerCode, Arc::new(TriggerCodeEvaluator));
        registry
    }

    pub fn register(&mut self, kind: ProcessorKind, evaluator: Arc<dyn ConditionEvaluator>) {
        self.evaluators.insert(kind, evaluator);
    }

    pub fn contains(&self, kind: ProcessorKind) -> bool {
        self.evaluators.contains_key(&kind)
    }

    pub fn get(&self, kind: ProcessorKind) -> Option<&Arc<dyn ConditionEvaluator>> {
        self.evaluators.get(&kind)
    }

    /// Evaluate one condition, failing closed on errors and panics.
    pub fn evaluate(
        &self,
        condition: &ConditionSpec,
        node: &ActionNode,
        ctx: &mut ProcessingContext,
    ) -> bool {
        let Some(evaluator) = self.evaluators.get(&condition.processor) else {
            warn!(
                action_id = %node.id,
                processor = %condition.processor,
                "No evaluator registered for condition processor, treating as not met"
            );
            return false;
        };

        let result = catch_unwind(AssertUnwindSafe(|| evaluator.evaluate(condition, node, ctx)));
        match result {
            Ok(Ok(met)) => met,
            Ok(Err(e)) => {
                warn!(
                    action_id = %node.id,
                    processor = %condition.processor,
                    expression = %condition.expression,
                    error = %e,
                    "Condition evaluation failed, treating as not met"
                );
                false
            }
            Err(_) => {
                warn!(
                    action_id = %node.id,
                    processor = %condition.processor,
                    expression = %condition.expression,
                    "Condition evaluator panicked, treating as not met"
                );
                false
            }
        }
    }

    /// AND of all conditions of `node`. Every condition is evaluated even
    /// after one fails. An empty list is met.
    pub fn conditions_met(&self, node: &ActionNode, ctx: &mut ProcessingContext) -> bool {
        let mut all_met = true;
        for condition in &node.conditions {
            let met = self.evaluate(condition, node, ctx);
            debug!(
                action_id = %node.id,
                processor = %condition.processor,
                expression = %condition.expression,
                met,
                "Condition evaluated"
            );
            all_met &= met;
        }
        all_met
    }
}

impl std::fmt::Debug for ConditionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionRegistry")
            .field("processors", &self.evaluators.keys().collect::<Vec<_>>())
            .finish()
    }
}
