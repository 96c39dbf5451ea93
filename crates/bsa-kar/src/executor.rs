//! Action-type executors and their registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::action::{ActionNode, ActionType};
use crate::actions::{CheckTriggerCodes, CollectData, EhrQueryService, ReportSubmitter, SubmitReport, Terminate, WorkflowStep};
use crate::context::ProcessingContext;
use crate::error::ExecutorError;

/// What the engine does with a node's dependents after it executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Run sub-actions and related actions.
    Proceed,
    /// The node completed but its dependents must not run.
    Halt,
}

/// Performs the work of one action type.
///
/// Executors write what they produce into the context's output resources.
/// An error marks the node failed and stops its dependents; siblings are
/// unaffected.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(
        &self,
        ctx: &mut ProcessingContext,
        node: &ActionNode,
    ) -> Result<ActionOutcome, ExecutorError>;
}

#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<ActionType, Arc<dyn ActionExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in executors for workflow control, trigger-code checking,
    /// termination, data collection and report submission.
    ///
    /// Measure evaluation, report creation and validation are left to the
    /// embedding application.
    pub fn builtin(
        ehr: Arc<dyn EhrQueryService>,
        submitter: Arc<dyn ReportSubmitter>,
    ) -> Self {
        let mut registry = Self::new();
        for action_type in [
            ActionType::InitiateReportingWorkflow,
            ActionType::ExecuteReportingWorkflow,
            ActionType::EvaluateCondition,
            ActionType::CompleteReporting,
            ActionType::ExtendReporting,
        ] {
            registry.register(action_type, Arc::new(WorkflowStep));
        }
        registry.register(ActionType::CheckTriggerCodes, Arc::new(CheckTriggerCodes));
        registry.register(ActionType::Terminate, Arc::new(Terminate));
        registry.register(ActionType::CollectData, Arc::new(CollectData::new(ehr)));
        registry.register(ActionType::SubmitReport, Arc::new(SubmitReport::new(submitter)));
        registry
    }

    pub fn register(&mut self, action_type: ActionType, executor: Arc<dyn ActionExecutor>) {
        self.executors.insert(action_type, executor);
    }

    pub fn get(&self, action_type: ActionType) -> Option<&Arc<dyn ActionExecutor>> {
        self.executors.get(&action_type)
    }

    pub fn contains(&self, action_type: ActionType) -> bool {
        self.executors.contains_key(&action_type)
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self
            .executors
            .iter()
            .map(|(t, e)| format!("{t}={}", e.name()))
            .collect();
        names.sort();
        f.debug_struct("ExecutorRegistry").field("executors", &names).finish()
    }
}
