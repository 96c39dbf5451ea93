use std::sync::Arc;

use async_trait::async_trait;
use bsa_core::{DataRequirement, Resource};
use tracing::{debug, info};

use crate::action::ActionNode;
use crate::context::ProcessingContext;
use crate::error::ExecutorError;
use crate::executor::{ActionExecutor, ActionOutcome};

/// Fetches clinical data for a patient from the EHR.
#[async_trait]
pub trait EhrQueryService: Send + Sync {
    async fn query(
        &self,
        patient_id: &str,
        requirement: &DataRequirement,
    ) -> Result<Vec<Resource>, ExecutorError>;
}

/// EHR query that never returns data.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEhrQuery;

#[async_trait]
impl EhrQueryService for NoopEhrQuery {
    async fn query(
        &self,
        _patient_id: &str,
        _requirement: &DataRequirement,
    ) -> Result<Vec<Resource>, ExecutorError> {
        Ok(Vec::new())
    }
}

/// Loads the data named by the action's input requirements into the context.
pub struct CollectData {
    ehr: Arc<dyn EhrQueryService>,
}

impl CollectData {
    pub fn new(ehr: Arc<dyn EhrQueryService>) -> Self {
        Self { ehr }
    }
}

#[async_trait]
impl ActionExecutor for CollectData {
    fn name(&self) -> &str {
        "collect-data"
    }

    async fn execute(
        &self,
        ctx: &mut ProcessingContext,
        node: &ActionNode,
    ) -> Result<ActionOutcome, ExecutorError> {
        let patient_id = ctx
            .patient_id()
            .map(str::to_string)
            .ok_or_else(|| ExecutorError::MissingData("processing context has no patient".into()))?;

        let mut added = 0;
        for requirement in &node.input_requirements {
            let resources = self.ehr.query(&patient_id, requirement).await?;
            debug!(
                action_id = %node.id,
                requirement = %requirement.id,
                resource_type = %requirement.resource_type,
                fetched = resources.len(),
                "Collected data"
            );
            added += ctx.add_input_resources(resources);
        }

        info!(action_id = %node.id, patient_id = %patient_id, added, "Data collection finished");
        Ok(ActionOutcome::Proceed)
    }
}
