//! File-backed collaborators for running artifacts outside an EHR.

use std::path::PathBuf;

use async_trait::async_trait;
use bsa_core::{DataRequirement, Resource};
use bsa_kar::condition::requirement_resources;
use bsa_kar::{
    ActionExecutor, ActionNode, ActionOutcome, EhrQueryService, ExecutorError, ProcessingContext,
    ReportSubmitter, Submission,
};
use serde_json::{Value, json};
use tracing::{debug, info};

/// Serves a patient's data from a preloaded bundle.
#[derive(Debug, Clone, Default)]
pub struct BundleEhrQuery {
    resources: Vec<Resource>,
}

impl BundleEhrQuery {
    pub fn new(resources: Vec<Resource>) -> Self {
        Self { resources }
    }

    fn belongs_to(resource: &Resource, patient_id: &str) -> bool {
        if resource.resource_type() == "Patient" {
            return resource.id() == Some(patient_id);
        }
        let subject = resource
            .as_value()
            .get("subject")
            .or_else(|| resource.as_value().get("patient"))
            .and_then(|s| s.get("reference"))
            .and_then(Value::as_str);
        match subject {
            Some(reference) => reference == format!("Patient/{patient_id}"),
            None => true,
        }
    }
}

#[async_trait]
impl EhrQueryService for BundleEhrQuery {
    async fn query(
        &self,
        patient_id: &str,
        requirement: &DataRequirement,
    ) -> Result<Vec<Resource>, ExecutorError> {
        Ok(self
            .resources
            .iter()
            .filter(|r| r.resource_type() == requirement.resource_type)
            .filter(|r| requirement.profile.iter().all(|p| r.has_profile(p)))
            .filter(|r| Self::belongs_to(r, patient_id))
            .cloned()
            .collect())
    }
}

/// Writes each submitted resource as pretty JSON under
/// `<output_dir>/<context_id>/`.
#[derive(Debug, Clone)]
pub struct FileReportSubmitter {
    output_dir: PathBuf,
}

impl FileReportSubmitter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn path_for(&self, submission: &Submission<'_>) -> PathBuf {
        let file_name = format!(
            "{}-{}.json",
            sanitize(submission.source_action.as_str()),
            sanitize(submission.requirement_id)
        );
        self.output_dir
            .join(submission.context_id.to_string())
            .join(file_name)
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[async_trait]
impl ReportSubmitter for FileReportSubmitter {
    async fn submit(&self, submission: Submission<'_>) -> Result<(), ExecutorError> {
        let path = self.path_for(&submission);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ExecutorError::Collaborator(format!("{}: {e}", parent.display())))?;
        }
        let body = serde_json::to_vec_pretty(submission.resource.as_value())
            .map_err(|e| ExecutorError::Failed(e.to_string()))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| ExecutorError::Collaborator(format!("{}: {e}", path.display())))?;

        info!(
            context_id = %submission.context_id,
            resource = %submission.resource.key(),
            path = %path.display(),
            "Report written"
        );
        Ok(())
    }
}

/// Packages the data named by the action's inputs into a collection bundle,
/// recorded under each output requirement id.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateReportBundle;

/// Output id used when the action declares no output requirement.
pub const DEFAULT_REPORT_ID: &str = "report";

#[async_trait]
impl ActionExecutor for CreateReportBundle {
    fn name(&self) -> &str {
        "create-report-bundle"
    }

    async fn execute(
        &self,
        ctx: &mut ProcessingContext,
        node: &ActionNode,
    ) -> Result<ActionOutcome, ExecutorError> {
        let data: &ProcessingContext = ctx;
        let entries: Vec<Value> = node
            .input_requirements
            .iter()
            .flat_map(|requirement| requirement_resources(requirement, data))
            .map(|resource| json!({ "resource": resource.into_value() }))
            .collect();
        let count = entries.len();

        let bundle = Resource::from_value(json!({
            "resourceType": "Bundle",
            "type": "collection",
            "entry": entries,
        }))
        .map_err(|e| ExecutorError::Failed(e.to_string()))?;

        let output_ids: Vec<String> = if node.output_requirements.is_empty() {
            vec![DEFAULT_REPORT_ID.to_string()]
        } else {
            node.output_requirements.iter().map(|dr| dr.id.clone()).collect()
        };
        for output_id in output_ids {
            ctx.set_output(&node.id, output_id, bundle.clone());
        }

        debug!(action_id = %node.id, entries = count, "Report bundle created");
        Ok(ActionOutcome::Proceed)
    }
}
