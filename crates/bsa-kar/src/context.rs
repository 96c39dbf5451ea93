//! Per-event working set for one traversal.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bsa_core::Resource;
use indexmap::IndexMap;
use serde::Serialize;
use uuid::Uuid;

use crate::action::ActionId;
use crate::artifact::{ArtifactRepository, KnowledgeArtifact};
use crate::matcher::TriggerCodeStatus;
use crate::scheduler::JobHandle;
use crate::state::{ActionStatus, ContextSnapshot, ExecutionState, ExecutionStatus};

/// Read access to the clinical data accumulated for the current event.
pub trait DataSource {
    fn resources_by_type(&self, resource_type: &str) -> Vec<&Resource>;
}

/// A deferred branch that could not be handed to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeferralFailure {
    pub action_id: ActionId,
    pub error: String,
}

/// Outcome of one traversal, for callers and logs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraversalReport {
    pub context_id: Uuid,
    pub named_event: Option<String>,
    pub statuses: BTreeMap<ActionId, ActionStatus>,
    pub scheduled: Vec<JobHandle>,
    pub deferral_failures: Vec<DeferralFailure>,
}

impl TraversalReport {
    pub fn status(&self, action_id: &ActionId) -> Option<ActionStatus> {
        self.statuses.get(action_id).copied()
    }

    pub fn executed(&self) -> impl Iterator<Item = &ActionId> {
        self.statuses
            .iter()
            .filter(|(_, s)| **s == ActionStatus::Completed)
            .map(|(id, _)| id)
    }
}

/// Restore point taken before an executor runs.
///
/// Inputs are append-only, so per-type lengths are enough to undo additions.
#[derive(Debug, Clone)]
pub(crate) struct Checkpoint {
    input_lens: BTreeMap<String, usize>,
    output_resources: BTreeMap<ActionId, IndexMap<String, Resource>>,
    trigger_status: BTreeMap<ActionId, TriggerCodeStatus>,
}

/// Mutable working set for one clinical event.
///
/// Never shared between concurrent traversals; a resumed branch gets its own
/// context rebuilt from persisted state.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    id: Uuid,
    artifact: Arc<KnowledgeArtifact>,
    input_resources: BTreeMap<String, IndexMap<String, Resource>>,
    output_resources: BTreeMap<ActionId, IndexMap<String, Resource>>,
    trigger_status: BTreeMap<ActionId, TriggerCodeStatus>,
    state: ExecutionState,
    /// Statuses set since the state was last loaded or saved.
    changed_statuses: BTreeSet<ActionId>,
    scheduled: Vec<JobHandle>,
    deferral_failures: Vec<DeferralFailure>,
}

impl ProcessingContext {
    pub fn new(artifact: Arc<KnowledgeArtifact>) -> Self {
        let id = Uuid::new_v4();
        let state = ExecutionState::new(id, artifact.id());
        Self::from_state(artifact, state)
    }

    pub fn with_patient(mut self, patient_id: impl Into<String>) -> Self {
        self.state.patient_id = Some(patient_id.into());
        self
    }

    /// Rebuild a context from persisted state, restoring its snapshot.
    pub fn from_state(artifact: Arc<KnowledgeArtifact>, state: ExecutionState) -> Self {
        let mut ctx = Self {
            id: state.id,
            artifact,
            input_resources: BTreeMap::new(),
            output_resources: BTreeMap::new(),
            trigger_status: BTreeMap::new(),
            state,
            changed_statuses: BTreeSet::new(),
            scheduled: Vec::new(),
            deferral_failures: Vec::new(),
        };

        let snapshot = std::mem::take(&mut ctx.state.snapshot);
        for resources in snapshot.input_resources.into_values() {
            ctx.add_input_resources(resources);
        }
        for (action_id, outputs) in snapshot.output_resources {
            for (requirement_id, resource) in outputs {
                ctx.set_output(&action_id, requirement_id, resource);
            }
        }
        ctx.trigger_status = snapshot.trigger_status;
        ctx
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn artifact(&self) -> &Arc<KnowledgeArtifact> {
        &self.artifact
    }

    pub fn repository(&self) -> &dyn ArtifactRepository {
        self.artifact.as_ref()
    }

    pub fn patient_id(&self) -> Option<&str> {
        self.state.patient_id.as_deref()
    }

    pub fn named_event(&self) -> Option<&str> {
        self.state.named_event.as_deref()
    }

    pub fn set_named_event(&mut self, named_event: impl Into<String>) {
        self.state.named_event = Some(named_event.into());
    }

    /// Add a resource to the input set. Returns `false` if it was already present.
    pub fn add_input_resource(&mut self, resource: Resource) -> bool {
        let by_key = self
            .input_resources
            .entry(resource.resource_type().to_string())
            .or_default();
        let key = match resource.id() {
            Some(_) => resource.key(),
            // Anonymous resources are never deduplicated.
            None => format!("{}/#{}", resource.resource_type(), by_key.len()),
        };
        if by_key.contains_key(&key) {
            return false;
        }
        by_key.insert(key, resource);
        true
    }

    pub fn add_input_resources(&mut self, resources: impl IntoIterator<Item = Resource>) -> usize {
        resources
            .into_iter()
            .filter(|r| self.add_input_resource(r.clone()))
            .count()
    }

    pub fn input_resource_count(&self) -> usize {
        self.input_resources.values().map(IndexMap::len).sum()
    }

    /// Record a produced resource. A later write for the same requirement id
    /// replaces the earlier one.
    pub fn set_output(
        &mut self,
        action_id: &ActionId,
        requirement_id: impl Into<String>,
        resource: Resource,
    ) -> Option<Resource> {
        self.output_resources
            .entry(action_id.clone())
            .or_default()
            .insert(requirement_id.into(), resource)
    }

    pub fn outputs_for(&self, action_id: &ActionId) -> Option<&IndexMap<String, Resource>> {
        self.output_resources.get(action_id)
    }

    pub fn output(&self, action_id: &ActionId, requirement_id: &str) -> Option<&Resource> {
        self.output_resources.get(action_id)?.get(requirement_id)
    }

    /// All outputs recorded under a requirement id, by any action.
    pub fn outputs_by_requirement<'a>(
        &'a self,
        requirement_id: &'a str,
    ) -> impl Iterator<Item = &'a Resource> + 'a {
        self.output_resources
            .values()
            .filter_map(move |outputs| outputs.get(requirement_id))
    }

    pub fn output_resources(&self) -> &BTreeMap<ActionId, IndexMap<String, Resource>> {
        &self.output_resources
    }

    pub fn record_trigger_status(&mut self, action_id: &ActionId, status: TriggerCodeStatus) {
        self.trigger_status
            .entry(action_id.clone())
            .or_default()
            .merge(status);
    }

    pub fn trigger_status(&self, action_id: &ActionId) -> Option<&TriggerCodeStatus> {
        self.trigger_status.get(action_id)
    }

    pub fn set_status(&mut self, action_id: &ActionId, status: ActionStatus) {
        tracing::trace!(context_id = %self.id, action_id = %action_id, status = ?status, "Action status");
        self.state.action_statuses.insert(action_id.clone(), status);
        self.changed_statuses.insert(action_id.clone());
    }

    pub fn status(&self, action_id: &ActionId) -> ActionStatus {
        self.state
            .action_statuses
            .get(action_id)
            .copied()
            .unwrap_or(ActionStatus::Pending)
    }

    pub fn set_current_action(&mut self, action_id: &ActionId) {
        self.state.current_action = Some(action_id.clone());
    }

    /// Mark the execution terminal; later resumes become no-ops.
    pub fn terminate(&mut self) {
        self.state.status = ExecutionStatus::Terminated;
    }

    pub fn is_terminated(&self) -> bool {
        self.state.is_terminated()
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            input_resources: self
                .input_resources
                .iter()
                .map(|(t, by_key)| (t.clone(), by_key.values().cloned().collect()))
                .collect(),
            output_resources: self
                .output_resources
                .iter()
                .map(|(id, outputs)| {
                    (
                        id.clone(),
                        outputs.iter().map(|(k, r)| (k.clone(), r.clone())).collect(),
                    )
                })
                .collect(),
            trigger_status: self.trigger_status.clone(),
        }
    }

    /// The state to persist: the current execution state with a fresh snapshot.
    pub fn state_for_save(&self) -> ExecutionState {
        let mut state = self.state.clone();
        state.snapshot = self.snapshot();
        state
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub(crate) fn changed_statuses(&self) -> &BTreeSet<ActionId> {
        &self.changed_statuses
    }

    /// Adopt a stored copy; the snapshot stays with the live context.
    pub(crate) fn replace_state(&mut self, mut stored: ExecutionState) {
        stored.snapshot = ContextSnapshot::default();
        self.state = stored;
        self.changed_statuses.clear();
    }

    /// Take in another writer's snapshot entries. Local outputs win; an
    /// anonymous input equal to one already held is not added twice.
    pub(crate) fn adopt_snapshot(&mut self, snapshot: ContextSnapshot) {
        for (resource_type, resources) in snapshot.input_resources {
            for resource in resources {
                let duplicate = resource.id().is_none()
                    && self
                        .input_resources
                        .get(&resource_type)
                        .is_some_and(|by_key| by_key.values().any(|r| *r == resource));
                if !duplicate {
                    self.add_input_resource(resource);
                }
            }
        }
        for (action_id, outputs) in snapshot.output_resources {
            let local = self.output_resources.entry(action_id).or_default();
            for (requirement_id, resource) in outputs {
                local.entry(requirement_id).or_insert(resource);
            }
        }
        for (action_id, status) in snapshot.trigger_status {
            self.trigger_status.entry(action_id).or_default().merge(status);
        }
    }

    pub(crate) fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            input_lens: self
                .input_resources
                .iter()
                .map(|(t, by_key)| (t.clone(), by_key.len()))
                .collect(),
            output_resources: self.output_resources.clone(),
            trigger_status: self.trigger_status.clone(),
        }
    }

    /// Drop every input, output and trigger result recorded since `checkpoint`.
    pub(crate) fn rollback(&mut self, checkpoint: Checkpoint) {
        self.input_resources
            .retain(|t, _| checkpoint.input_lens.contains_key(t));
        for (resource_type, by_key) in self.input_resources.iter_mut() {
            if let Some(len) = checkpoint.input_lens.get(resource_type) {
                by_key.truncate(*len);
            }
        }
        self.output_resources = checkpoint.output_resources;
        self.trigger_status = checkpoint.trigger_status;
    }

    pub(crate) fn record_scheduled(&mut self, handle: JobHandle) {
        self.scheduled.push(handle);
    }

    pub(crate) fn record_deferral_failure(&mut self, action_id: &ActionId, error: impl ToString) {
        self.deferral_failures.push(DeferralFailure {
            action_id: action_id.clone(),
            error: error.to_string(),
        });
    }

    pub fn scheduled(&self) -> &[JobHandle] {
        &self.scheduled
    }

    pub fn report(&self) -> TraversalReport {
        TraversalReport {
            context_id: self.id,
            named_event: self.state.named_event.clone(),
            statuses: self.state.action_statuses.clone(),
            scheduled: self.scheduled.clone(),
            deferral_failures: self.deferral_failures.clone(),
        }
    }
}

impl DataSource for ProcessingContext {
    fn resources_by_type(&self, resource_type: &str) -> Vec<&Resource> {
        self.input_resources
            .get(resource_type)
            .map(|by_key| by_key.values().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactSpec;
    use serde_json::json;

    fn artifact() -> Arc<KnowledgeArtifact> {
        let spec: ArtifactSpec = serde_json::from_value(json!({
            "id": "kar",
            "planDefinitions": [{"id": "pd", "actions": [{"id": "a", "type": "collect-data"}]}]
        }))
        .unwrap();
        Arc::new(KnowledgeArtifact::build(spec).unwrap())
    }

    fn condition(id: &str) -> Resource {
        Resource::from_value(json!({"resourceType": "Condition", "id": id})).unwrap()
    }

    #[test]
    fn test_input_resources_are_a_set() {
        let mut ctx = ProcessingContext::new(artifact());
        assert!(ctx.add_input_resource(condition("c1")));
        assert!(!ctx.add_input_resource(condition("c1")));
        assert_eq!(ctx.add_input_resources([condition("c1"), condition("c2")]), 1);
        assert_eq!(ctx.resources_by_type("Condition").len(), 2);
        assert!(ctx.resources_by_type("Observation").is_empty());
    }

    #[test]
    fn test_anonymous_resources_kept() {
        let mut ctx = ProcessingContext::new(artifact());
        let anon = Resource::from_value(json!({"resourceType": "Observation"})).unwrap();
        assert!(ctx.add_input_resource(anon.clone()));
        assert!(ctx.add_input_resource(anon));
        assert_eq!(ctx.resources_by_type("Observation").len(), 2);
    }

    #[test]
    fn test_outputs_overwrite_per_requirement() {
        let mut ctx = ProcessingContext::new(artifact());
        let action = ActionId::new("a");
        assert!(ctx.set_output(&action, "report", condition("c1")).is_none());
        assert!(ctx.set_output(&action, "other", condition("c2")).is_none());
        let replaced = ctx.set_output(&action, "report", condition("c3")).unwrap();
        assert_eq!(replaced.id(), Some("c1"));

        let outputs = ctx.outputs_for(&action).unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(ctx.output(&action, "report").unwrap().id(), Some("c3"));
        assert_eq!(ctx.outputs_by_requirement("other").count(), 1);
    }

    #[test]
    fn test_snapshot_restores_context() {
        let mut ctx = ProcessingContext::new(artifact()).with_patient("p1");
        ctx.add_input_resource(condition("c1"));
        ctx.set_output(&ActionId::new("a"), "report", condition("c2"));
        ctx.set_status(&ActionId::new("a"), ActionStatus::Completed);

        let state = ctx.state_for_save();
        let restored = ProcessingContext::from_state(ctx.artifact().clone(), state);

        assert_eq!(restored.id(), ctx.id());
        assert_eq!(restored.patient_id(), Some("p1"));
        assert_eq!(restored.resources_by_type("Condition").len(), 1);
        assert!(restored.output(&ActionId::new("a"), "report").is_some());
        assert_eq!(restored.status(&ActionId::new("a")), ActionStatus::Completed);
        assert!(restored.state().snapshot.input_resources.is_empty());
    }

    #[test]
    fn test_snapshot_keeps_trigger_status() {
        let mut ctx = ProcessingContext::new(artifact());
        let mut status = TriggerCodeStatus::default();
        status.add_matched(crate::matcher::MatchedTriggerCodes {
            value_set_url: "http://vs/V".into(),
            matched_codes: ["http://sys|A".to_string()].into(),
            ..Default::default()
        });
        ctx.record_trigger_status(&ActionId::new("a"), status);

        let restored = ProcessingContext::from_state(ctx.artifact().clone(), ctx.state_for_save());
        let status = restored.trigger_status(&ActionId::new("a")).unwrap();
        assert!(status.trigger_matched);
        assert!(status.code_tokens().contains("http://sys|A"));
    }

    #[test]
    fn test_rollback_discards_writes_since_checkpoint() {
        let mut ctx = ProcessingContext::new(artifact());
        let action = ActionId::new("a");
        ctx.add_input_resource(condition("c1"));
        ctx.set_output(&action, "report", condition("c2"));

        let checkpoint = ctx.checkpoint();
        ctx.add_input_resource(condition("c3"));
        ctx.add_input_resource(
            Resource::from_value(json!({"resourceType": "Encounter", "id": "e1"})).unwrap(),
        );
        ctx.set_output(&action, "report", condition("c4"));
        ctx.set_output(&ActionId::new("b"), "other", condition("c5"));
        ctx.rollback(checkpoint);

        assert_eq!(ctx.resources_by_type("Condition").len(), 1);
        assert!(ctx.resources_by_type("Encounter").is_empty());
        assert_eq!(ctx.output(&action, "report").unwrap().id(), Some("c2"));
        assert!(ctx.outputs_for(&ActionId::new("b")).is_none());
        // Re-adding after rollback is not treated as a duplicate.
        assert!(ctx.add_input_resource(condition("c3")));
    }

    #[test]
    fn test_adopt_snapshot_keeps_local_outputs() {
        let mut ctx = ProcessingContext::new(artifact());
        let action = ActionId::new("a");
        let anon = Resource::from_value(json!({"resourceType": "Observation"})).unwrap();
        ctx.add_input_resource(anon.clone());
        ctx.set_output(&action, "report", condition("mine"));

        let mut other = ContextSnapshot::default();
        other
            .input_resources
            .insert("Observation".into(), vec![anon]);
        other
            .input_resources
            .insert("Condition".into(), vec![condition("c9")]);
        other.output_resources.insert(
            action.clone(),
            BTreeMap::from([
                ("report".to_string(), condition("theirs")),
                ("extra".to_string(), condition("c8")),
            ]),
        );
        ctx.adopt_snapshot(other);

        assert_eq!(ctx.resources_by_type("Observation").len(), 1);
        assert_eq!(ctx.resources_by_type("Condition").len(), 1);
        assert_eq!(ctx.output(&action, "report").unwrap().id(), Some("mine"));
        assert!(ctx.output(&action, "extra").is_some());
    }

    #[test]
    fn test_changed_statuses_reset_on_replace() {
        let mut ctx = ProcessingContext::new(artifact());
        ctx.set_status(&ActionId::new("a"), ActionStatus::Completed);
        assert!(ctx.changed_statuses().contains(&ActionId::new("a")));

        let stored = ctx.state_for_save();
        ctx.replace_state(stored);
        assert!(ctx.changed_statuses().is_empty());
        assert_eq!(ctx.status(&ActionId::new("a")), ActionStatus::Completed);
    }

    #[test]
    fn test_report_lists_executed() {
        let mut ctx = ProcessingContext::new(artifact());
        ctx.set_status(&ActionId::new("a"), ActionStatus::Completed);
        ctx.set_status(&ActionId::new("b"), ActionStatus::Skipped);
        let report = ctx.report();
        assert_eq!(report.executed().count(), 1);
        assert_eq!(report.status(&ActionId::new("b")), Some(ActionStatus::Skipped));
        assert_eq!(report.status(&ActionId::new("c")), None);
    }
}
