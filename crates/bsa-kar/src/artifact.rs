//! Knowledge artifacts: the action arena plus bundled dependent resources.

use std::collections::{BTreeMap, BTreeSet};

use bsa_core::{CoreError, DataRequirement, FhirDuration, Resource, ValueSet};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::{
    ActionId, ActionNode, ActionType, ConditionSpec, RelatedActionEdge, RelationshipKind,
    TimingSchedule,
};
use crate::error::{KarError, KarResult};

/// Serialized artifact definition, as handed over by the artifact loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSpec {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub plan_definitions: Vec<PlanDefinitionSpec>,
    #[serde(default)]
    pub dependent_resources: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDefinitionSpec {
    pub id: String,
    pub actions: Vec<ActionSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default)]
    pub named_events: BTreeSet<String>,
    #[serde(default)]
    pub input: Vec<DataRequirement>,
    #[serde(default)]
    pub output: Vec<DataRequirement>,
    #[serde(default)]
    pub conditions: Vec<ConditionSpec>,
    #[serde(default)]
    pub timing: Vec<TimingSchedule>,
    #[serde(default)]
    pub related_actions: Vec<RelatedActionSpec>,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measure_uri: Option<String>,
}

/// Related action reference by raw id within the same plan definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedActionSpec {
    pub action_id: String,
    pub relationship: RelationshipKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<FhirDuration>,
}

/// Lookup of artifact-bundled resources such as value sets and libraries.
pub trait ArtifactRepository: Send + Sync {
    fn dependent_resource(&self, resource_type: &str, reference: &str) -> Option<&Resource>;

    fn value_set(&self, reference: &str) -> Result<ValueSet, CoreError> {
        let resource = self
            .dependent_resource("ValueSet", reference)
            .ok_or_else(|| CoreError::dependent_resource_not_found("ValueSet", reference))?;
        ValueSet::from_value(resource.as_value())
    }
}

/// Dependent resources indexed by type, then by canonical url, `url|version`,
/// id and `Type/id`.
#[derive(Debug, Clone, Default)]
pub struct DependentResources {
    resources: Vec<Resource>,
    index: BTreeMap<String, BTreeMap<String, usize>>,
}

impl DependentResources {
    pub fn insert(&mut self, resource: Resource) {
        let position = self.resources.len();
        let by_reference = self
            .index
            .entry(resource.resource_type().to_string())
            .or_default();

        if let Some(url) = resource.url() {
            by_reference.insert(url.to_string(), position);
            if let Some(version) = resource.version() {
                by_reference.insert(format!("{url}|{version}"), position);
            }
        }
        if let Some(id) = resource.id() {
            by_reference.insert(id.to_string(), position);
            by_reference.insert(resource.key(), position);
        }
        self.resources.push(resource);
    }

    pub fn get(&self, resource_type: &str, reference: &str) -> Option<&Resource> {
        self.index
            .get(resource_type)?
            .get(reference)
            .and_then(|&i| self.resources.get(i))
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct KnowledgeArtifact {
    id: String,
    version: Option<String>,
    nodes: IndexMap<ActionId, ActionNode>,
    roots: Vec<ActionId>,
    dependents: DependentResources,
}

impl KnowledgeArtifact {
    /// Flatten an artifact definition into an action arena.
    pub fn build(spec: ArtifactSpec) -> KarResult<Self> {
        let mut artifact = Self {
            id: spec.id,
            version: spec.version,
            nodes: IndexMap::new(),
            roots: Vec::new(),
            dependents: DependentResources::default(),
        };

        for plan in spec.plan_definitions {
            for action in plan.actions {
                let root = artifact.insert_action(&plan.id, action, None)?;
                artifact.roots.push(root);
            }
        }

        for raw in spec.dependent_resources {
            let resource = Resource::from_value(raw)
                .map_err(|e| KarError::invalid_artifact(&artifact.id, e.to_string()))?;
            artifact.dependents.insert(resource);
        }

        tracing::info!(
            artifact_id = %artifact.id,
            actions = artifact.nodes.len(),
            roots = artifact.roots.len(),
            dependent_resources = artifact.dependents.len(),
            "Knowledge artifact built"
        );

        Ok(artifact)
    }

    fn insert_action(
        &mut self,
        plan_definition: &str,
        spec: ActionSpec,
        parent: Option<&ActionId>,
    ) -> KarResult<ActionId> {
        let id = ActionId::compose(&spec.id, plan_definition);
        if self.nodes.contains_key(&id) {
            return Err(KarError::invalid_artifact(
                &self.id,
                format!("duplicate action id {id}"),
            ));
        }

        let mut node = ActionNode::new(id.clone(), spec.action_type, plan_definition);
        node.named_event_triggers = spec.named_events;
        node.input_requirements = spec.input;
        node.output_requirements = spec.output;
        node.conditions = spec.conditions;
        node.timing = spec.timing;
        node.parent = parent.cloned();
        node.measure_uri = spec.measure_uri;
        for related in spec.related_actions {
            node.add_related_action(RelatedActionEdge {
                related_action_id: ActionId::compose(&related.action_id, plan_definition),
                relationship: related.relationship,
                offset: related.offset,
            });
        }

        // Reserve the slot first so children keep declaration order after the parent.
        self.nodes.insert(id.clone(), node);

        let mut children = Vec::with_capacity(spec.actions.len());
        for child in spec.actions {
            children.push(self.insert_action(plan_definition, child, Some(&id))?);
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.sub_actions = children;
        }

        Ok(id)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn action(&self, id: &ActionId) -> Option<&ActionNode> {
        self.nodes.get(id)
    }

    pub fn actions(&self) -> impl Iterator<Item = &ActionNode> {
        self.nodes.values()
    }

    pub fn roots(&self) -> impl Iterator<Item = &ActionNode> {
        self.roots.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Root actions triggered by a named event, in artifact order.
    pub fn roots_for_event<'a>(&'a self, named_event: &'a str) -> impl Iterator<Item = &'a ActionNode> {
        self.roots().filter(move |node| node.is_triggered_by(named_event))
    }

    /// Related-action edges whose target is missing from the arena.
    pub fn unresolved_edges(&self) -> Vec<(&ActionId, &RelatedActionEdge)> {
        self.nodes
            .values()
            .flat_map(|node| {
                node.related_actions
                    .values()
                    .flatten()
                    .map(move |edge| (&node.id, edge))
            })
            .filter(|(_, edge)| !self.nodes.contains_key(&edge.related_action_id))
            .collect()
    }

    pub fn dependent_resources(&self) -> &DependentResources {
        &self.dependents
    }

    pub fn log_summary(&self) {
        for node in self.nodes.values() {
            node.log_summary();
        }
    }
}

impl ArtifactRepository for KnowledgeArtifact {
    fn dependent_resource(&self, resource_type: &str, reference: &str) -> Option<&Resource> {
        self.dependents.get(resource_type, reference)
    }
}
