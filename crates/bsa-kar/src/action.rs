//! Action tree model.
//!
//! Nodes live in an arena owned by their [`KnowledgeArtifact`](crate::artifact::KnowledgeArtifact);
//! sub-actions and related actions refer to other nodes by [`ActionId`] and
//! are resolved through the arena at traversal time.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use bsa_core::{DataRequirement, FhirDuration};
use serde::{Deserialize, Serialize};

/// Identifier of an action node, unique within an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(String);

impl ActionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Qualify a raw action id with its owning plan definition, so actions
    /// that share a raw id across plan definitions stay distinct.
    pub fn compose(raw: &str, plan_definition: &str) -> Self {
        Self(format!("{raw}-PlanDefinition/{plan_definition}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of work an action performs; selects the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionType {
    InitiateReportingWorkflow,
    ExecuteReportingWorkflow,
    CheckTriggerCodes,
    EvaluateCondition,
    CollectData,
    EvaluateMeasure,
    CreateReport,
    ValidateReport,
    SubmitReport,
    CompleteReporting,
    ExtendReporting,
    Terminate,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InitiateReportingWorkflow => "initiate-reporting-workflow",
            Self::ExecuteReportingWorkflow => "execute-reporting-workflow",
            Self::CheckTriggerCodes => "check-trigger-codes",
            Self::EvaluateCondition => "evaluate-condition",
            Self::CollectData => "collect-data",
            Self::EvaluateMeasure => "evaluate-measure",
            Self::CreateReport => "create-report",
            Self::ValidateReport => "validate-report",
            Self::SubmitReport => "submit-report",
            Self::CompleteReporting => "complete-reporting",
            Self::ExtendReporting => "extend-reporting",
            Self::Terminate => "terminate",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relationship between an action and one of its related actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelationshipKind {
    BeforeStart,
    Before,
    BeforeEnd,
    ConcurrentWithStart,
    Concurrent,
    ConcurrentWithEnd,
    AfterStart,
    After,
    AfterEnd,
}

impl RelationshipKind {
    /// Only "before-start" edges are executed; the rest are recorded.
    pub fn is_actionable(&self) -> bool {
        matches!(self, Self::BeforeStart)
    }
}

impl fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BeforeStart => "before-start",
            Self::Before => "before",
            Self::BeforeEnd => "before-end",
            Self::ConcurrentWithStart => "concurrent-with-start",
            Self::Concurrent => "concurrent",
            Self::ConcurrentWithEnd => "concurrent-with-end",
            Self::AfterStart => "after-start",
            Self::After => "after",
            Self::AfterEnd => "after-end",
        };
        f.write_str(s)
    }
}

/// Directed edge to another action, optionally offset in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedActionEdge {
    pub related_action_id: ActionId,
    pub relationship: RelationshipKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<FhirDuration>,
}

/// Selects the condition evaluator implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessorKind {
    FhirPath,
    TriggerCode,
    Cql,
}

impl fmt::Display for ProcessorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FhirPath => "fhir-path",
            Self::TriggerCode => "trigger-code",
            Self::Cql => "cql",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionSpec {
    pub processor: ProcessorKind,
    pub expression: String,
}

impl ConditionSpec {
    pub fn new(processor: ProcessorKind, expression: impl Into<String>) -> Self {
        Self {
            processor,
            expression: expression.into(),
        }
    }
}

/// Offset after which a timed action runs once its conditions are met.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingSchedule {
    pub offset: FhirDuration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionNode {
    pub id: ActionId,
    pub action_type: ActionType,
    pub plan_definition: String,
    pub named_event_triggers: BTreeSet<String>,
    pub input_requirements: Vec<DataRequirement>,
    pub output_requirements: Vec<DataRequirement>,
    pub conditions: Vec<ConditionSpec>,
    pub timing: Vec<TimingSchedule>,
    pub related_actions: BTreeMap<RelationshipKind, Vec<RelatedActionEdge>>,
    pub sub_actions: Vec<ActionId>,
    pub parent: Option<ActionId>,
    pub measure_uri: Option<String>,
}

impl ActionNode {
    pub fn new(id: ActionId, action_type: ActionType, plan_definition: impl Into<String>) -> Self {
        Self {
            id,
            action_type,
            plan_definition: plan_definition.into(),
            named_event_triggers: BTreeSet::new(),
            input_requirements: Vec::new(),
            output_requirements: Vec::new(),
            conditions: Vec::new(),
            timing: Vec::new(),
            related_actions: BTreeMap::new(),
            sub_actions: Vec::new(),
            parent: None,
            measure_uri: None,
        }
    }

    pub fn is_triggered_by(&self, named_event: &str) -> bool {
        self.named_event_triggers.contains(named_event)
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Add an edge, keeping one edge per (relationship, target).
    pub fn add_related_action(&mut self, edge: RelatedActionEdge) {
        let edges = self.related_actions.entry(edge.relationship).or_default();
        if let Some(existing) = edges
            .iter_mut()
            .find(|e| e.related_action_id == edge.related_action_id)
        {
            *existing = edge;
        } else {
            edges.push(edge);
        }
    }

    /// Earliest timing offset, if this node is timed.
    pub fn timing_offset(&self) -> Option<FhirDuration> {
        self.timing.iter().map(|t| t.offset).min()
    }

    /// Find an input requirement by id, accepting the `%lowerCamel` variable form.
    pub fn input_requirement(&self, reference: &str) -> Option<&DataRequirement> {
        let name = reference.trim().trim_start_matches('%');
        self.input_requirements
            .iter()
            .find(|dr| dr.id == name || variable_name(&dr.id) == name)
    }

    pub fn log_summary(&self) {
        tracing::debug!(
            action_id = %self.id,
            action_type = %self.action_type,
            named_events = ?self.named_event_triggers,
            conditions = self.conditions.len(),
            timing = self.timing.len(),
            sub_actions = self.sub_actions.len(),
            "Action summary"
        );
        for (kind, edges) in &self.related_actions {
            for edge in edges {
                tracing::debug!(
                    action_id = %self.id,
                    relationship = %kind,
                    related_action_id = %edge.related_action_id,
                    offset = ?edge.offset,
                    "Related action"
                );
            }
        }
    }
}

/// Expression variable name for a requirement id: first letter lower-cased.
pub fn variable_name(id: &str) -> String {
    let mut chars = id.chars();
    match chars.next() {
        Some(first) if id.chars().count() > 2 => {
            first.to_lowercase().chain(chars).collect()
        }
        _ => id.to_lowercase(),
    }
}
