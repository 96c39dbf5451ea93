use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use bsa_core::Resource;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::action::{ActionId, ActionType};
use crate::error::StoreError;
use crate::matcher::TriggerCodeStatus;

/// Per-traversal status of an action node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionStatus {
    Pending,
    Skipped,
    Scheduled,
    InProgress,
    Completed,
    Failed,
}

/// Lifecycle of the whole execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    #[default]
    Active,
    Terminated,
}

/// Why an action was deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResumeReason {
    /// The node's own timing schedule; conditions already passed.
    TimingSchedule,
    /// Target of a related-action edge with an offset.
    RelatedAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResumeStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ResumeStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A deferred action waiting for its scheduler callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingResume {
    pub action_type: ActionType,
    #[serde(with = "time::serde::rfc3339")]
    pub fire_at: OffsetDateTime,
    pub reason: ResumeReason,
    pub status: ResumeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_action: Option<ActionId>,
}

/// The slice of a processing context needed to evaluate a resumed branch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    #[serde(default)]
    pub input_resources: BTreeMap<String, Vec<Resource>>,
    #[serde(default)]
    pub output_resources: BTreeMap<ActionId, BTreeMap<String, Resource>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub trigger_status: BTreeMap<ActionId, TriggerCodeStatus>,
}

impl ContextSnapshot {
    /// Union another writer's snapshot into this one.
    ///
    /// Inputs are a set keyed by resource identity; outputs and trigger
    /// results from `local` win per action and requirement id.
    pub fn merge(&mut self, local: &ContextSnapshot) {
        for (resource_type, resources) in &local.input_resources {
            let known = self.input_resources.entry(resource_type.clone()).or_default();
            for resource in resources {
                let present = match resource.id() {
                    Some(_) => {
                        let key = resource.key();
                        known.iter().any(|r| r.id().is_some() && r.key() == key)
                    }
                    None => known.contains(resource),
                };
                if !present {
                    known.push(resource.clone());
                }
            }
        }
        for (action_id, outputs) in &local.output_resources {
            self.output_resources
                .entry(action_id.clone())
                .or_default()
                .extend(outputs.iter().map(|(k, r)| (k.clone(), r.clone())));
        }
        for (action_id, status) in &local.trigger_status {
            self.trigger_status
                .entry(action_id.clone())
                .or_default()
                .merge(status.clone());
        }
    }
}

/// Durable record of an in-flight traversal, keyed by processing-context id.
///
/// `version` is 0 until the first save; the store bumps it on every write and
/// rejects writes carrying a stale version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub id: Uuid,
    pub version: u64,
    pub artifact_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub named_event: Option<String>,
    #[serde(default)]
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_action: Option<ActionId>,
    #[serde(default)]
    pub action_statuses: BTreeMap<ActionId, ActionStatus>,
    #[serde(default)]
    pub pending: BTreeMap<ActionId, PendingResume>,
    #[serde(default)]
    pub snapshot: ContextSnapshot,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ExecutionState {
    pub fn new(id: Uuid, artifact_id: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id,
            version: 0,
            artifact_id: artifact_id.into(),
            patient_id: None,
            named_event: None,
            status: ExecutionStatus::Active,
            current_action: None,
            action_statuses: BTreeMap::new(),
            pending: BTreeMap::new(),
            snapshot: ContextSnapshot::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.version > 0
    }

    pub fn is_terminated(&self) -> bool {
        self.status == ExecutionStatus::Terminated
    }

    /// Fold locally held progress into a freshly read copy of the state.
    ///
    /// Only the statuses in `changed` are taken from `local`; every other
    /// status keeps the stored value. Pending entries already in `self` win,
    /// so another writer's deferrals are never dropped, and snapshots are
    /// merged rather than replaced.
    pub fn absorb(&mut self, local: &ExecutionState, changed: &BTreeSet<ActionId>) {
        for action_id in changed {
            if let Some(status) = local.action_statuses.get(action_id) {
                self.action_statuses.insert(action_id.clone(), *status);
            }
        }
        for (action_id, pending) in &local.pending {
            self.pending
                .entry(action_id.clone())
                .or_insert_with(|| pending.clone());
        }
        self.snapshot.merge(&local.snapshot);
        if local.current_action.is_some() {
            self.current_action = local.current_action.clone();
        }
        if local.is_terminated() {
            self.status = ExecutionStatus::Terminated;
        }
    }
}

/// Durable store for execution state.
///
/// Implementations must give read-modify-write consistency per id: a save
/// whose `version` differs from the stored one fails with
/// [`StoreError::VersionConflict`].
#[async_trait]
pub trait ExecutionStateStore: Send + Sync {
    /// Insert (version 0) or update (matching version) a state, returning the
    /// stored copy with its new version.
    async fn save_or_update(&self, state: &ExecutionState) -> Result<ExecutionState, StoreError>;

    /// Get a state by context id
    async fn get_by_id(&self, id: Uuid) -> Result<Option<ExecutionState>, StoreError>;
}
