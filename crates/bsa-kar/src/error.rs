//! Error types for the KAR engine

use bsa_core::CoreError;
use thiserror::Error;
use uuid::Uuid;

/// Result type for engine operations
pub type KarResult<T> = Result<T, KarError>;

/// Errors surfaced by the engine to its caller.
///
/// Configuration gaps inside an artifact are logged and skipped during
/// traversal; they only appear here when detected at registration time.
#[derive(Debug, Error)]
pub enum KarError {
    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Invalid artifact {artifact}: {message}")]
    InvalidArtifact { artifact: String, message: String },

    #[error("Action {action_id} uses action type {action_type} which has no registered executor")]
    UnsupportedActionType {
        action_id: String,
        action_type: String,
    },

    #[error("Action {action_id} uses condition processor {processor} which has no registered evaluator")]
    UnsupportedConditionProcessor { action_id: String, processor: String },

    #[error("Execution state not found: {0}")]
    ContextNotFound(Uuid),

    #[error("Execution state store error: {0}")]
    Store(#[from] StoreError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl KarError {
    pub fn invalid_artifact(artifact: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArtifact {
            artifact: artifact.into(),
            message: message.into(),
        }
    }

    /// Store and scheduler faults stop a deferred branch and need an operator.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Scheduler(_))
    }
}

/// Errors from an execution-state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Execution state not found: {0}")]
    NotFound(Uuid),

    #[error("Version conflict for execution state {id}: expected {expected}, found {actual}")]
    VersionConflict { id: Uuid, expected: u64, actual: u64 },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the scheduler or the resume task queue.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Scheduler unavailable: {0}")]
    Unavailable(String),

    #[error("Resume task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Invalid job: {0}")]
    InvalidJob(String),
}

/// Errors raised by an action-type executor. They never escape the node.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Action execution failed: {0}")]
    Failed(String),

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Missing data: {0}")]
    MissingData(String),

    #[error("Executor panicked: {0}")]
    Panicked(String),
}

/// Errors raised by a condition evaluator. Treated as "condition not met".
#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("Unsupported expression: {0}")]
    UnsupportedExpression(String),

    #[error("Condition evaluation failed: {0}")]
    Evaluation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infrastructure_classification() {
        let err: KarError = StoreError::Unavailable("db down".into()).into();
        assert!(err.is_infrastructure());
        let err: KarError = SchedulerError::Unavailable("queue down".into()).into();
        assert!(err.is_infrastructure());
        assert!(!KarError::ArtifactNotFound("kar".into()).is_infrastructure());
    }

    #[test]
    fn test_version_conflict_message() {
        let id = Uuid::nil();
        let err = StoreError::VersionConflict {
            id,
            expected: 2,
            actual: 3,
        };
        assert!(err.to_string().contains("expected 2, found 3"));
    }
}
