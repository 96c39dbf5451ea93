//! Knowledge artifact (KAR) action-execution engine.
//!
//! An artifact is a tree of actions gated by conditions, connected by
//! related-action edges and optionally deferred by timing offsets. The
//! [`KarEngine`] walks that tree for a clinical event, records what ran in a
//! durable [`ExecutionState`] and resumes deferred branches when the
//! [`Scheduler`] calls back.

pub mod action;
pub mod actions;
pub mod artifact;
pub mod condition;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod matcher;
pub mod memory;
pub mod scheduler;
pub mod state;
pub mod worker;

pub use action::{
    ActionId, ActionNode, ActionType, ConditionSpec, ProcessorKind, RelatedActionEdge,
    RelationshipKind, TimingSchedule,
};
pub use actions::{EhrQueryService, LoggingSubmitter, NoopEhrQuery, ReportSubmitter, Submission};
pub use artifact::{ArtifactRepository, ArtifactSpec, KnowledgeArtifact};
pub use condition::{ConditionEvaluator, ConditionRegistry, filter_resources};
pub use config::{EngineConfig, WorkerConfig};
pub use context::{DataSource, ProcessingContext, TraversalReport};
pub use engine::{ContextRehydrator, KarEngine, ResumeOutcome, SnapshotRehydrator, TraversalOptions};
pub use error::{ConditionError, ExecutorError, KarError, KarResult, SchedulerError, StoreError};
pub use executor::{ActionExecutor, ActionOutcome, ExecutorRegistry};
pub use matcher::{MatchElement, MatchedTriggerCodes, TriggerCodeStatus, match_code};
pub use memory::{InMemoryScheduler, InMemoryStateStore};
pub use scheduler::{JobHandle, ResumeTask, ResumeTaskQueue, ScheduledJob, Scheduler, TaskStatus};
pub use state::{
    ActionStatus, ContextSnapshot, ExecutionState, ExecutionStateStore, ExecutionStatus,
    PendingResume, ResumeReason, ResumeStatus,
};
pub use worker::{ProcessStats, ResumeWorker};
