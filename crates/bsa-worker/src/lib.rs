//! Command-line host for the KAR engine.
//!
//! Wires the engine to file-backed collaborators: artifact definitions and
//! patient bundles are read from disk, reports are written to disk, and
//! deferred actions are drained by the in-process resume worker.

pub mod adapters;
pub mod cli;
pub mod config;
pub mod loader;
pub mod observability;

use std::sync::Arc;

use bsa_kar::actions::WorkflowStep;
use bsa_kar::{
    ActionType, EhrQueryService, ExecutorRegistry, InMemoryScheduler, InMemoryStateStore,
    KarEngine, TaskStatus,
};

use crate::adapters::{CreateReportBundle, FileReportSubmitter};
use crate::config::AppConfig;

/// Engine plus the in-memory collaborators it was built with.
pub struct Runtime {
    pub engine: Arc<KarEngine>,
    pub store: Arc<InMemoryStateStore>,
    pub scheduler: Arc<InMemoryScheduler>,
}

impl Runtime {
    pub fn build(config: &AppConfig, ehr: Arc<dyn EhrQueryService>) -> Self {
        let submitter = Arc::new(FileReportSubmitter::new(&config.reports.output_dir));
        let mut executors = ExecutorRegistry::builtin(ehr, submitter);
        executors.register(ActionType::CreateReport, Arc::new(CreateReportBundle));
        // Measure evaluation and report validation happen downstream.
        executors.register(ActionType::EvaluateMeasure, Arc::new(WorkflowStep));
        executors.register(ActionType::ValidateReport, Arc::new(WorkflowStep));

        let store = Arc::new(InMemoryStateStore::new());
        let scheduler = Arc::new(InMemoryScheduler::new());
        let engine = KarEngine::new(config.engine.clone(), store.clone(), scheduler.clone())
            .with_executors(executors);

        Self {
            engine: Arc::new(engine),
            store,
            scheduler,
        }
    }

    /// Resume tasks not yet completed or failed.
    pub fn outstanding_tasks(&self) -> usize {
        self.scheduler
            .tasks()
            .iter()
            .filter(|task| matches!(task.status, TaskStatus::Pending | TaskStatus::Running))
            .count()
    }
}
