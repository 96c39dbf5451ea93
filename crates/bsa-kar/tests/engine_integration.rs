//! End-to-end traversal tests against the in-memory collaborators.
//!
//! Run with: cargo test -p bsa-kar --test engine_integration

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bsa_core::Resource;
use bsa_kar::actions::Terminate;
use bsa_kar::{
    ActionExecutor, ActionId, ActionNode, ActionOutcome, ActionStatus, ActionType, ArtifactSpec,
    ConditionError, ConditionEvaluator, ConditionRegistry, ConditionSpec, ContextRehydrator,
    DataSource, EngineConfig, ExecutionState, ExecutionStateStore, ExecutorError,
    ExecutorRegistry, InMemoryScheduler, InMemoryStateStore, JobHandle, KarEngine, KarError,
    KarResult, KnowledgeArtifact, ProcessingContext, ProcessorKind, ResumeOutcome, ResumeStatus,
    ResumeTask, ResumeTaskQueue, ResumeWorker, ScheduledJob, Scheduler, SchedulerError,
    SnapshotRehydrator, StoreError, TaskStatus, TraversalOptions, WorkerConfig,
};
use serde_json::{Value, json};
use time::OffsetDateTime;
use uuid::Uuid;

const PD: &str = "pd-ersd";

fn id(raw: &str) -> ActionId {
    ActionId::compose(raw, PD)
}

/// Records every execution and writes one output per action.
#[derive(Default)]
struct SpyExecutor {
    runs: Mutex<Vec<ActionId>>,
}

impl SpyExecutor {
    fn count(&self, action: &ActionId) -> usize {
        self.runs.lock().unwrap().iter().filter(|a| *a == action).count()
    }
}

#[async_trait]
impl ActionExecutor for SpyExecutor {
    fn name(&self) -> &str {
        "spy"
    }

    async fn execute(
        &self,
        ctx: &mut ProcessingContext,
        node: &ActionNode,
    ) -> Result<ActionOutcome, ExecutorError> {
        self.runs.lock().unwrap().push(node.id.clone());
        let output = Resource::from_value(json!({"resourceType": "Basic", "id": node.id.as_str()}))
            .map_err(|e| ExecutorError::Failed(e.to_string()))?;
        ctx.set_output(&node.id, "out", output);
        Ok(ActionOutcome::Proceed)
    }
}

/// Writes a partial output and a fetched input before failing.
fn write_partial(ctx: &mut ProcessingContext, node: &ActionNode) {
    let partial = Resource::from_value(json!({"resourceType": "Basic", "id": "partial"})).unwrap();
    ctx.set_output(&node.id, "out", partial);
    let leaked = Resource::from_value(json!({"resourceType": "Encounter", "id": "leak"})).unwrap();
    ctx.add_input_resource(leaked);
}

struct FailingExecutor;

#[async_trait]
impl ActionExecutor for FailingExecutor {
    fn name(&self) -> &str {
        "failing"
    }

    async fn execute(
        &self,
        ctx: &mut ProcessingContext,
        node: &ActionNode,
    ) -> Result<ActionOutcome, ExecutorError> {
        write_partial(ctx, node);
        Err(ExecutorError::Collaborator("report validator unreachable".into()))
    }
}

struct PanickingExecutor;

#[async_trait]
impl ActionExecutor for PanickingExecutor {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn execute(
        &self,
        ctx: &mut ProcessingContext,
        node: &ActionNode,
    ) -> Result<ActionOutcome, ExecutorError> {
        write_partial(ctx, node);
        panic!("measure engine crashed");
    }
}

/// Fails the first rehydration, then restores from the snapshot.
#[derive(Default)]
struct FlakyRehydrator {
    failed: AtomicBool,
}

#[async_trait]
impl ContextRehydrator for FlakyRehydrator {
    async fn rehydrate(
        &self,
        artifact: Arc<KnowledgeArtifact>,
        state: ExecutionState,
    ) -> KarResult<ProcessingContext> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(StoreError::Unavailable("ehr requery timed out".into()).into());
        }
        SnapshotRehydrator.rehydrate(artifact, state).await
    }
}

/// Delegates to the in-memory queue; the first `complete` fails.
struct FlakyQueue {
    inner: Arc<InMemoryScheduler>,
    failed: AtomicBool,
}

#[async_trait]
impl ResumeTaskQueue for FlakyQueue {
    async fn fetch_due(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<ResumeTask>, SchedulerError> {
        self.inner.fetch_due(now, limit).await
    }

    async fn complete(&self, id: Uuid) -> Result<(), SchedulerError> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::Unavailable("queue blip".into()));
        }
        self.inner.complete(id).await
    }

    async fn retry(
        &self,
        id: Uuid,
        next_attempt_at: OffsetDateTime,
        error: &str,
    ) -> Result<(), SchedulerError> {
        self.inner.retry(id, next_attempt_at, error).await
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<(), SchedulerError> {
        self.inner.fail(id, error).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<ResumeTask>, SchedulerError> {
        self.inner.get(id).await
    }

    async fn release_stale(&self, claimed_before: OffsetDateTime) -> Result<usize, SchedulerError> {
        self.inner.release_stale(claimed_before).await
    }
}

/// CQL stand-in: result is switchable and every call is counted.
struct SwitchEvaluator {
    result: AtomicBool,
    calls: AtomicUsize,
}

impl SwitchEvaluator {
    fn new(result: bool) -> Arc<Self> {
        Arc::new(Self {
            result: AtomicBool::new(result),
            calls: AtomicUsize::new(0),
        })
    }
}

impl ConditionEvaluator for SwitchEvaluator {
    fn evaluate(
        &self,
        condition: &ConditionSpec,
        _node: &ActionNode,
        _ctx: &mut ProcessingContext,
    ) -> Result<bool, ConditionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(match condition.expression.as_str() {
            "false" => false,
            _ => self.result.load(Ordering::SeqCst),
        })
    }
}

struct UnavailableScheduler;

#[async_trait]
impl Scheduler for UnavailableScheduler {
    async fn schedule_job(&self, _job: ScheduledJob) -> Result<JobHandle, SchedulerError> {
        Err(SchedulerError::Unavailable("queue offline".into()))
    }
}

struct Harness {
    engine: Arc<KarEngine>,
    scheduler: Arc<InMemoryScheduler>,
    store: Arc<InMemoryStateStore>,
    spy: Arc<SpyExecutor>,
    cql: Arc<SwitchEvaluator>,
}

impl Harness {
    fn new(spec: Value, config: EngineConfig) -> Self {
        let scheduler = Arc::new(InMemoryScheduler::new());
        Self::with_scheduler(spec, config, scheduler.clone(), scheduler)
    }

    fn with_scheduler(
        spec: Value,
        config: EngineConfig,
        scheduler: Arc<InMemoryScheduler>,
        engine_scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self::build(spec, config, scheduler, engine_scheduler, Arc::new(SnapshotRehydrator))
    }

    fn with_rehydrator(spec: Value, rehydrator: Arc<dyn ContextRehydrator>) -> Self {
        let scheduler = Arc::new(InMemoryScheduler::new());
        Self::build(
            spec,
            EngineConfig::default(),
            scheduler.clone(),
            scheduler,
            rehydrator,
        )
    }

    fn build(
        spec: Value,
        config: EngineConfig,
        scheduler: Arc<InMemoryScheduler>,
        engine_scheduler: Arc<dyn Scheduler>,
        rehydrator: Arc<dyn ContextRehydrator>,
    ) -> Self {
        let store = Arc::new(InMemoryStateStore::new());
        let spy = Arc::new(SpyExecutor::default());
        let cql = SwitchEvaluator::new(true);

        let mut executors = ExecutorRegistry::new();
        for action_type in [
            ActionType::InitiateReportingWorkflow,
            ActionType::EvaluateCondition,
            ActionType::CollectData,
            ActionType::CreateReport,
            ActionType::SubmitReport,
        ] {
            executors.register(action_type, spy.clone());
        }
        executors.register(ActionType::ValidateReport, Arc::new(FailingExecutor));
        executors.register(ActionType::EvaluateMeasure, Arc::new(PanickingExecutor));
        executors.register(ActionType::Terminate, Arc::new(Terminate));

        let mut conditions = ConditionRegistry::with_defaults();
        conditions.register(ProcessorKind::Cql, cql.clone());

        let engine = KarEngine::new(config, store.clone(), engine_scheduler)
            .with_executors(executors)
            .with_conditions(conditions)
            .with_rehydrator(rehydrator);
        let spec: ArtifactSpec = serde_json::from_value(spec).unwrap();
        engine
            .register_artifact(KnowledgeArtifact::build(spec).unwrap())
            .unwrap();

        Self {
            engine: Arc::new(engine),
            scheduler,
            store,
            spy,
            cql,
        }
    }

    fn context(&self) -> ProcessingContext {
        self.engine.new_context("ersd").unwrap().with_patient("patient-1")
    }
}

fn condition(id: &str, code: &str) -> Resource {
    Resource::from_value(json!({
        "resourceType": "Condition",
        "id": id,
        "subject": {"reference": "Patient/patient-1"},
        "code": {"coding": [{"system": "http://sys", "code": code}]}
    }))
    .unwrap()
}

/// R (root, no conditions) with sub-action S (trigger-code condition on V)
/// and a related edge to T.
fn artifact(relationship: &str, offset: Option<&str>) -> Value {
    let mut edge = json!({"actionId": "T", "relationship": relationship});
    if let Some(offset) = offset {
        edge["offset"] = json!(offset);
    }
    json!({
        "id": "ersd",
        "version": "2.1.0",
        "planDefinitions": [{
            "id": PD,
            "actions": [{
                "id": "R",
                "type": "initiate-reporting-workflow",
                "namedEvents": ["encounter-close"],
                "actions": [{
                    "id": "S",
                    "type": "evaluate-condition",
                    "input": [{
                        "id": "Conditions",
                        "type": "Condition",
                        "codeFilter": [{"path": "code", "valueSet": "http://vs/V"}]
                    }],
                    "conditions": [{"processor": "trigger-code", "expression": "%conditions"}]
                }],
                "relatedActions": [edge]
            }, {
                "id": "T",
                "type": "submit-report"
            }]
        }],
        "dependentResources": [{
            "resourceType": "ValueSet",
            "id": "V",
            "url": "http://vs/V",
            "compose": {"include": [{"system": "http://sys", "concept": [{"code": "A"}, {"code": "B"}]}]}
        }]
    })
}

#[tokio::test]
async fn test_end_to_end_schedules_target_one_day_out() {
    let h = Harness::new(artifact("before-start", Some("P1D")), EngineConfig::default());
    let mut ctx = h.context();
    ctx.add_input_resource(condition("c1", "A"));

    let before = OffsetDateTime::now_utc();
    let report = h.engine.handle_named_event(&mut ctx, "encounter-close").await.unwrap();
    let after = OffsetDateTime::now_utc();

    assert_eq!(report.status(&id("R")), Some(ActionStatus::Completed));
    assert_eq!(report.status(&id("S")), Some(ActionStatus::Completed));
    assert_eq!(report.status(&id("T")), Some(ActionStatus::Scheduled));
    assert_eq!(h.spy.count(&id("S")), 1);
    assert_eq!(h.spy.count(&id("T")), 0);
    assert!(ctx.trigger_status(&id("S")).unwrap().trigger_matched);

    assert_eq!(report.scheduled.len(), 1);
    let tasks = h.scheduler.tasks();
    assert_eq!(tasks.len(), 1);
    let job = &tasks[0].job;
    assert_eq!(job.action_id, id("T"));
    assert_eq!(job.action_type, ActionType::SubmitReport);
    assert_eq!(job.context_id, ctx.id());
    assert!(job.fire_at >= before + time::Duration::days(1));
    assert!(job.fire_at <= after + time::Duration::days(1));

    let stored = h.store.get_by_id(ctx.id()).await.unwrap().unwrap();
    assert!(stored.pending.contains_key(&id("T")));
    assert_eq!(stored.named_event.as_deref(), Some("encounter-close"));
    assert_eq!(stored.snapshot.input_resources["Condition"].len(), 1);
}

#[tokio::test]
async fn test_end_to_end_unmatched_code_skips_sub_action() {
    let h = Harness::new(artifact("before-start", Some("P1D")), EngineConfig::default());
    let mut ctx = h.context();
    ctx.add_input_resource(condition("c1", "Z"));

    let report = h.engine.handle_named_event(&mut ctx, "encounter-close").await.unwrap();

    assert_eq!(report.status(&id("S")), Some(ActionStatus::Skipped));
    assert_eq!(h.spy.count(&id("S")), 0);
    assert_eq!(h.spy.count(&id("T")), 0);
    assert_eq!(h.scheduler.len(), 1);
}

#[tokio::test]
async fn test_other_named_event_runs_nothing() {
    let h = Harness::new(artifact("before-start", None), EngineConfig::default());
    let mut ctx = h.context();
    let report = h.engine.handle_named_event(&mut ctx, "encounter-start").await.unwrap();
    assert!(report.statuses.is_empty());
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_edge_without_offset_runs_synchronously() {
    let h = Harness::new(artifact("before-start", None), EngineConfig::default());
    let mut ctx = h.context();

    let report = h.engine.handle_named_event(&mut ctx, "encounter-close").await.unwrap();

    assert_eq!(h.spy.count(&id("T")), 1);
    assert!(ctx.output(&id("T"), "out").is_some());
    assert_eq!(report.status(&id("T")), Some(ActionStatus::Completed));
    assert!(h.scheduler.is_empty());
    // Nothing deferred, nothing persisted.
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_ignore_timers_runs_offset_edge_synchronously() {
    let config = EngineConfig {
        ignore_timers: true,
        ..Default::default()
    };
    let h = Harness::new(artifact("before-start", Some("P1D")), config);
    let mut ctx = h.context();

    let report = h.engine.handle_named_event(&mut ctx, "encounter-close").await.unwrap();

    assert_eq!(h.spy.count(&id("T")), 1);
    assert!(report.scheduled.is_empty());
    assert!(h.scheduler.is_empty());
}

#[tokio::test]
async fn test_ignore_timers_per_traversal() {
    let h = Harness::new(artifact("before-start", Some("P1D")), EngineConfig::default());
    let mut ctx = h.context();

    h.engine
        .handle_named_event_with(
            &mut ctx,
            "encounter-close",
            TraversalOptions { ignore_timers: true },
        )
        .await
        .unwrap();

    assert_eq!(h.spy.count(&id("T")), 1);
    assert!(h.scheduler.is_empty());
}

#[tokio::test]
async fn test_non_before_start_edges_never_run() {
    for (relationship, offset) in [
        ("after", None),
        ("after-end", Some("PT1H")),
        ("concurrent-with-start", None),
        ("before-end", Some("P1D")),
    ] {
        let h = Harness::new(artifact(relationship, offset), EngineConfig::default());
        let mut ctx = h.context();

        let report = h.engine.handle_named_event(&mut ctx, "encounter-close").await.unwrap();

        assert_eq!(h.spy.count(&id("T")), 0, "{relationship} must not execute");
        assert!(h.scheduler.is_empty(), "{relationship} must not schedule");
        assert_eq!(report.status(&id("T")), None);
        assert_eq!(report.status(&id("R")), Some(ActionStatus::Completed));
    }
}

#[tokio::test]
async fn test_resume_is_idempotent() {
    let h = Harness::new(artifact("before-start", Some("P1D")), EngineConfig::default());
    let mut ctx = h.context();
    h.engine.handle_named_event(&mut ctx, "encounter-close").await.unwrap();

    let first = h.engine.resume(ctx.id(), &id("T")).await.unwrap();
    match &first {
        ResumeOutcome::Executed(report) => {
            assert_eq!(report.status(&id("T")), Some(ActionStatus::Completed));
        }
        other => panic!("expected execution, got {other:?}"),
    }
    assert_eq!(h.spy.count(&id("T")), 1);

    let second = h.engine.resume(ctx.id(), &id("T")).await.unwrap();
    assert_eq!(second, ResumeOutcome::AlreadyCompleted);
    assert_eq!(h.spy.count(&id("T")), 1);

    let stored = h.store.get_by_id(ctx.id()).await.unwrap().unwrap();
    assert_eq!(stored.action_statuses[&id("T")], ActionStatus::Completed);
}

#[tokio::test]
async fn test_resume_sees_snapshot_data() {
    let h = Harness::new(artifact("before-start", Some("P1D")), EngineConfig::default());
    let mut ctx = h.context();
    ctx.add_input_resource(condition("c1", "A"));
    h.engine.handle_named_event(&mut ctx, "encounter-close").await.unwrap();

    let outcome = h.engine.resume(ctx.id(), &id("T")).await.unwrap();
    assert!(outcome.is_executed());

    let stored = h.store.get_by_id(ctx.id()).await.unwrap().unwrap();
    // Outputs of the first traversal survive alongside the resumed action's.
    assert!(stored.snapshot.output_resources.contains_key(&id("S")));
    assert!(stored.snapshot.output_resources.contains_key(&id("T")));
}

#[tokio::test]
async fn test_resume_error_after_claim_releases_it_for_retry() {
    let h = Harness::with_rehydrator(
        artifact("before-start", Some("P1D")),
        Arc::new(FlakyRehydrator::default()),
    );
    let mut ctx = h.context();
    h.engine.handle_named_event(&mut ctx, "encounter-close").await.unwrap();

    let err = h.engine.resume(ctx.id(), &id("T")).await.unwrap_err();
    assert!(matches!(err, KarError::Store(StoreError::Unavailable(_))));
    let stored = h.store.get_by_id(ctx.id()).await.unwrap().unwrap();
    assert_eq!(stored.pending[&id("T")].status, ResumeStatus::Pending);
    assert_eq!(h.spy.count(&id("T")), 0);

    let retry = h.engine.resume(ctx.id(), &id("T")).await.unwrap();
    assert!(retry.is_executed());
    assert_eq!(h.spy.count(&id("T")), 1);
    let stored = h.store.get_by_id(ctx.id()).await.unwrap().unwrap();
    assert_eq!(stored.pending[&id("T")].status, ResumeStatus::Completed);
}

#[tokio::test]
async fn test_trigger_status_survives_resume() {
    let h = Harness::new(artifact("before-start", Some("P1D")), EngineConfig::default());
    let mut ctx = h.context();
    ctx.add_input_resource(condition("c1", "A"));
    h.engine.handle_named_event(&mut ctx, "encounter-close").await.unwrap();

    let stored = h.store.get_by_id(ctx.id()).await.unwrap().unwrap();
    assert!(stored.snapshot.trigger_status.contains_key(&id("S")));

    let outcome = h.engine.resume(ctx.id(), &id("T")).await.unwrap();
    assert!(outcome.is_executed());

    let stored = h.store.get_by_id(ctx.id()).await.unwrap().unwrap();
    let restored = ProcessingContext::from_state(h.engine.artifact("ersd").unwrap(), stored);
    let status = restored.trigger_status(&id("S")).unwrap();
    assert!(status.trigger_matched);
    assert!(status.code_tokens().contains("http://sys|A"));
}

#[tokio::test]
async fn test_resume_unknown_context_is_error() {
    let h = Harness::new(artifact("before-start", Some("P1D")), EngineConfig::default());
    let err = h.engine.resume(Uuid::new_v4(), &id("T")).await.unwrap_err();
    assert!(matches!(err, KarError::ContextNotFound(_)));
}

#[tokio::test]
async fn test_resume_not_pending_is_noop() {
    let h = Harness::new(artifact("before-start", Some("P1D")), EngineConfig::default());
    let mut ctx = h.context();
    h.engine.handle_named_event(&mut ctx, "encounter-close").await.unwrap();

    let outcome = h.engine.resume(ctx.id(), &id("S")).await.unwrap();
    assert_eq!(outcome, ResumeOutcome::NotPending);
    assert_eq!(h.spy.count(&id("S")), 1);
}

#[tokio::test]
async fn test_worker_drains_due_tasks() {
    let h = Harness::new(artifact("before-start", Some("PT0S")), EngineConfig::default());
    let mut ctx = h.context();
    h.engine.handle_named_event(&mut ctx, "encounter-close").await.unwrap();
    assert_eq!(h.spy.count(&id("T")), 0);

    let worker = ResumeWorker::new(h.engine.clone(), h.scheduler.clone(), WorkerConfig::default());
    let stats = worker.process_due().await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(h.spy.count(&id("T")), 1);
    assert_eq!(h.scheduler.tasks()[0].status, TaskStatus::Completed);

    // Nothing left to claim.
    assert_eq!(worker.process_due().await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_worker_queue_error_does_not_strand_batch() {
    let h = Harness::new(artifact("before-start", Some("PT0S")), EngineConfig::default());
    let mut first = h.context();
    h.engine.handle_named_event(&mut first, "encounter-close").await.unwrap();
    let mut second = h.context();
    h.engine.handle_named_event(&mut second, "encounter-close").await.unwrap();
    assert_eq!(h.scheduler.len(), 2);

    let queue = Arc::new(FlakyQueue {
        inner: h.scheduler.clone(),
        failed: AtomicBool::new(false),
    });
    let config = WorkerConfig {
        claim_timeout_secs: 0,
        ..Default::default()
    };
    let worker = ResumeWorker::new(h.engine.clone(), queue, config);

    let stats = worker.process_due().await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.stranded, 1);
    // Both deferred branches ran despite the queue error.
    assert_eq!(h.spy.count(&id("T")), 2);

    // The stranded claim expires and the task settles as a no-op.
    let stats = worker.process_due().await.unwrap();
    assert_eq!(stats.released, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(h.spy.count(&id("T")), 2);
    assert!(
        h.scheduler
            .tasks()
            .iter()
            .all(|t| t.status == TaskStatus::Completed)
    );
}

#[tokio::test]
async fn test_worker_fails_task_for_missing_context() {
    let h = Harness::new(artifact("before-start", Some("P1D")), EngineConfig::default());
    let handle = h
        .scheduler
        .schedule_job(ScheduledJob {
            context_id: Uuid::new_v4(),
            action_id: id("T"),
            action_type: ActionType::SubmitReport,
            fire_at: OffsetDateTime::now_utc() - time::Duration::seconds(1),
        })
        .await
        .unwrap();

    let worker = ResumeWorker::new(h.engine.clone(), h.scheduler.clone(), WorkerConfig::default());
    let stats = worker.process_due().await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(h.scheduler.tasks()[0].id, handle.id);
    assert_eq!(h.scheduler.tasks()[0].status, TaskStatus::Failed);
}

fn timed_artifact() -> Value {
    json!({
        "id": "ersd",
        "planDefinitions": [{
            "id": PD,
            "actions": [{
                "id": "create",
                "type": "create-report",
                "namedEvents": ["encounter-close"],
                "conditions": [{"processor": "cql", "expression": "switch"}],
                "timing": [{"offset": "PT6H"}, {"offset": "PT2H"}],
                "relatedActions": [{"actionId": "submit", "relationship": "before-start"}]
            }, {
                "id": "submit",
                "type": "submit-report"
            }]
        }]
    })
}

#[tokio::test]
async fn test_timed_action_deferred_and_not_regated_on_resume() {
    let h = Harness::new(timed_artifact(), EngineConfig::default());
    let mut ctx = h.context();

    let before = OffsetDateTime::now_utc();
    let report = h.engine.handle_named_event(&mut ctx, "encounter-close").await.unwrap();
    assert_eq!(report.status(&id("create")), Some(ActionStatus::Scheduled));
    assert_eq!(h.spy.count(&id("create")), 0);
    assert_eq!(h.cql.calls.load(Ordering::SeqCst), 1);

    // Earliest offset wins.
    let fire_at = report.scheduled[0].fire_at;
    assert!(fire_at >= before + time::Duration::hours(2));
    assert!(fire_at < before + time::Duration::hours(3));

    // The gate decision stands even if the condition would now fail.
    h.cql.result.store(false, Ordering::SeqCst);
    let outcome = h.engine.resume(ctx.id(), &id("create")).await.unwrap();
    assert!(outcome.is_executed());
    assert_eq!(h.cql.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.spy.count(&id("create")), 1);
    // Its synchronous dependents run on resume.
    assert_eq!(h.spy.count(&id("submit")), 1);
}

#[tokio::test]
async fn test_all_conditions_evaluated_without_short_circuit() {
    let spec = json!({
        "id": "ersd",
        "planDefinitions": [{
            "id": PD,
            "actions": [{
                "id": "gate",
                "type": "evaluate-condition",
                "namedEvents": ["encounter-close"],
                "conditions": [
                    {"processor": "cql", "expression": "false"},
                    {"processor": "cql", "expression": "one"},
                    {"processor": "cql", "expression": "two"}
                ]
            }]
        }]
    });
    let h = Harness::new(spec, EngineConfig::default());
    let mut ctx = h.context();

    let report = h.engine.handle_named_event(&mut ctx, "encounter-close").await.unwrap();
    assert_eq!(report.status(&id("gate")), Some(ActionStatus::Skipped));
    assert_eq!(h.cql.calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.spy.count(&id("gate")), 0);
}

#[tokio::test]
async fn test_executor_failure_is_isolated() {
    let spec = json!({
        "id": "ersd",
        "planDefinitions": [{
            "id": PD,
            "actions": [{
                "id": "R",
                "type": "initiate-reporting-workflow",
                "namedEvents": ["encounter-close"],
                "actions": [
                    {
                        "id": "validate",
                        "type": "validate-report",
                        "relatedActions": [{"actionId": "after-validate", "relationship": "before-start"}]
                    },
                    {"id": "submit", "type": "submit-report"}
                ]
            }, {
                "id": "after-validate",
                "type": "submit-report"
            }]
        }]
    });
    let h = Harness::new(spec, EngineConfig::default());
    let mut ctx = h.context();

    let report = h.engine.handle_named_event(&mut ctx, "encounter-close").await.unwrap();
    assert_eq!(report.status(&id("validate")), Some(ActionStatus::Failed));
    assert_eq!(report.status(&id("submit")), Some(ActionStatus::Completed));
    assert_eq!(report.status(&id("R")), Some(ActionStatus::Completed));
    assert_eq!(h.spy.count(&id("after-validate")), 0);
    assert!(ctx.outputs_for(&id("validate")).is_none());
}

#[tokio::test]
async fn test_failed_executor_leaves_no_contribution() {
    let spec = json!({
        "id": "ersd",
        "planDefinitions": [{
            "id": PD,
            "actions": [{
                "id": "R",
                "type": "initiate-reporting-workflow",
                "namedEvents": ["encounter-close"],
                "actions": [
                    {"id": "validate", "type": "validate-report"},
                    {"id": "measure", "type": "evaluate-measure"},
                    {"id": "submit", "type": "submit-report"}
                ]
            }]
        }]
    });
    let h = Harness::new(spec, EngineConfig::default());
    let mut ctx = h.context();
    ctx.add_input_resource(condition("c1", "A"));

    let report = h.engine.handle_named_event(&mut ctx, "encounter-close").await.unwrap();

    assert_eq!(report.status(&id("validate")), Some(ActionStatus::Failed));
    assert_eq!(report.status(&id("measure")), Some(ActionStatus::Failed));
    assert_eq!(report.status(&id("submit")), Some(ActionStatus::Completed));
    assert!(ctx.outputs_for(&id("validate")).is_none());
    assert!(ctx.outputs_for(&id("measure")).is_none());
    assert!(ctx.resources_by_type("Encounter").is_empty());
    // Inputs present before the failures are untouched.
    assert_eq!(ctx.resources_by_type("Condition").len(), 1);
    assert!(ctx.output(&id("submit"), "out").is_some());
}

#[tokio::test]
async fn test_offset_beyond_calendar_range_fails_only_that_branch() {
    let h = Harness::new(artifact("before-start", Some("P20000Y")), EngineConfig::default());
    let mut ctx = h.context();
    ctx.add_input_resource(condition("c1", "A"));

    let report = h.engine.handle_named_event(&mut ctx, "encounter-close").await.unwrap();

    assert_eq!(report.deferral_failures.len(), 1);
    assert_eq!(report.deferral_failures[0].action_id, id("T"));
    assert!(report.deferral_failures[0].error.contains("duration"));
    assert_eq!(report.status(&id("T")), Some(ActionStatus::Failed));
    assert_eq!(report.status(&id("S")), Some(ActionStatus::Completed));
    assert_eq!(report.status(&id("R")), Some(ActionStatus::Completed));
    assert_eq!(h.spy.count(&id("T")), 0);
    assert!(h.scheduler.is_empty());
}

#[tokio::test]
async fn test_scheduler_outage_fails_only_deferred_branch() {
    let spec = json!({
        "id": "ersd",
        "planDefinitions": [{
            "id": PD,
            "actions": [{
                "id": "R",
                "type": "initiate-reporting-workflow",
                "namedEvents": ["encounter-close"],
                "relatedActions": [
                    {"actionId": "later", "relationship": "before-start", "offset": "PT1H"},
                    {"actionId": "now", "relationship": "before-start"}
                ]
            }, {
                "id": "later",
                "type": "submit-report"
            }, {
                "id": "now",
                "type": "create-report"
            }]
        }]
    });
    let h = Harness::with_scheduler(
        spec,
        EngineConfig::default(),
        Arc::new(InMemoryScheduler::new()),
        Arc::new(UnavailableScheduler),
    );
    let mut ctx = h.context();

    let report = h.engine.handle_named_event(&mut ctx, "encounter-close").await.unwrap();

    assert_eq!(report.deferral_failures.len(), 1);
    assert_eq!(report.deferral_failures[0].action_id, id("later"));
    assert_eq!(report.status(&id("later")), Some(ActionStatus::Failed));
    assert_eq!(h.spy.count(&id("now")), 1);
    assert_eq!(h.spy.count(&id("later")), 0);

    // The pending entry written before scheduling is marked failed, so a
    // stray resume does nothing.
    let outcome = h.engine.resume(ctx.id(), &id("later")).await.unwrap();
    assert_eq!(outcome, ResumeOutcome::AlreadyCompleted);
}

#[tokio::test]
async fn test_terminated_context_resume_is_noop() {
    let spec = json!({
        "id": "ersd",
        "planDefinitions": [{
            "id": PD,
            "actions": [{
                "id": "R",
                "type": "initiate-reporting-workflow",
                "namedEvents": ["encounter-close"],
                "relatedActions": [
                    {"actionId": "submit", "relationship": "before-start", "offset": "P1D"},
                    {"actionId": "end", "relationship": "before-start"}
                ]
            }, {
                "id": "submit",
                "type": "submit-report"
            }, {
                "id": "end",
                "type": "terminate"
            }]
        }]
    });
    let h = Harness::new(spec, EngineConfig::default());
    let mut ctx = h.context();
    h.engine.handle_named_event(&mut ctx, "encounter-close").await.unwrap();

    let stored = h.store.get_by_id(ctx.id()).await.unwrap().unwrap();
    assert!(stored.is_terminated());

    let outcome = h.engine.resume(ctx.id(), &id("submit")).await.unwrap();
    assert_eq!(outcome, ResumeOutcome::Terminated);
    assert_eq!(h.spy.count(&id("submit")), 0);
}

#[tokio::test]
async fn test_concurrent_writer_deferrals_are_kept() {
    let spec = json!({
        "id": "ersd",
        "planDefinitions": [{
            "id": PD,
            "actions": [{
                "id": "R",
                "type": "initiate-reporting-workflow",
                "namedEvents": ["encounter-close"],
                "relatedActions": [{"actionId": "T", "relationship": "before-start", "offset": "P1D"}]
            }, {
                "id": "U",
                "type": "initiate-reporting-workflow",
                "relatedActions": [{"actionId": "T2", "relationship": "before-start", "offset": "P2D"}]
            }, {
                "id": "T",
                "type": "submit-report"
            }, {
                "id": "T2",
                "type": "submit-report"
            }]
        }]
    });
    let h = Harness::new(spec, EngineConfig::default());
    let mut ctx = h.context();
    h.engine.handle_named_event(&mut ctx, "encounter-close").await.unwrap();

    // Another writer resumes T and records its output behind this
    // context's back.
    let stored = h.store.get_by_id(ctx.id()).await.unwrap().unwrap();
    let mut other: ExecutionState = stored.clone();
    other
        .action_statuses
        .insert(id("T"), ActionStatus::Completed);
    other.snapshot.output_resources.insert(
        id("T"),
        BTreeMap::from([(
            "out".to_string(),
            Resource::from_value(json!({"resourceType": "Basic", "id": "theirs"})).unwrap(),
        )]),
    );
    h.store.save_or_update(&other).await.unwrap();

    h.engine
        .execute_action(&mut ctx, &id("U"), TraversalOptions::default())
        .await
        .unwrap();

    let latest = h.store.get_by_id(ctx.id()).await.unwrap().unwrap();
    assert!(latest.pending.contains_key(&id("T")));
    assert!(latest.pending.contains_key(&id("T2")));
    assert_eq!(h.scheduler.len(), 2);

    // Both writers' outputs are kept, and the stale local status for T does
    // not overwrite the other writer's.
    assert!(latest.snapshot.output_resources.contains_key(&id("T")));
    assert!(latest.snapshot.output_resources.contains_key(&id("U")));
    assert!(latest.snapshot.output_resources.contains_key(&id("R")));
    assert_eq!(latest.action_statuses[&id("T")], ActionStatus::Completed);
    assert_eq!(latest.action_statuses[&id("T2")], ActionStatus::Scheduled);
}

#[tokio::test]
async fn test_registration_rejects_unsupported_action_type() {
    let spec: ArtifactSpec = serde_json::from_value(json!({
        "id": "measures",
        "planDefinitions": [{
            "id": PD,
            "actions": [{"id": "m", "type": "evaluate-measure"}]
        }]
    }))
    .unwrap();
    let engine = KarEngine::new(
        EngineConfig::default(),
        Arc::new(InMemoryStateStore::new()),
        Arc::new(InMemoryScheduler::new()),
    );
    let err = engine
        .register_artifact(KnowledgeArtifact::build(spec).unwrap())
        .unwrap_err();
    assert!(matches!(err, KarError::UnsupportedActionType { .. }));
    assert!(engine.artifact("measures").is_none());
}

#[tokio::test]
async fn test_registration_rejects_unsupported_processor() {
    let spec: ArtifactSpec = serde_json::from_value(json!({
        "id": "cql",
        "planDefinitions": [{
            "id": PD,
            "actions": [{
                "id": "c",
                "type": "terminate",
                "conditions": [{"processor": "cql", "expression": "x"}]
            }]
        }]
    }))
    .unwrap();
    let mut executors = ExecutorRegistry::new();
    executors.register(ActionType::Terminate, Arc::new(Terminate));
    let engine = KarEngine::new(
        EngineConfig::default(),
        Arc::new(InMemoryStateStore::new()),
        Arc::new(InMemoryScheduler::new()),
    )
    .with_executors(executors);

    let err = engine
        .register_artifact(KnowledgeArtifact::build(spec).unwrap())
        .unwrap_err();
    assert!(matches!(err, KarError::UnsupportedConditionProcessor { .. }));
}
