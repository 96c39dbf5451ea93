//! The action-tree walker.
//!
//! A traversal visits triggered roots, gates each node on its conditions,
//! runs its executor, recurses into sub-actions and then walks its
//! "before-start" related actions. Timed nodes and offset edges are persisted
//! as pending resumes and handed to the [`Scheduler`]; the scheduler later
//! calls [`KarEngine::resume`] with a context rebuilt from the stored state.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use bsa_core::FhirDuration;
use dashmap::DashMap;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::action::{ActionId, ActionNode};
use crate::artifact::KnowledgeArtifact;
use crate::condition::ConditionRegistry;
use crate::config::EngineConfig;
use crate::context::{ProcessingContext, TraversalReport};
use crate::error::{KarError, KarResult, StoreError};
use crate::executor::{ActionOutcome, ExecutorRegistry};
use crate::scheduler::{JobHandle, ScheduledJob, Scheduler};
use crate::state::{
    ActionStatus, ExecutionState, ExecutionStateStore, PendingResume, ResumeReason, ResumeStatus,
};

/// Per-traversal switches, threaded through every visit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraversalOptions {
    /// Run timed nodes and offset edges synchronously, scheduling nothing.
    pub ignore_timers: bool,
}

/// How a node is entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    /// Evaluate conditions and timing, then execute.
    Visit,
    /// The node's own timer elapsed: its gate already passed, execute directly.
    ResumeTiming,
}

/// Result of a resume request.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    /// The deferred action was visited.
    Executed(TraversalReport),
    /// The context was terminated; nothing ran.
    Terminated,
    /// No pending resume is recorded for the action.
    NotPending,
    /// The action already finished; nothing ran.
    AlreadyCompleted,
    /// Another invocation claimed the action and is running it.
    AlreadyRunning,
    /// The context's artifact is no longer registered.
    ArtifactMissing,
    /// The artifact no longer contains the action.
    ActionMissing,
}

impl ResumeOutcome {
    pub fn is_executed(&self) -> bool {
        matches!(self, Self::Executed(_))
    }
}

/// Rebuilds a processing context for a resumed branch.
#[async_trait]
pub trait ContextRehydrator: Send + Sync {
    async fn rehydrate(
        &self,
        artifact: Arc<KnowledgeArtifact>,
        state: ExecutionState,
    ) -> KarResult<ProcessingContext>;
}

/// Restores the context from the snapshot stored with the execution state.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotRehydrator;

#[async_trait]
impl ContextRehydrator for SnapshotRehydrator {
    async fn rehydrate(
        &self,
        artifact: Arc<KnowledgeArtifact>,
        state: ExecutionState,
    ) -> KarResult<ProcessingContext> {
        Ok(ProcessingContext::from_state(artifact, state))
    }
}

pub struct KarEngine {
    config: EngineConfig,
    artifacts: DashMap<String, Arc<KnowledgeArtifact>>,
    conditions: ConditionRegistry,
    executors: ExecutorRegistry,
    store: Arc<dyn ExecutionStateStore>,
    scheduler: Arc<dyn Scheduler>,
    rehydrator: Arc<dyn ContextRehydrator>,
}

impl KarEngine {
    /// Engine with the default condition evaluators and no executors.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn ExecutionStateStore>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            config,
            artifacts: DashMap::new(),
            conditions: ConditionRegistry::with_defaults(),
            executors: ExecutorRegistry::new(),
            store,
            scheduler,
            rehydrator: Arc::new(SnapshotRehydrator),
        }
    }

    pub fn with_conditions(mut self, conditions: ConditionRegistry) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn with_executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = executors;
        self
    }

    pub fn with_rehydrator(mut self, rehydrator: Arc<dyn ContextRehydrator>) -> Self {
        self.rehydrator = rehydrator;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Traversal options derived from configuration.
    pub fn options(&self) -> TraversalOptions {
        TraversalOptions {
            ignore_timers: self.config.ignore_timers,
        }
    }

    /// Register an artifact after resolving every executor and condition
    /// processor it needs. Replaces an artifact with the same id.
    pub fn register_artifact(&self, artifact: KnowledgeArtifact) -> KarResult<Arc<KnowledgeArtifact>> {
        for node in artifact.actions() {
            if !self.executors.contains(node.action_type) {
                return Err(KarError::UnsupportedActionType {
                    action_id: node.id.to_string(),
                    action_type: node.action_type.to_string(),
                });
            }
            if let Some(condition) = node
                .conditions
                .iter()
                .find(|c| !self.conditions.contains(c.processor))
            {
                return Err(KarError::UnsupportedConditionProcessor {
                    action_id: node.id.to_string(),
                    processor: condition.processor.to_string(),
                });
            }
        }

        for (source, edge) in artifact.unresolved_edges() {
            warn!(
                artifact_id = %artifact.id(),
                action_id = %source,
                related_action_id = %edge.related_action_id,
                "Related action target not found in artifact, edge will be skipped"
            );
        }
        artifact.log_summary();

        let artifact = Arc::new(artifact);
        if self
            .artifacts
            .insert(artifact.id().to_string(), artifact.clone())
            .is_some()
        {
            info!(artifact_id = %artifact.id(), "Artifact replaced");
        } else {
            info!(artifact_id = %artifact.id(), "Artifact registered");
        }
        Ok(artifact)
    }

    pub fn artifact(&self, id: &str) -> Option<Arc<KnowledgeArtifact>> {
        self.artifacts.get(id).map(|a| a.value().clone())
    }

    pub fn artifact_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.artifacts.iter().map(|a| a.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Fresh processing context for an event against a registered artifact.
    pub fn new_context(&self, artifact_id: &str) -> KarResult<ProcessingContext> {
        let artifact = self
            .artifact(artifact_id)
            .ok_or_else(|| KarError::ArtifactNotFound(artifact_id.to_string()))?;
        Ok(ProcessingContext::new(artifact))
    }

    /// Visit every root triggered by `named_event`, in artifact order.
    pub async fn handle_named_event(
        &self,
        ctx: &mut ProcessingContext,
        named_event: &str,
    ) -> KarResult<TraversalReport> {
        self.handle_named_event_with(ctx, named_event, self.options())
            .await
    }

    pub async fn handle_named_event_with(
        &self,
        ctx: &mut ProcessingContext,
        named_event: &str,
        options: TraversalOptions,
    ) -> KarResult<TraversalReport> {
        ctx.set_named_event(named_event);
        let artifact = ctx.artifact().clone();
        let roots: Vec<ActionId> = artifact
            .roots_for_event(named_event)
            .map(|node| node.id.clone())
            .collect();

        info!(
            context_id = %ctx.id(),
            artifact_id = %artifact.id(),
            named_event,
            roots = roots.len(),
            "Handling named event"
        );

        for root in roots {
            self.visit(ctx, root, Entry::Visit, options).await;
        }

        self.flush(ctx).await;
        Ok(ctx.report())
    }

    /// Visit a single action, as a clinical-event hook does.
    pub async fn execute_action(
        &self,
        ctx: &mut ProcessingContext,
        action_id: &ActionId,
        options: TraversalOptions,
    ) -> KarResult<TraversalReport> {
        if ctx.artifact().action(action_id).is_none() {
            return Err(KarError::invalid_artifact(
                ctx.artifact().id(),
                format!("unknown action {action_id}"),
            ));
        }
        self.visit(ctx, action_id.clone(), Entry::Visit, options)
            .await;
        self.flush(ctx).await;
        Ok(ctx.report())
    }

    /// Persist the final statuses of a context that has deferred work.
    async fn flush(&self, ctx: &mut ProcessingContext) {
        if !ctx.state().is_persisted() {
            return;
        }
        if let Err(e) = self.persist(ctx, |_| {}).await {
            error!(context_id = %ctx.id(), error = %e, "Failed to persist final execution state");
        }
    }

    fn visit<'a>(
        &'a self,
        ctx: &'a mut ProcessingContext,
        action_id: ActionId,
        entry: Entry,
        options: TraversalOptions,
    ) -> BoxFuture<'a, ()> {
        async move {
            let artifact = ctx.artifact().clone();
            let Some(node) = artifact.action(&action_id) else {
                warn!(action_id = %action_id, "Action not found in artifact, skipping");
                return;
            };
            if ctx.is_terminated() {
                debug!(action_id = %node.id, "Context terminated, not visiting action");
                return;
            }
            ctx.set_current_action(&node.id);

            if entry == Entry::Visit {
                if !self.conditions.conditions_met(node, ctx) {
                    info!(action_id = %node.id, "Conditions not met, skipping action");
                    ctx.set_status(&node.id, ActionStatus::Skipped);
                    return;
                }

                if !options.ignore_timers
                    && let Some(offset) = node.timing_offset()
                {
                    let offset = if offset.is_zero() {
                        self.config.default_timing_offset
                    } else {
                        offset
                    };
                    self.defer_or_fail(ctx, node, offset, ResumeReason::TimingSchedule, None)
                        .await;
                    return;
                }
            }

            ctx.set_status(&node.id, ActionStatus::InProgress);
            if !self.run_executor(ctx, node).await {
                return;
            }

            for sub_action in &node.sub_actions {
                self.visit(ctx, sub_action.clone(), Entry::Visit, options)
                    .await;
            }
            self.execute_related_actions(ctx, node, options).await;

            ctx.set_status(&node.id, ActionStatus::Completed);
        }
        .boxed()
    }

    /// Run the node's executor. Returns whether dependents should be walked.
    ///
    /// A failing or panicking executor leaves no inputs, outputs or trigger
    /// results behind.
    async fn run_executor(&self, ctx: &mut ProcessingContext, node: &ActionNode) -> bool {
        let Some(executor) = self.executors.get(node.action_type).cloned() else {
            error!(
                action_id = %node.id,
                action_type = %node.action_type,
                "No executor registered for action type"
            );
            ctx.set_status(&node.id, ActionStatus::Failed);
            return false;
        };

        let checkpoint = ctx.checkpoint();
        let result = AssertUnwindSafe(executor.execute(ctx, node))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(ActionOutcome::Proceed)) => {
                debug!(action_id = %node.id, executor = executor.name(), "Action executed");
                true
            }
            Ok(Ok(ActionOutcome::Halt)) => {
                info!(action_id = %node.id, executor = executor.name(), "Action halted its dependents");
                ctx.set_status(&node.id, ActionStatus::Completed);
                false
            }
            Ok(Err(e)) => {
                error!(
                    action_id = %node.id,
                    executor = executor.name(),
                    error = %e,
                    "Action execution failed"
                );
                ctx.rollback(checkpoint);
                ctx.set_status(&node.id, ActionStatus::Failed);
                false
            }
            Err(panic) => {
                error!(
                    action_id = %node.id,
                    executor = executor.name(),
                    panic = %panic_message(panic.as_ref()),
                    "Action executor panicked"
                );
                ctx.rollback(checkpoint);
                ctx.set_status(&node.id, ActionStatus::Failed);
                false
            }
        }
    }

    fn execute_related_actions<'a>(
        &'a self,
        ctx: &'a mut ProcessingContext,
        node: &'a ActionNode,
        options: TraversalOptions,
    ) -> BoxFuture<'a, ()> {
        async move {
            let artifact = ctx.artifact().clone();
            for (relationship, edges) in &node.related_actions {
                if !relationship.is_actionable() {
                    for edge in edges {
                        debug!(
                            action_id = %node.id,
                            relationship = %relationship,
                            related_action_id = %edge.related_action_id,
                            "Relationship not executed"
                        );
                    }
                    continue;
                }

                for edge in edges {
                    let Some(target) = artifact.action(&edge.related_action_id) else {
                        warn!(
                            action_id = %node.id,
                            related_action_id = %edge.related_action_id,
                            "Related action target not found, skipping"
                        );
                        continue;
                    };

                    match edge.offset {
                        Some(offset) if !options.ignore_timers => {
                            self.defer_or_fail(
                                ctx,
                                target,
                                offset,
                                ResumeReason::RelatedAction,
                                Some(&node.id),
                            )
                            .await;
                        }
                        _ => {
                            debug!(
                                action_id = %node.id,
                                related_action_id = %target.id,
                                "Executing related action"
                            );
                            self.visit(ctx, target.id.clone(), Entry::Visit, options)
                                .await;
                        }
                    }
                }
            }
        }
        .boxed()
    }

    /// Defer `node`; on failure record it and mark the node failed.
    async fn defer_or_fail(
        &self,
        ctx: &mut ProcessingContext,
        node: &ActionNode,
        offset: FhirDuration,
        reason: ResumeReason,
        source: Option<&ActionId>,
    ) {
        if let Err(e) = self.defer(ctx, node, offset, reason, source).await {
            error!(
                context_id = %ctx.id(),
                action_id = %node.id,
                error = %e,
                "Failed to defer action, branch will not run"
            );
            ctx.record_deferral_failure(&node.id, &e);
            ctx.set_status(&node.id, ActionStatus::Failed);

            let action_id = node.id.clone();
            let mark_failed = |state: &mut ExecutionState| {
                if let Some(pending) = state.pending.get_mut(&action_id) {
                    pending.status = ResumeStatus::Failed;
                }
            };
            if ctx.state().pending.contains_key(&node.id)
                && let Err(e) = self.persist(ctx, mark_failed).await
            {
                error!(context_id = %ctx.id(), action_id = %node.id, error = %e, "Failed to record deferral failure");
            }
        }
    }

    /// Persist a pending resume for `node`, then register the scheduler job.
    async fn defer(
        &self,
        ctx: &mut ProcessingContext,
        node: &ActionNode,
        offset: FhirDuration,
        reason: ResumeReason,
        source: Option<&ActionId>,
    ) -> KarResult<JobHandle> {
        let fire_at = offset.after(OffsetDateTime::now_utc())?;
        let pending = PendingResume {
            action_type: node.action_type,
            fire_at,
            reason,
            status: ResumeStatus::Pending,
            source_action: source.cloned(),
        };

        let action_id = node.id.clone();
        self.persist(ctx, |state| {
            state.pending.insert(action_id.clone(), pending.clone());
            state
                .action_statuses
                .insert(action_id.clone(), ActionStatus::Scheduled);
        })
        .await?;

        let handle = self
            .scheduler
            .schedule_job(ScheduledJob {
                context_id: ctx.id(),
                action_id: node.id.clone(),
                action_type: node.action_type,
                fire_at,
            })
            .await?;

        info!(
            context_id = %ctx.id(),
            action_id = %node.id,
            reason = ?reason,
            fire_at = %fire_at,
            job_id = %handle.id,
            "Action deferred"
        );
        ctx.record_scheduled(handle.clone());
        Ok(handle)
    }

    /// Read-modify-write of the context's execution state.
    ///
    /// On a version conflict the stored copy is re-read, local progress is
    /// folded into it and `mutate` is applied again. Only statuses this
    /// context changed since its last save override the stored ones.
    async fn persist<F>(&self, ctx: &mut ProcessingContext, mutate: F) -> KarResult<()>
    where
        F: Fn(&mut ExecutionState) + Send + Sync,
    {
        let changed = ctx.changed_statuses().clone();
        let mut state = ctx.state_for_save();
        mutate(&mut state);

        let mut attempts = 0;
        loop {
            match self.store.save_or_update(&state).await {
                Ok(mut stored) => {
                    if attempts > 0 {
                        // The merged snapshot now holds the other writer's entries.
                        ctx.adopt_snapshot(std::mem::take(&mut stored.snapshot));
                    }
                    ctx.replace_state(stored);
                    return Ok(());
                }
                Err(StoreError::VersionConflict {
                    expected, actual, ..
                }) if attempts < self.config.max_state_write_retries => {
                    attempts += 1;
                    warn!(
                        context_id = %ctx.id(),
                        expected,
                        actual,
                        attempt = attempts,
                        "Execution state version conflict, retrying"
                    );
                    let mut latest = match self.store.get_by_id(ctx.id()).await? {
                        Some(latest) => latest,
                        None => {
                            state.version = 0;
                            continue;
                        }
                    };
                    latest.absorb(&state, &changed);
                    mutate(&mut latest);
                    state = latest;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Scheduler callback: run one deferred action of a stored context.
    ///
    /// Safe to invoke repeatedly; only the first call for a pending action
    /// executes it. An error after the claim puts the entry back to pending
    /// before it is returned, so a retry runs the action.
    pub async fn resume(&self, context_id: Uuid, action_id: &ActionId) -> KarResult<ResumeOutcome> {
        let state = self
            .store
            .get_by_id(context_id)
            .await?
            .ok_or(KarError::ContextNotFound(context_id))?;

        if state.is_terminated() {
            info!(context_id = %context_id, action_id = %action_id, "Context terminated, resume is a no-op");
            return Ok(ResumeOutcome::Terminated);
        }

        let Some(pending) = state.pending.get(action_id).cloned() else {
            warn!(context_id = %context_id, action_id = %action_id, "No pending resume for action");
            return Ok(ResumeOutcome::NotPending);
        };
        match pending.status {
            ResumeStatus::Completed | ResumeStatus::Failed => {
                info!(context_id = %context_id, action_id = %action_id, "Action already finished, resume is a no-op");
                return Ok(ResumeOutcome::AlreadyCompleted);
            }
            ResumeStatus::InProgress => {
                info!(context_id = %context_id, action_id = %action_id, "Action already running, resume is a no-op");
                return Ok(ResumeOutcome::AlreadyRunning);
            }
            ResumeStatus::Pending => {}
        }

        let Some(artifact) = self.artifact(&state.artifact_id) else {
            warn!(context_id = %context_id, artifact_id = %state.artifact_id, "Artifact no longer registered");
            return Ok(ResumeOutcome::ArtifactMissing);
        };
        if artifact.action(action_id).is_none() {
            warn!(context_id = %context_id, action_id = %action_id, "Action no longer in artifact");
            return Ok(ResumeOutcome::ActionMissing);
        }

        // Claim without retry: a conflicting writer surfaces as an error and
        // the caller retries against the fresh state.
        let mut claimed = state;
        if let Some(entry) = claimed.pending.get_mut(action_id) {
            entry.status = ResumeStatus::InProgress;
        }
        let claimed = self.store.save_or_update(&claimed).await?;

        match self.run_claimed(artifact, claimed, action_id, pending.reason).await {
            Ok(report) => Ok(ResumeOutcome::Executed(report)),
            Err(e) => {
                error!(context_id = %context_id, action_id = %action_id, error = %e, "Resume failed after claim");
                if let Err(release) = self.release_claim(context_id, action_id).await {
                    error!(
                        context_id = %context_id,
                        action_id = %action_id,
                        error = %release,
                        "Failed to release resume claim"
                    );
                }
                Err(e)
            }
        }
    }

    async fn run_claimed(
        &self,
        artifact: Arc<KnowledgeArtifact>,
        claimed: ExecutionState,
        action_id: &ActionId,
        reason: ResumeReason,
    ) -> KarResult<TraversalReport> {
        let context_id = claimed.id;
        let mut ctx = self.rehydrator.rehydrate(artifact, claimed).await?;
        let entry = match reason {
            ResumeReason::TimingSchedule => Entry::ResumeTiming,
            ResumeReason::RelatedAction => Entry::Visit,
        };
        info!(
            context_id = %context_id,
            action_id = %action_id,
            reason = ?reason,
            "Resuming deferred action"
        );
        self.visit(&mut ctx, action_id.clone(), entry, self.options())
            .await;

        let finished = match ctx.status(action_id) {
            ActionStatus::Failed => ResumeStatus::Failed,
            _ => ResumeStatus::Completed,
        };
        let target = action_id.clone();
        self.persist(&mut ctx, |state| {
            // A re-deferral replaced the entry; leave the new one pending.
            if let Some(entry) = state.pending.get_mut(&target)
                && entry.status == ResumeStatus::InProgress
            {
                entry.status = finished;
            }
        })
        .await?;

        Ok(ctx.report())
    }

    /// Put a claimed entry back to pending so a later resume can run it.
    async fn release_claim(&self, context_id: Uuid, action_id: &ActionId) -> KarResult<()> {
        let mut attempts = 0;
        loop {
            let Some(mut state) = self.store.get_by_id(context_id).await? else {
                return Ok(());
            };
            match state.pending.get_mut(action_id) {
                Some(entry) if entry.status == ResumeStatus::InProgress => {
                    entry.status = ResumeStatus::Pending;
                }
                _ => return Ok(()),
            }
            match self.store.save_or_update(&state).await {
                Ok(_) => {
                    info!(context_id = %context_id, action_id = %action_id, "Resume claim released");
                    return Ok(());
                }
                Err(StoreError::VersionConflict { .. })
                    if attempts < self.config.max_state_write_retries =>
                {
                    attempts += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Stored execution state of a context.
    pub async fn execution_state(&self, context_id: Uuid) -> KarResult<Option<ExecutionState>> {
        Ok(self.store.get_by_id(context_id).await?)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

impl std::fmt::Debug for KarEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KarEngine")
            .field("config", &self.config)
            .field("artifacts", &self.artifact_ids())
            .field("conditions", &self.conditions)
            .field("executors", &self.executors)
            .finish()
    }
}
