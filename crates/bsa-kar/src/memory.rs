//! In-memory collaborators: execution-state store and resume task queue.
//!
//! Suitable for tests and single-process deployments. Nothing here survives
//! a restart; durable deployments plug in their own implementations of the
//! same traits.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{SchedulerError, StoreError};
use crate::scheduler::{JobHandle, ResumeTask, ResumeTaskQueue, ScheduledJob, Scheduler, TaskStatus};
use crate::state::{ExecutionState, ExecutionStateStore};

/// Execution-state store with per-id optimistic versioning.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    states: DashMap<Uuid, ExecutionState>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[async_trait]
impl ExecutionStateStore for InMemoryStateStore {
    async fn save_or_update(&self, state: &ExecutionState) -> Result<ExecutionState, StoreError> {
        let mut stored = state.clone();
        stored.version = state.version + 1;
        stored.updated_at = OffsetDateTime::now_utc();

        match self.states.entry(state.id) {
            Entry::Occupied(mut occupied) => {
                let actual = occupied.get().version;
                if actual != state.version {
                    return Err(StoreError::VersionConflict {
                        id: state.id,
                        expected: state.version,
                        actual,
                    });
                }
                occupied.insert(stored.clone());
            }
            Entry::Vacant(vacant) => {
                if state.version != 0 {
                    return Err(StoreError::VersionConflict {
                        id: state.id,
                        expected: state.version,
                        actual: 0,
                    });
                }
                vacant.insert(stored.clone());
            }
        }

        Ok(stored)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<ExecutionState>, StoreError> {
        Ok(self.states.get(&id).map(|s| s.value().clone()))
    }
}

/// Scheduler that records jobs as resume tasks for a [`ResumeWorker`](crate::worker::ResumeWorker).
#[derive(Debug, Default)]
pub struct InMemoryScheduler {
    tasks: DashMap<Uuid, ResumeTask>,
}

impl InMemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tasks(&self) -> Vec<ResumeTask> {
        let mut tasks: Vec<_> = self.tasks.iter().map(|t| t.value().clone()).collect();
        tasks.sort_by_key(|t| (t.next_attempt_at, t.created_at));
        tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn update<F>(&self, id: Uuid, f: F) -> Result<(), SchedulerError>
    where
        F: FnOnce(&mut ResumeTask),
    {
        let mut task = self
            .tasks
            .get_mut(&id)
            .ok_or(SchedulerError::TaskNotFound(id))?;
        f(task.value_mut());
        Ok(())
    }
}

#[async_trait]
impl Scheduler for InMemoryScheduler {
    async fn schedule_job(&self, job: ScheduledJob) -> Result<JobHandle, SchedulerError> {
        let task = ResumeTask::new(job);
        let handle = task.handle();
        tracing::debug!(
            task_id = %task.id,
            context_id = %task.job.context_id,
            action_id = %task.job.action_id,
            fire_at = %task.job.fire_at,
            "Resume task queued"
        );
        self.tasks.insert(task.id, task);
        Ok(handle)
    }
}

#[async_trait]
impl ResumeTaskQueue for InMemoryScheduler {
    async fn fetch_due(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<ResumeTask>, SchedulerError> {
        let mut due: Vec<Uuid> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && t.next_attempt_at <= now)
            .map(|t| *t.key())
            .collect();
        due.sort_by_key(|id| self.tasks.get(id).map(|t| t.next_attempt_at));

        let mut claimed = Vec::new();
        for id in due {
            if claimed.len() >= limit {
                break;
            }
            if let Some(mut task) = self.tasks.get_mut(&id) {
                // Another poller may have claimed it since the scan.
                if task.status != TaskStatus::Pending {
                    continue;
                }
                task.status = TaskStatus::Running;
                task.attempts += 1;
                task.claimed_at = Some(now);
                claimed.push(task.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, id: Uuid) -> Result<(), SchedulerError> {
        self.update(id, |t| {
            t.status = TaskStatus::Completed;
            t.claimed_at = None;
            t.last_error = None;
        })
    }

    async fn retry(
        &self,
        id: Uuid,
        next_attempt_at: OffsetDateTime,
        error: &str,
    ) -> Result<(), SchedulerError> {
        self.update(id, |t| {
            t.status = TaskStatus::Pending;
            t.next_attempt_at = next_attempt_at;
            t.claimed_at = None;
            t.last_error = Some(error.to_string());
        })
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<(), SchedulerError> {
        self.update(id, |t| {
            t.status = TaskStatus::Failed;
            t.claimed_at = None;
            t.last_error = Some(error.to_string());
        })
    }

    async fn get(&self, id: Uuid) -> Result<Option<ResumeTask>, SchedulerError> {
        Ok(self.tasks.get(&id).map(|t| t.value().clone()))
    }

    async fn release_stale(&self, claimed_before: OffsetDateTime) -> Result<usize, SchedulerError> {
        let mut released = 0;
        for mut task in self.tasks.iter_mut() {
            if task.status == TaskStatus::Running
                && task.claimed_at.is_some_and(|at| at <= claimed_before)
            {
                task.status = TaskStatus::Pending;
                task.claimed_at = None;
                released += 1;
            }
        }
        Ok(released)
    }
}
