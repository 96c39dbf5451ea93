use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::action::{ActionId, ActionType};
use crate::error::SchedulerError;

/// Request to resume one deferred action at or after `fire_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJob {
    pub context_id: Uuid,
    pub action_id: ActionId,
    pub action_type: ActionType,
    #[serde(with = "time::serde::rfc3339")]
    pub fire_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub id: Uuid,
    pub context_id: Uuid,
    pub action_id: ActionId,
    #[serde(with = "time::serde::rfc3339")]
    pub fire_at: OffsetDateTime,
}

/// Accepts deferred actions.
///
/// Implementations guarantee at least one future call of
/// [`KarEngine::resume`](crate::engine::KarEngine::resume) at or after the
/// job's fire time; the engine tolerates duplicates.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn schedule_job(&self, job: ScheduledJob) -> Result<JobHandle, SchedulerError>;
}

/// Resume task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A persisted scheduler job, consumed by the resume worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeTask {
    pub id: Uuid,
    pub job: ScheduledJob,
    pub status: TaskStatus,
    pub attempts: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub next_attempt_at: OffsetDateTime,
    /// When the current claim was taken; set while the task is running.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub claimed_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl ResumeTask {
    pub fn new(job: ScheduledJob) -> Self {
        Self {
            id: Uuid::new_v4(),
            next_attempt_at: job.fire_at,
            job,
            status: TaskStatus::Pending,
            attempts: 0,
            claimed_at: None,
            last_error: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            id: self.id,
            context_id: self.job.context_id,
            action_id: self.job.action_id.clone(),
            fire_at: self.job.fire_at,
        }
    }
}

/// Durable queue of resume tasks.
#[async_trait]
pub trait ResumeTaskQueue: Send + Sync {
    /// Claim up to `limit` pending tasks due at `now`, marking them running.
    async fn fetch_due(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<ResumeTask>, SchedulerError>;

    /// Mark a task as done
    async fn complete(&self, id: Uuid) -> Result<(), SchedulerError>;

    /// Put a task back to pending with a later attempt time
    async fn retry(
        &self,
        id: Uuid,
        next_attempt_at: OffsetDateTime,
        error: &str,
    ) -> Result<(), SchedulerError>;

    /// Mark a task as permanently failed
    async fn fail(&self, id: Uuid, error: &str) -> Result<(), SchedulerError>;

    async fn get(&self, id: Uuid) -> Result<Option<ResumeTask>, SchedulerError>;

    /// Return running tasks claimed at or before `claimed_before` to pending.
    ///
    /// Recovers tasks whose worker died or lost track of them mid-batch.
    async fn release_stale(&self, claimed_before: OffsetDateTime) -> Result<usize, SchedulerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_due_at_fire_time() {
        let fire_at = OffsetDateTime::now_utc() + time::Duration::days(1);
        let task = ResumeTask::new(ScheduledJob {
            context_id: Uuid::new_v4(),
            action_id: ActionId::new("t"),
            action_type: ActionType::SubmitReport,
            fire_at,
        });
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.next_attempt_at, fire_at);
        assert!(task.claimed_at.is_none());
        assert_eq!(task.handle().fire_at, fire_at);
        assert_eq!(task.handle().id, task.id);
    }
}
