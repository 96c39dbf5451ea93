//! Resume worker: drains due resume tasks into [`KarEngine::resume`].

use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::engine::{KarEngine, ResumeOutcome};
use crate::error::{KarError, KarResult};
use crate::scheduler::{ResumeTask, ResumeTaskQueue};

/// Counts from one polling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessStats {
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    /// Stale claims handed back to the queue before fetching.
    pub released: usize,
    /// Tasks whose queue update failed; they stay claimed until released.
    pub stranded: usize,
}

impl ProcessStats {
    pub fn total(&self) -> usize {
        self.completed + self.retried + self.failed + self.released + self.stranded
    }
}

pub struct ResumeWorker {
    engine: Arc<KarEngine>,
    queue: Arc<dyn ResumeTaskQueue>,
    config: WorkerConfig,
}

impl ResumeWorker {
    pub fn new(engine: Arc<KarEngine>, queue: Arc<dyn ResumeTaskQueue>, config: WorkerConfig) -> Self {
        Self {
            engine,
            queue,
            config,
        }
    }

    /// Start polling in a background task.
    ///
    /// Returns a shutdown sender; send `true` to stop the worker.
    pub fn start(self) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            info!(
                poll_interval_ms = self.config.poll_interval_ms,
                batch_size = self.config.batch_size,
                "Resume worker started"
            );

            let mut ticker = interval(self.config.poll_interval());

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.process_due().await {
                            Ok(stats) if stats.total() > 0 => {
                                info!(
                                    completed = stats.completed,
                                    retried = stats.retried,
                                    failed = stats.failed,
                                    released = stats.released,
                                    stranded = stats.stranded,
                                    "Processed resume tasks"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "Error polling resume tasks"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("Resume worker shutting down");
                            break;
                        }
                    }
                }
            }
        });

        shutdown_tx
    }

    /// Release stale claims, then claim and run every task due now.
    ///
    /// A queue error on one task is logged and leaves that task claimed; the
    /// rest of the batch still runs.
    pub async fn process_due(&self) -> KarResult<ProcessStats> {
        let now = OffsetDateTime::now_utc();
        let mut stats = ProcessStats::default();

        let stale_before = now
            .checked_sub(self.config.claim_timeout())
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        match self.queue.release_stale(stale_before).await {
            Ok(0) => {}
            Ok(released) => {
                warn!(released, "Released stale resume task claims");
                stats.released = released;
            }
            Err(e) => error!(error = %e, "Failed to release stale resume task claims"),
        }

        let tasks = self.queue.fetch_due(now, self.config.batch_size).await?;

        for task in tasks {
            let settled: KarResult<()> =
                match self.engine.resume(task.job.context_id, &task.job.action_id).await {
                    Ok(outcome) => {
                        self.log_outcome(&task, &outcome);
                        match self.queue.complete(task.id).await {
                            Ok(()) => {
                                stats.completed += 1;
                                Ok(())
                            }
                            Err(e) => Err(e.into()),
                        }
                    }
                    Err(e) => match self.handle_failure(&task, &e).await {
                        Ok(true) => {
                            stats.retried += 1;
                            Ok(())
                        }
                        Ok(false) => {
                            stats.failed += 1;
                            Ok(())
                        }
                        Err(e) => Err(e),
                    },
                };

            if let Err(e) = settled {
                error!(
                    task_id = %task.id,
                    context_id = %task.job.context_id,
                    action_id = %task.job.action_id,
                    error = %e,
                    "Failed to update resume task, it stays claimed until its claim expires"
                );
                stats.stranded += 1;
            }
        }

        Ok(stats)
    }

    /// Retry with backoff or give up. Returns whether the task was retried.
    async fn handle_failure(&self, task: &ResumeTask, e: &KarError) -> KarResult<bool> {
        let error_msg = e.to_string();
        warn!(
            task_id = %task.id,
            context_id = %task.job.context_id,
            action_id = %task.job.action_id,
            attempts = task.attempts,
            error = %error_msg,
            "Resume failed"
        );

        let permanent = matches!(e, KarError::ContextNotFound(_));
        if permanent || task.attempts >= self.config.max_retries {
            self.queue.fail(task.id, &error_msg).await?;
            error!(
                task_id = %task.id,
                context_id = %task.job.context_id,
                action_id = %task.job.action_id,
                attempts = task.attempts,
                "Resume task permanently failed"
            );
            return Ok(false);
        }

        let now = OffsetDateTime::now_utc();
        let next_attempt = now
            .checked_add(self.config.backoff(task.attempts))
            .unwrap_or(now);
        self.queue.retry(task.id, next_attempt, &error_msg).await?;
        Ok(true)
    }

    fn log_outcome(&self, task: &ResumeTask, outcome: &ResumeOutcome) {
        match outcome {
            ResumeOutcome::Executed(report) => info!(
                task_id = %task.id,
                context_id = %task.job.context_id,
                action_id = %task.job.action_id,
                scheduled = report.scheduled.len(),
                "Resume task executed"
            ),
            other => debug!(
                task_id = %task.id,
                context_id = %task.job.context_id,
                action_id = %task.job.action_id,
                outcome = ?other,
                "Resume task was a no-op"
            ),
        }
    }
}
