//! Engine and resume-worker configuration

use std::time::Duration;

use bsa_core::FhirDuration;
use serde::{Deserialize, Serialize};

/// Configuration for action-tree traversal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Run timed and offset actions immediately instead of scheduling them
    #[serde(default)]
    pub ignore_timers: bool,

    /// Re-read and re-apply attempts when a state save hits a version conflict
    #[serde(default = "default_max_state_write_retries")]
    pub max_state_write_retries: u32,

    /// Deferral used for a timing schedule whose offset is zero
    #[serde(default = "default_timing_offset")]
    pub default_timing_offset: FhirDuration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ignore_timers: false,
            max_state_write_retries: default_max_state_write_retries(),
            default_timing_offset: default_timing_offset(),
        }
    }
}

fn default_max_state_write_retries() -> u32 {
    3
}

fn default_timing_offset() -> FhirDuration {
    FhirDuration::new(time::Duration::hours(1))
}

/// Configuration for the resume worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Poll interval for due resume tasks (ms)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Maximum tasks claimed per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Attempts before a task is marked failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential retry backoff (seconds)
    #[serde(default = "default_retry_base")]
    pub retry_base_secs: u64,

    /// Running tasks claimed longer ago than this are handed out again (seconds)
    #[serde(default = "default_claim_timeout")]
    pub claim_timeout_secs: u64,
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Delay before the next attempt after `attempts` failures: base * 2^(attempts-1).
    pub fn backoff(&self, attempts: u32) -> time::Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        let secs = self.retry_base_secs.saturating_mul(1u64 << exponent);
        time::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
    }

    pub fn claim_timeout(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.claim_timeout_secs).unwrap_or(i64::MAX))
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_base_secs: default_retry_base(),
            claim_timeout_secs: default_claim_timeout(),
        }
    }
}

fn default_poll_interval() -> u64 {
    1_000
}

fn default_batch_size() -> usize {
    50
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_base() -> u64 {
    30
}

fn default_claim_timeout() -> u64 {
    300
}
