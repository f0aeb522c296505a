use crate::core::{MigrateError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for retry behavior on transient failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts per step, including the first one.
    pub max_attempts: u32,
    /// Initial backoff duration in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff duration in milliseconds.
    pub max_backoff_ms: u64,
    /// Scale each delay by a random factor in `0.5..1.5`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 23,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 32_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy with a fixed number of attempts and short, jitter-free delays.
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 10,
            jitter: false,
        }
    }

    /// Delay before the attempt following `attempt` (1-based), before jitter.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let base = self.initial_backoff_ms.max(1);
        let max = self.max_backoff_ms.max(base);
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        base.saturating_mul(factor).min(max)
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let ms = self.backoff_ms(attempt);
        if !self.jitter {
            return Duration::from_millis(ms);
        }
        let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(ms as f64 / 1_000.0 * jitter)
    }
}

/// Limits on how many units are migrated at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyPolicy {
    pub max_inflight_units: usize,
}

impl Default for ConcurrencyPolicy {
    fn default() -> Self {
        Self {
            max_inflight_units: 4,
        }
    }
}

/// How hard the checkpoint store works to make a write durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointDurability {
    /// Records are fsynced before the atomic rename.
    #[default]
    Strict,
    /// Records are renamed into place without an explicit fsync.
    Relaxed,
}

fn default_step_timeout_ms() -> Option<u64> {
    Some(10 * 60_000)
}

fn default_true() -> bool {
    true
}

/// Operational policy for a migration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationPolicy {
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub concurrency: ConcurrencyPolicy,
    #[serde(default)]
    pub durability: CheckpointDurability,
    /// Upper bound on a single attempt of a step action. `None` disables it.
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: Option<u64>,
    /// Archive a unit's checkpoint once it completes the plan's final stage.
    #[serde(default = "default_true")]
    pub archive_on_completion: bool,
}

impl Default for MigrationPolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            concurrency: ConcurrencyPolicy::default(),
            durability: CheckpointDurability::default(),
            step_timeout_ms: default_step_timeout_ms(),
            archive_on_completion: true,
        }
    }
}

impl MigrationPolicy {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let policy: Self = serde_json::from_str(json)
            .map_err(|err| MigrateError::Configuration(format!("parse migration policy: {}", err)))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|err| {
            MigrateError::Configuration(format!(
                "Failed to read policy file '{}': {}",
                path.display(),
                err
            ))
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(MigrateError::Configuration(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.concurrency.max_inflight_units == 0 {
            return Err(MigrateError::Configuration(
                "concurrency.max_inflight_units must be at least 1".to_string(),
            ));
        }
        if self.step_timeout_ms == Some(0) {
            return Err(MigrateError::Configuration(
                "step_timeout_ms must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_ms.map(Duration::from_millis)
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn max_inflight_units(mut self, max: usize) -> Self {
        self.concurrency.max_inflight_units = max;
        self
    }

    pub fn step_timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        self.step_timeout_ms = timeout_ms;
        self
    }

    pub fn archive_on_completion(mut self, archive: bool) -> Self {
        self.archive_on_completion = archive;
        self
    }
}
