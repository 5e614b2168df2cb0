use crate::error::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Retry, backoff, and timeout knobs for the saga coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SagaConfig {
    /// Attempt budget for retryable steps. Non-retryable steps always get 1.
    pub max_attempts: u32,
    /// Base of the exponential backoff between step retries.
    pub backoff_base_ms: u64,
    /// Ceiling applied to the computed backoff.
    pub backoff_cap_ms: u64,
    /// Step timeout used when a step does not declare its own.
    pub step_timeout_ms: u64,
    /// Delay before re-polling the registry when no worker matched.
    pub no_worker_retry_ms: u64,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
            step_timeout_ms: 30_000,
            no_worker_retry_ms: 500,
        }
    }
}

impl SagaConfig {
    /// Backoff before retry number `attempt + 1`, i.e. after the
    /// `attempt`-th failed attempt (1-based): `base * 2^(attempt-1)`,
    /// capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self.backoff_base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.backoff_cap_ms))
    }

    /// Default step timeout as a [`Duration`].
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    /// Registry re-poll delay as a [`Duration`] (jitter is added by the
    /// caller).
    pub fn no_worker_retry(&self) -> Duration {
        Duration::from_millis(self.no_worker_retry_ms)
    }
}

/// Scheduling-loop knobs for the task scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Attempt budget per sub-task before it fails permanently.
    pub max_attempts: u32,
    /// Scheduling-loop tick.
    pub tick_ms: u64,
    /// Upper bound of the jitter added when re-polling after a failed match.
    pub assign_jitter_max_ms: u64,
    /// A problem with no task progress inside this window is surfaced as a
    /// health-check failure instead of hanging silently.
    pub stall_window_ms: u64,
    /// Timeout applied to every dispatched sub-task.
    pub task_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            tick_ms: 100,
            assign_jitter_max_ms: 250,
            stall_window_ms: 60_000,
            task_timeout_ms: 30_000,
        }
    }
}

impl SchedulerConfig {
    /// Loop tick as a [`Duration`].
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Task timeout as a [`Duration`].
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    /// Stall window as a [`Duration`].
    pub fn stall_window(&self) -> Duration {
        Duration::from_millis(self.stall_window_ms)
    }
}

/// Agreement threshold and extra-round budget for the validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Agreement ratio at or above which consensus is achieved.
    pub threshold: f64,
    /// How many additional solver rounds may be spawned when agreement is
    /// below the threshold, before a low-confidence solution ships anyway.
    pub max_extra_rounds: u32,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            threshold: 0.8,
            max_extra_rounds: 1,
        }
    }
}

/// Top-level engine configuration, loadable from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Saga coordinator section.
    pub saga: SagaConfig,
    /// Task scheduler section.
    pub scheduler: SchedulerConfig,
    /// Consensus/validator section.
    pub consensus: ConsensusConfig,
}

impl EngineConfig {
    /// Parse a TOML document. Missing sections and fields fall back to
    /// defaults.
    pub fn from_toml_str(raw: &str) -> MeshResult<Self> {
        toml::from_str(raw).map_err(|e| MeshError::Config(e.to_string()))
    }

    /// Load and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> MeshResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }
}
