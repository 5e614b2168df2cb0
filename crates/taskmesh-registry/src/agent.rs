use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use taskmesh_core::WorkerId;

/// Smoothing factor of the rolling success-rate average.
const SUCCESS_RATE_SMOOTHING: f64 = 0.05;

/// Availability of a worker agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Registered and accepting work.
    Idle,
    /// At load capacity.
    Busy,
    /// Unreachable; assignments must be requeued elsewhere.
    Offline,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Busy => write!(f, "busy"),
            WorkerStatus::Offline => write!(f, "offline"),
        }
    }
}

/// A registered worker agent: identity, declared capabilities, load, and a
/// rolling success rate.
///
/// Owned exclusively by the [`WorkerRegistry`](crate::WorkerRegistry);
/// the saga coordinator and task scheduler read snapshots and mutate only
/// through registry operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerAgent {
    /// Worker identity.
    pub id: WorkerId,
    /// Capability tags this worker can serve.
    pub capabilities: BTreeSet<String>,
    /// Current availability.
    pub status: WorkerStatus,
    /// Load currently reserved against this worker.
    pub current_load: u32,
    /// Maximum load the worker accepts.
    pub max_load: u32,
    /// Exponential moving average of attempt outcomes, in `[0, 1]`.
    pub success_rate: f64,
    /// Last time the worker reported in.
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerAgent {
    /// Create an idle worker with a fresh id, zero load, and a success rate
    /// of 1.0.
    pub fn new<I, S>(capabilities: I, max_load: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: WorkerId::new(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            status: WorkerStatus::Idle,
            current_load: 0,
            max_load: max_load.max(1),
            success_rate: 1.0,
            last_heartbeat: Utc::now(),
        }
    }

    /// Use a caller-provided id (re-registration after restart).
    pub fn with_id(mut self, id: WorkerId) -> Self {
        self.id = id;
        self
    }

    /// Whether this worker's capability set covers every required tag.
    pub fn covers(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }

    /// Fraction of capacity currently in use.
    pub fn load_ratio(&self) -> f64 {
        f64::from(self.current_load) / f64::from(self.max_load)
    }

    /// Whether the worker can take on more load.
    pub fn has_capacity(&self) -> bool {
        self.current_load < self.max_load
    }

    /// Whether the worker qualifies for new assignments at all.
    pub fn is_available(&self) -> bool {
        self.status != WorkerStatus::Offline && self.has_capacity()
    }

    /// Fold one attempt outcome into the rolling success rate.
    pub(crate) fn record(&mut self, success: bool) {
        let sample = if success { 1.0 } else { 0.0 };
        self.success_rate =
            (1.0 - SUCCESS_RATE_SMOOTHING) * self.success_rate + SUCCESS_RATE_SMOOTHING * sample;
    }

    /// Recompute Idle/Busy from the current load. Offline is sticky until
    /// an explicit status change.
    pub(crate) fn refresh_status(&mut self) {
        if self.status == WorkerStatus::Offline {
            return;
        }
        self.status = if self.has_capacity() {
            WorkerStatus::Idle
        } else {
            WorkerStatus::Busy
        };
    }
}
