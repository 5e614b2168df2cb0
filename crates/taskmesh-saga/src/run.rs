use crate::definition::SagaDefinition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use taskmesh_core::RunId;

/// State machine of one saga run.
///
/// `running → (completed | compensating → compensated)`; the step index
/// inside `Running` is the implicit "executing step N" sub-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    /// Executing the forward step at `step`.
    Running {
        /// Index of the next step to execute.
        step: usize,
    },
    /// A step failed permanently; unwinding completed steps in reverse.
    Compensating,
    /// All forward steps succeeded.
    Completed,
    /// The unwind finished (every compensation attempted once).
    Compensated,
}

impl RunState {
    /// Whether no further transitions can occur.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Compensated)
    }
}

/// One execution of a [`SagaDefinition`].
///
/// Mutated step-by-step by the coordinator under its lock; external callers
/// only ever see [`SagaStatus`] snapshots.
#[derive(Debug, Clone)]
pub struct SagaRun {
    /// Run identity.
    pub id: RunId,
    /// The definition being executed.
    pub definition: Arc<SagaDefinition>,
    /// Current state-machine position.
    pub state: RunState,
    /// Accumulated data: initial input under `"initial"`, each completed
    /// step's output under its step name.
    pub data: Value,
    /// Names of completed steps, in completion order.
    pub completed_steps: Vec<String>,
    /// Step that caused the failure, once failing.
    pub failed_step: Option<String>,
    /// Captured error, once failing.
    pub error: Option<String>,
    /// Cancellation mark, observed by the drive loop at step boundaries.
    pub cancelled: bool,
    /// Submission time.
    pub started_at: DateTime<Utc>,
    /// Last transition time, used for stall detection.
    pub updated_at: DateTime<Utc>,
}

impl SagaRun {
    /// Create a run in `Running { step: 0 }` with the initial data stored
    /// under `"initial"`.
    pub fn new(definition: Arc<SagaDefinition>, initial: Value) -> Self {
        let mut data = serde_json::Map::new();
        data.insert("initial".to_string(), initial);
        let now = Utc::now();
        Self {
            id: RunId::new(),
            definition,
            state: RunState::Running { step: 0 },
            data: Value::Object(data),
            completed_steps: Vec::new(),
            failed_step: None,
            error: None,
            cancelled: false,
            started_at: now,
            updated_at: now,
        }
    }

    /// Merge a completed step's output into the accumulator and advance the
    /// step index.
    pub fn record_step_output(&mut self, step: &str, output: Value) {
        if let Value::Object(map) = &mut self.data {
            map.insert(step.to_string(), output);
        }
        self.completed_steps.push(step.to_string());
        if let RunState::Running { step: i } = self.state {
            self.state = RunState::Running { step: i + 1 };
        }
        self.touch();
    }

    /// Record the failing step and enter `Compensating`.
    pub fn begin_compensation(&mut self, failed_step: &str, error: &str) {
        self.failed_step = Some(failed_step.to_string());
        self.error = Some(error.to_string());
        self.state = RunState::Compensating;
        self.touch();
    }

    /// All forward steps done: `Running → Completed`.
    pub fn finish(&mut self) {
        if matches!(self.state, RunState::Running { .. }) {
            self.state = RunState::Completed;
        }
        self.touch();
    }

    /// Unwind finished: `Compensating → Compensated`.
    pub fn finish_compensated(&mut self) {
        if self.state == RunState::Compensating {
            self.state = RunState::Compensated;
        }
        self.touch();
    }

    /// Fraction of forward steps completed.
    pub fn percent_complete(&self) -> f64 {
        let total = self.definition.steps.len();
        if total == 0 {
            return 1.0;
        }
        self.completed_steps.len() as f64 / total as f64
    }

    /// Whether the run reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Well-formed snapshot for polling callers, valid at any point of the
    /// lifecycle including mid-compensation.
    pub fn status(&self) -> SagaStatus {
        SagaStatus {
            run: self.id,
            definition: self.definition.name.clone(),
            state: self.state,
            percent_complete: self.percent_complete(),
            completed_steps: self.completed_steps.clone(),
            failed_step: self.failed_step.clone(),
            error: self.error.clone(),
            started_at: self.started_at,
            updated_at: self.updated_at,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Point-in-time view of a run, returned by `get_status` and handed to
/// terminal hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaStatus {
    /// Run identity.
    pub run: RunId,
    /// Definition name.
    pub definition: String,
    /// Current state.
    pub state: RunState,
    /// Fraction of forward steps completed.
    pub percent_complete: f64,
    /// Completed step names in order.
    pub completed_steps: Vec<String>,
    /// Failing step, if any.
    pub failed_step: Option<String>,
    /// Captured error, if any.
    pub error: Option<String>,
    /// Submission time.
    pub started_at: DateTime<Utc>,
    /// Last transition time.
    pub updated_at: DateTime<Utc>,
}
