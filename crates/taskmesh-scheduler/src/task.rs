use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use taskmesh_core::{ProblemId, TaskId, WorkerId};

/// State machine of one sub-task.
///
/// `pending → assigned → running → (completed | failed)`; a failed attempt
/// below the retry ceiling loops back to `pending`, and worker loss resets
/// `assigned`/`running` tasks to `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for its dependencies and a matching worker.
    Pending,
    /// Matched to a worker; dispatch is starting.
    Assigned,
    /// The worker is executing the action.
    Running,
    /// Finished successfully; the result is read-only from here on.
    Completed,
    /// Retry budget exhausted; fails the owning problem.
    Failed,
}

/// One unit of decomposed work belonging to a [`Problem`](crate::Problem).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    /// Task identity.
    pub id: TaskId,
    /// Owning problem.
    pub problem_id: ProblemId,
    /// Human-readable name, unique within the problem.
    pub name: String,
    /// Action identifier dispatched to the worker.
    pub action: String,
    /// Worker capability required to run this task.
    pub capability: String,
    /// Tasks that must complete before this one may be scheduled.
    pub dependencies: BTreeSet<TaskId>,
    /// Load units reserved on the assigned worker.
    pub estimated_cost: u32,
    /// Current assignee, while `assigned`/`running`.
    pub assigned_to: Option<WorkerId>,
    /// Worker that produced the accepted result.
    pub completed_by: Option<WorkerId>,
    /// Current state-machine position.
    pub state: TaskState,
    /// Result payload, once completed.
    pub result: Option<Value>,
    /// Number of dispatch attempts so far.
    pub attempts: u32,
    /// Dispatch epoch; results carrying a stale epoch are discarded, which
    /// covers cancellation, reassignment, and late timeouts uniformly.
    #[serde(default)]
    pub epoch: u64,
    /// Whether this task's result is a redundant candidate for consensus.
    #[serde(default)]
    pub candidate: bool,
    /// Solver round that produced this task (0 = original decomposition).
    #[serde(default)]
    pub round: u32,
}

impl SubTask {
    /// Create a pending task with cost 1 and the action named after the
    /// task.
    pub fn new(
        problem_id: ProblemId,
        name: impl Into<String>,
        capability: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            id: TaskId::new(),
            problem_id,
            action: name.clone(),
            name,
            capability: capability.into(),
            dependencies: BTreeSet::new(),
            estimated_cost: 1,
            assigned_to: None,
            completed_by: None,
            state: TaskState::Pending,
            result: None,
            attempts: 0,
            epoch: 0,
            candidate: false,
            round: 0,
        }
    }

    /// Dispatch a different action identifier than the task name.
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    /// Declare dependencies.
    pub fn depends_on(mut self, ids: impl IntoIterator<Item = TaskId>) -> Self {
        self.dependencies.extend(ids);
        self
    }

    /// Set the estimated cost reserved against the worker.
    pub fn with_cost(mut self, cost: u32) -> Self {
        self.estimated_cost = cost.max(1);
        self
    }

    /// Mark this task's result as a redundant consensus candidate.
    pub fn as_candidate(mut self) -> Self {
        self.candidate = true;
        self
    }

    /// Whether the task may be offered to a worker: pending, with every
    /// dependency completed.
    pub fn is_ready(&self, completed: &BTreeSet<TaskId>) -> bool {
        self.state == TaskState::Pending && self.dependencies.iter().all(|d| completed.contains(d))
    }

    /// Whether the task reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, TaskState::Completed | TaskState::Failed)
    }

    /// A fresh copy for an additional solver round: new id, reset
    /// attempts/result, same dependencies and dispatch parameters.
    pub fn replicate(&self, round: u32) -> Self {
        Self {
            id: TaskId::new(),
            problem_id: self.problem_id,
            name: format!("{}-r{round}", self.name),
            action: self.action.clone(),
            capability: self.capability.clone(),
            dependencies: self.dependencies.clone(),
            estimated_cost: self.estimated_cost,
            assigned_to: None,
            completed_by: None,
            state: TaskState::Pending,
            result: None,
            attempts: 0,
            epoch: 0,
            candidate: self.candidate,
            round,
        }
    }
}
