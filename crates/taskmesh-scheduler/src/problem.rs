use crate::consensus::Solution;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskmesh_core::ProblemId;

/// Coarse size hint used by decomposition strategies (e.g. how many
/// redundant solvers to fan out).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    /// Small problem.
    Low,
    /// Typical problem.
    Medium,
    /// Large problem.
    High,
}

/// A computational problem submitted for decomposition and distributed
/// solving. Immutable after submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    /// Problem identity.
    pub id: ProblemId,
    /// Type tag used to look up the decomposition strategy and consensus
    /// policy.
    pub problem_type: String,
    /// Opaque payload handed to every dispatched sub-task.
    pub payload: Value,
    /// Size hint.
    pub complexity: Complexity,
    /// Caller priority (higher = more urgent); metadata only.
    pub priority: u8,
    /// Optional completion deadline; metadata only.
    pub deadline: Option<DateTime<Utc>>,
    /// Optional accuracy target for the validator; metadata only.
    pub accuracy_target: Option<f64>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
}

impl Problem {
    /// Create a problem with default priority and no deadline.
    pub fn new(problem_type: impl Into<String>, payload: Value, complexity: Complexity) -> Self {
        Self {
            id: ProblemId::new(),
            problem_type: problem_type.into(),
            payload,
            complexity,
            priority: 0,
            deadline: None,
            accuracy_target: None,
            created_at: Utc::now(),
        }
    }

    /// Set the caller priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Set a completion deadline.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set an accuracy target.
    pub fn with_accuracy_target(mut self, target: f64) -> Self {
        self.accuracy_target = Some(target);
        self
    }
}

/// Lifecycle of a submitted problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemPhase {
    /// Sub-tasks are being scheduled and executed.
    Running,
    /// All sub-tasks finished; candidate results are being reconciled.
    Validating,
    /// A validated solution exists.
    Solved,
    /// A sub-task failed permanently, the problem stalled, or no strategy
    /// round could rescue agreement.
    Failed,
    /// The caller cancelled the problem.
    Cancelled,
}

impl ProblemPhase {
    /// Whether no further transitions can occur.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProblemPhase::Solved | ProblemPhase::Failed | ProblemPhase::Cancelled
        )
    }
}

/// Point-in-time view of a problem, returned by `get_status`. Well-formed
/// at every lifecycle point, including mid-failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemStatus {
    /// Problem identity.
    pub problem: ProblemId,
    /// Current phase.
    pub phase: ProblemPhase,
    /// Fraction of sub-tasks completed.
    pub percent_complete: f64,
    /// Total sub-tasks (including extra solver rounds).
    pub total_tasks: usize,
    /// Completed sub-tasks.
    pub completed_tasks: usize,
    /// The solution, once solved.
    pub solution: Option<Solution>,
    /// Single surfaced failure reason, once failed.
    pub failure: Option<String>,
    /// Submission time.
    pub started_at: DateTime<Utc>,
    /// Last progress time.
    pub updated_at: DateTime<Utc>,
}
