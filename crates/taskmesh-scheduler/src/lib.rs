//! Task scheduler and consensus validator: decomposes problems into
//! dependency graphs of sub-tasks, distributes them across capability-tagged
//! workers, and reconciles redundant candidate results into one validated
//! solution.
//!
//! Decomposition is a registered strategy per problem type; the scheduler
//! itself never interprets problem semantics. Sub-tasks are offered to the
//! worker registry only once every dependency has completed, dispatched
//! fire-and-forget, and retried or reassigned on failure and worker loss.
//!
//! # Main types
//!
//! - [`TaskScheduler`] — per-problem scheduling loops over the worker pool.
//! - [`Problem`] / [`SubTask`] — the decomposition data model.
//! - [`DecompositionStrategy`] / [`StrategyMap`] — problem-type-keyed
//!   decomposition.
//! - [`Validator`] / [`ConsensusPolicy`] — pluggable agreement scoring and
//!   solution assembly.

/// Consensus policies, the validator, and solution types.
pub mod consensus;
/// Decomposition strategies and graph validation.
pub mod decompose;
/// Problems, phases, and status snapshots.
pub mod problem;
/// The scheduler service.
pub mod scheduler;
/// Sub-tasks and their state machine.
pub mod task;

pub use consensus::{
    ConsensusOutcome, ConsensusPolicy, ConsensusRecord, MajorityVote, NumericTolerance,
    PerformanceReport, Solution, Validator, Verdict, WorkerVote,
};
pub use decompose::{validate_graph, DecompositionStrategy, FanOutStrategy, StrategyMap};
pub use problem::{Complexity, Problem, ProblemPhase, ProblemStatus};
pub use scheduler::TaskScheduler;
pub use task::{SubTask, TaskState};
