//! Saga coordinator: ordered multi-step operations across workers with
//! per-step retry, exponential backoff, and compensating rollback.
//!
//! A saga trades a global transaction lock for per-step compensations: when
//! a step exhausts its retry budget, every previously completed step's
//! compensating action is invoked once, in strict reverse order, and the run
//! ends `compensated`. Rollback is best-effort by design — the unwind never
//! halts early and compensations are never retried.
//!
//! # Main types
//!
//! - [`SagaCoordinator`] — submits and drives runs against the worker pool.
//! - [`SagaDefinition`] / [`SagaStep`] — an ordered list of compensable steps.
//! - [`SagaRun`] / [`RunState`] — per-run state machine and accumulator.
//! - [`SagaHooks`] — terminal callbacks, fired exactly once per run.

/// The coordinator service.
pub mod coordinator;
/// Saga definitions and steps.
pub mod definition;
/// Run state machine and status snapshots.
pub mod run;

pub use coordinator::{NoopHooks, SagaCoordinator, SagaHooks};
pub use definition::{InputSelector, SagaDefinition, SagaStep};
pub use run::{RunState, SagaRun, SagaStatus};
