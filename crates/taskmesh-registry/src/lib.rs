//! Worker registry: capability-tagged worker agents, match-making, load and
//! health tracking.
//!
//! # Main types
//!
//! - [`WorkerRegistry`] — register/match/outcome operations over the worker
//!   pool; publishes `worker:lost` when agents go offline.
//! - [`WorkerAgent`] — one worker's identity, capabilities, load, and
//!   rolling success rate.

/// Worker agent record and helpers.
pub mod agent;
/// The registry service.
pub mod registry;

pub use agent::{WorkerAgent, WorkerStatus};
pub use registry::WorkerRegistry;
