//! Shared kernel of the taskmesh orchestration engine.
//!
//! Holds the pieces both engines (saga coordinator and task scheduler) and
//! the worker registry agree on: the error taxonomy, lifecycle events, the
//! state persistence boundary, the outbound worker protocol, and engine
//! configuration.
//!
//! # Main types
//!
//! - [`MeshError`] / [`MeshResult`] — engine-wide error taxonomy.
//! - [`MeshEvent`] / [`EventBus`] — publish-only lifecycle event feed.
//! - [`StateStore`] / [`InMemoryStateStore`] — versioned key-value boundary
//!   for aggregate snapshots.
//! - [`ActionExecutor`] — the seam across which real agents, remote
//!   services, or simulators are substituted.
//! - [`EngineConfig`] — TOML-loadable retry/backoff/consensus knobs.

/// Engine configuration structs and TOML loading.
pub mod config;
/// Error taxonomy.
pub mod error;
/// Lifecycle events and the broadcast bus.
pub mod event;
/// Outbound worker protocol.
pub mod executor;
/// Typed ids for workers, runs, problems, and tasks.
pub mod id;
/// State persistence boundary.
pub mod store;

pub use config::{ConsensusConfig, EngineConfig, SagaConfig, SchedulerConfig};
pub use error::{MeshError, MeshResult};
pub use event::{EventBus, MeshEvent};
pub use executor::ActionExecutor;
pub use id::{ProblemId, RunId, TaskId, WorkerId};
pub use store::{InMemoryStateStore, StateStore, VersionedValue};
