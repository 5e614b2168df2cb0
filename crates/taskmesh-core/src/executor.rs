use crate::error::MeshResult;
use crate::id::WorkerId;
use async_trait::async_trait;
use serde_json::Value;

/// The single seam across which the engine calls out to real worker agents,
/// remote services, or test simulators.
///
/// Implementations receive the worker chosen by the registry, the action
/// identifier from the step or sub-task, and a JSON input derived from prior
/// outputs. Timeouts are enforced by the caller (`tokio::time::timeout`), so
/// an implementation that hangs is indistinguishable from one that fails.
///
/// The engine dispatches at-least-once: a timed-out invocation may still be
/// running remotely when the retry starts, so forward actions and
/// compensations should be idempotent.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Execute `action` on `worker` with `input`, returning its output.
    async fn execute(&self, worker: WorkerId, action: &str, input: Value) -> MeshResult<Value>;
}
