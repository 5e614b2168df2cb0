use crate::id::{ProblemId, RunId, TaskId, WorkerId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Lifecycle event published by the saga coordinator, the task scheduler,
/// or the worker registry.
///
/// The engine only ever writes to this feed; it never depends on anyone
/// reading it. Wire names follow the `component:event` convention so
/// external dashboards can route on the tag alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum MeshEvent {
    /// A saga run entered the `running` state.
    #[serde(rename = "saga:started")]
    SagaStarted {
        /// Run that started.
        run: RunId,
        /// Name of the saga definition being executed.
        definition: String,
    },
    /// A forward step finished successfully.
    #[serde(rename = "saga:step-completed")]
    SagaStepCompleted {
        /// Owning run.
        run: RunId,
        /// Step that completed.
        step: String,
    },
    /// A forward step exhausted its retry budget.
    #[serde(rename = "saga:step-failed")]
    SagaStepFailed {
        /// Owning run.
        run: RunId,
        /// Step that failed.
        step: String,
        /// Final error.
        error: String,
    },
    /// A compensating action finished successfully.
    #[serde(rename = "saga:step-compensated")]
    SagaStepCompensated {
        /// Owning run.
        run: RunId,
        /// Step whose compensation ran.
        step: String,
    },
    /// A compensating action failed (the unwind continues regardless).
    #[serde(rename = "saga:compensation-failed")]
    SagaCompensationFailed {
        /// Owning run.
        run: RunId,
        /// Step whose compensation failed.
        step: String,
        /// Failure description.
        error: String,
    },
    /// All forward steps completed.
    #[serde(rename = "saga:completed")]
    SagaCompleted {
        /// Run that completed.
        run: RunId,
    },
    /// The unwind finished: every completed step's compensation was
    /// attempted once. Terminal, always followed by `saga:failed`.
    #[serde(rename = "saga:compensated")]
    SagaCompensated {
        /// Run whose unwind finished.
        run: RunId,
    },
    /// The run failed and its unwind finished; terminal state is
    /// `compensated`.
    #[serde(rename = "saga:failed")]
    SagaFailed {
        /// Run that failed.
        run: RunId,
        /// Step that caused the failure.
        failed_step: String,
        /// Captured error.
        error: String,
    },
    /// A problem was accepted and decomposed.
    #[serde(rename = "problem:submitted")]
    ProblemSubmitted {
        /// Problem id.
        problem: ProblemId,
        /// Registered problem type.
        problem_type: String,
        /// Number of sub-tasks produced by decomposition.
        tasks: usize,
    },
    /// A sub-task was assigned to a worker.
    #[serde(rename = "problem:task-scheduled")]
    TaskScheduled {
        /// Owning problem.
        problem: ProblemId,
        /// Scheduled sub-task.
        task: TaskId,
        /// Worker it was assigned to.
        worker: WorkerId,
    },
    /// A sub-task completed successfully.
    #[serde(rename = "problem:task-completed")]
    TaskCompleted {
        /// Owning problem.
        problem: ProblemId,
        /// Completed sub-task.
        task: TaskId,
    },
    /// A sub-task attempt failed.
    #[serde(rename = "problem:task-failed")]
    TaskFailed {
        /// Owning problem.
        problem: ProblemId,
        /// Failed sub-task.
        task: TaskId,
        /// Failure description.
        error: String,
        /// True once the retry budget is exhausted.
        terminal: bool,
    },
    /// A problem produced a validated solution.
    #[serde(rename = "problem:solved")]
    ProblemSolved {
        /// Solved problem.
        problem: ProblemId,
        /// Confidence of the produced solution.
        confidence: f64,
    },
    /// A problem failed, was cancelled, or stalled.
    #[serde(rename = "problem:failed")]
    ProblemFailed {
        /// Failed problem.
        problem: ProblemId,
        /// Single surfaced failure reason.
        reason: String,
    },
    /// A worker registered or re-registered.
    #[serde(rename = "worker:registered")]
    WorkerRegistered {
        /// Registered worker.
        worker: WorkerId,
    },
    /// A worker went offline; its assignments must be requeued.
    #[serde(rename = "worker:lost")]
    WorkerLost {
        /// Lost worker.
        worker: WorkerId,
    },
}

/// Publish-only fan-out of [`MeshEvent`]s over a broadcast channel.
///
/// Constructed per engine instance and injected into the components that
/// emit on it, so several orchestration instances can coexist in one
/// process. Publishing with no subscribers is a no-op, not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MeshEvent>,
}

impl EventBus {
    /// Create a bus that buffers up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: MeshEvent) {
        tracing::trace!(?event, "lifecycle event");
        // A send error only means nobody is listening right now.
        let _ = self.tx.send(event);
    }

    /// Subscribe to the live feed. Slow consumers may observe lag.
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
