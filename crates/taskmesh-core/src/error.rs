use thiserror::Error;

/// Convenience alias used across all taskmesh crates.
pub type MeshResult<T> = Result<T, MeshError>;

/// Engine-wide error taxonomy.
///
/// Transient conditions (`NoWorkerAvailable`) are backpressure signals that
/// callers answer with a jittered re-poll; they never consume a retry budget.
/// `ActionFailed` consumes one attempt of the failing step or task.
#[derive(Error, Debug)]
pub enum MeshError {
    /// No registered worker currently matches the required capabilities.
    #[error("no worker available for capabilities [{capabilities}]")]
    NoWorkerAvailable {
        /// Comma-joined capability tags that could not be matched.
        capabilities: String,
    },

    /// A dispatched action returned an error or exceeded its timeout.
    #[error("action '{action}' failed: {reason}")]
    ActionFailed {
        /// Action identifier that was dispatched.
        action: String,
        /// Worker-reported error or timeout description.
        reason: String,
    },

    /// A compensating action failed. Logged, never retried, and never
    /// blocks the remaining compensations of the same run.
    #[error("compensation for step '{step}' failed: {reason}")]
    CompensationFailed {
        /// Name of the saga step whose compensation failed.
        step: String,
        /// Failure description.
        reason: String,
    },

    /// A sub-task can never be scheduled because a dependency failed
    /// permanently or its capability vanished from the worker pool.
    #[error("task '{task}' cannot be scheduled: {reason}")]
    DependencyUnsatisfiable {
        /// Name of the blocked sub-task.
        task: String,
        /// Why the dependency set can never be satisfied.
        reason: String,
    },

    /// Candidate results did not agree closely enough.
    #[error("consensus not reached (agreement {score:.2})")]
    ConsensusNotReached {
        /// Observed agreement ratio.
        score: f64,
    },

    /// A live worker re-registered under the same id with a different
    /// capability set.
    #[error("worker '{0}' already registered with different capabilities")]
    DuplicateIdentity(String),

    /// Referenced aggregate (run, problem, task, worker) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The decomposed task graph contains a dependency cycle.
    #[error("dependency cycle detected in task graph")]
    Cycle,

    /// A saga definition or decomposition output is malformed.
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    /// State store failure.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration parse or validation failure.
    #[error("config error: {0}")]
    Config(String),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeshError {
    /// Whether the error is a transient backpressure signal rather than a
    /// task-level failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, MeshError::NoWorkerAvailable { .. })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let err = MeshError::NoWorkerAvailable {
            capabilities: "optimize".into(),
        };
        assert!(err.is_transient());

        let err = MeshError::ActionFailed {
            action: "charge".into(),
            reason: "card declined".into(),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn test_display_includes_context() {
        let err = MeshError::CompensationFailed {
            step: "reserve".into(),
            reason: "connection reset".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("reserve"));
        assert!(msg.contains("connection reset"));
    }

    #[test]
    fn test_taxonomy_messages() {
        let err = MeshError::DependencyUnsatisfiable {
            task: "aggregate".into(),
            reason: "dependency 'solve-1' failed permanently".into(),
        };
        assert!(err.to_string().contains("aggregate"));

        let err = MeshError::ConsensusNotReached { score: 0.5 };
        assert_eq!(err.to_string(), "consensus not reached (agreement 0.50)");
    }

    #[test]
    fn test_serde_error_converts() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("not json");
        let err: MeshError = parse.unwrap_err().into();
        assert!(matches!(err, MeshError::Serialization(_)));
    }
}
