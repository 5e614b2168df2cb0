use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Caller-supplied pure function deriving a step's input from the run's
/// accumulated data.
#[derive(Clone)]
pub struct InputSelector(Arc<dyn Fn(&Value) -> Value + Send + Sync>);

impl InputSelector {
    /// Wrap a selection function.
    pub fn new(f: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Apply the selector to the accumulated run data.
    pub fn select(&self, data: &Value) -> Value {
        (self.0)(data)
    }
}

impl std::fmt::Debug for InputSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("InputSelector(..)")
    }
}

/// One step of a saga: a forward action paired with the compensating action
/// that semantically undoes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaStep {
    /// Unique (within the definition) step name.
    pub name: String,
    /// Worker capability required to run this step.
    pub capability: String,
    /// Forward action identifier dispatched to the worker.
    pub action: String,
    /// Compensating action identifier.
    pub compensation: String,
    /// Whether a failed attempt may be retried.
    pub retryable: bool,
    /// Per-step timeout; falls back to the coordinator default when unset.
    pub timeout_ms: Option<u64>,
    /// Optional input derivation; default passes the whole accumulator.
    #[serde(skip)]
    pub input: Option<InputSelector>,
}

impl SagaStep {
    /// Create a retryable step with no explicit timeout.
    pub fn new(
        name: impl Into<String>,
        capability: impl Into<String>,
        action: impl Into<String>,
        compensation: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            capability: capability.into(),
            action: action.into(),
            compensation: compensation.into(),
            retryable: true,
            timeout_ms: None,
            input: None,
        }
    }

    /// Fail the run on the first error instead of retrying.
    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    /// Set an explicit step timeout.
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    /// Derive the step input from the accumulator with `f` instead of
    /// passing the accumulator verbatim.
    pub fn with_input(mut self, f: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        self.input = Some(InputSelector::new(f));
        self
    }

    /// Explicit timeout as a [`Duration`], if declared.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// The input actually dispatched for this step.
    pub fn input_for(&self, data: &Value) -> Value {
        match &self.input {
            Some(selector) => selector.select(data),
            None => data.clone(),
        }
    }
}

/// An ordered sequence of compensable steps. Immutable once a run starts
/// (runs hold it behind an `Arc`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SagaDefinition {
    /// Definition name, carried into events and status snapshots.
    pub name: String,
    /// Steps in execution order.
    pub steps: Vec<SagaStep>,
}

impl SagaDefinition {
    /// Create an empty definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step.
    pub fn step(mut self, step: SagaStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the definition has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Look up a step by name.
    pub fn step_named(&self, name: &str) -> Option<&SagaStep> {
        self.steps.iter().find(|s| s.name == name)
    }
}
