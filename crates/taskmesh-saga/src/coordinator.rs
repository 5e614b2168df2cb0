use crate::definition::{SagaDefinition, SagaStep};
use crate::run::{RunState, SagaRun, SagaStatus};
use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use taskmesh_core::{
    ActionExecutor, EventBus, MeshError, MeshEvent, MeshResult, RunId, SagaConfig, StateStore,
    WorkerId,
};
use taskmesh_registry::WorkerRegistry;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Terminal callbacks, fired exactly once per run.
#[async_trait]
pub trait SagaHooks: Send + Sync {
    /// Called after a run reaches `Completed`.
    async fn on_success(&self, _status: &SagaStatus) {}
    /// Called after a run reaches `Compensated`, with the unwind already
    /// finished.
    async fn on_failure(&self, _status: &SagaStatus) {}
}

/// Default hooks: do nothing.
pub struct NoopHooks;

#[async_trait]
impl SagaHooks for NoopHooks {}

/// Executes saga definitions against the worker pool: forward steps in
/// order with per-step retry and exponential backoff, best-effort reverse
/// compensation on permanent failure.
///
/// Many runs execute concurrently; each run's state is only touched under
/// the coordinator's lock, and the drive loop never holds that lock across
/// a dispatch.
#[derive(Clone)]
pub struct SagaCoordinator {
    registry: Arc<WorkerRegistry>,
    executor: Arc<dyn ActionExecutor>,
    events: EventBus,
    store: Arc<dyn StateStore>,
    config: SagaConfig,
    runs: Arc<RwLock<HashMap<RunId, SagaRun>>>,
    hooks: Arc<dyn SagaHooks>,
}

impl SagaCoordinator {
    /// Create a coordinator over the given registry, executor seam, event
    /// bus, and store.
    pub fn new(
        registry: Arc<WorkerRegistry>,
        executor: Arc<dyn ActionExecutor>,
        events: EventBus,
        store: Arc<dyn StateStore>,
        config: SagaConfig,
    ) -> Self {
        Self {
            registry,
            executor,
            events,
            store,
            config,
            runs: Arc::new(RwLock::new(HashMap::new())),
            hooks: Arc::new(NoopHooks),
        }
    }

    /// Install terminal callbacks.
    pub fn with_hooks(mut self, hooks: Arc<dyn SagaHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Submit a definition for execution. Non-blocking: returns the run id
    /// immediately; completion is observed via the event stream,
    /// [`get_status`](Self::get_status), or hooks.
    pub async fn submit(&self, definition: SagaDefinition, initial: Value) -> MeshResult<RunId> {
        if definition.is_empty() {
            return Err(MeshError::InvalidDefinition(format!(
                "saga '{}' has no steps",
                definition.name
            )));
        }
        let mut seen = HashSet::new();
        for step in &definition.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(MeshError::InvalidDefinition(format!(
                    "duplicate step name '{}'",
                    step.name
                )));
            }
        }

        let definition = Arc::new(definition);
        let run = SagaRun::new(definition.clone(), initial);
        let id = run.id;
        self.runs.write().await.insert(id, run);

        info!(run = %id, definition = %definition.name, "saga submitted");
        self.events.publish(MeshEvent::SagaStarted {
            run: id,
            definition: definition.name.clone(),
        });
        self.persist(id).await;

        let this = self.clone();
        tokio::spawn(async move {
            this.drive(id).await;
        });
        Ok(id)
    }

    /// Current snapshot of a run, well-formed at any lifecycle point.
    pub async fn get_status(&self, id: RunId) -> MeshResult<SagaStatus> {
        self.runs
            .read()
            .await
            .get(&id)
            .map(SagaRun::status)
            .ok_or_else(|| MeshError::NotFound(format!("saga run {id}")))
    }

    /// Mark a run cancelled. The drive loop observes the mark at the next
    /// step boundary, discards any late forward output, and compensates
    /// the steps that completed.
    pub async fn cancel(&self, id: RunId) -> MeshResult<()> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(&id)
            .ok_or_else(|| MeshError::NotFound(format!("saga run {id}")))?;
        if !run.is_terminal() {
            run.cancelled = true;
        }
        Ok(())
    }

    /// Non-terminal runs with no progress inside `window` — the health
    /// check surface for stalled sagas.
    pub async fn stalled_runs(&self, window: Duration) -> Vec<RunId> {
        let now = chrono::Utc::now();
        self.runs
            .read()
            .await
            .values()
            .filter(|r| !r.is_terminal())
            .filter(|r| (now - r.updated_at).to_std().unwrap_or_default() > window)
            .map(|r| r.id)
            .collect()
    }

    /// Number of tracked runs (any state).
    pub async fn run_count(&self) -> usize {
        self.runs.read().await.len()
    }

    async fn drive(&self, id: RunId) {
        let definition = match self.runs.read().await.get(&id) {
            Some(run) => run.definition.clone(),
            None => return,
        };
        let total = definition.steps.len();
        let mut index = 0usize;

        while index < total {
            let step = definition.steps[index].clone();
            if self.is_cancelled(id).await {
                self.fail_and_compensate(id, &step.name, "cancelled by caller")
                    .await;
                return;
            }
            let data = match self.run_data(id).await {
                Some(d) => d,
                None => return,
            };

            match self.execute_step(id, &step, &data).await {
                Ok(output) => {
                    if self.is_cancelled(id).await {
                        // Late output for a cancelled run is discarded, not applied.
                        self.fail_and_compensate(id, &step.name, "cancelled by caller")
                            .await;
                        return;
                    }
                    {
                        let mut runs = self.runs.write().await;
                        if let Some(run) = runs.get_mut(&id) {
                            run.record_step_output(&step.name, output);
                        }
                    }
                    self.events.publish(MeshEvent::SagaStepCompleted {
                        run: id,
                        step: step.name.clone(),
                    });
                    self.persist(id).await;
                    index += 1;
                }
                Err(err) => {
                    let reason = err.to_string();
                    self.events.publish(MeshEvent::SagaStepFailed {
                        run: id,
                        step: step.name.clone(),
                        error: reason.clone(),
                    });
                    self.fail_and_compensate(id, &step.name, &reason).await;
                    return;
                }
            }
        }

        let status = {
            let mut runs = self.runs.write().await;
            match runs.get_mut(&id) {
                Some(run) => {
                    run.finish();
                    run.status()
                }
                None => return,
            }
        };
        info!(run = %id, "saga completed");
        self.events.publish(MeshEvent::SagaCompleted { run: id });
        self.persist(id).await;
        self.hooks.on_success(&status).await;
    }

    /// Run one forward step to success or permanent failure.
    ///
    /// A missing worker is a scheduling-attempt retry (jittered re-poll,
    /// no attempt consumed); an executor error or timeout consumes one of
    /// the step's attempts and backs off exponentially before the next.
    async fn execute_step(&self, id: RunId, step: &SagaStep, data: &Value) -> MeshResult<Value> {
        let max_attempts = if step.retryable {
            self.config.max_attempts
        } else {
            1
        };
        let timeout = step.timeout().unwrap_or_else(|| self.config.step_timeout());
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let worker = self.acquire_worker(id, step).await?;
            let input = step.input_for(data);
            debug!(run = %id, step = %step.name, worker = %worker, attempt, "dispatching step");

            let dispatched =
                tokio::time::timeout(timeout, self.executor.execute(worker, &step.action, input))
                    .await;
            let outcome: Result<Value, String> = match dispatched {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
            };

            if let Err(e) = self
                .registry
                .record_outcome(worker, outcome.is_ok(), 1)
                .await
            {
                warn!(worker = %worker, error = %e, "failed to record step outcome");
            }

            match outcome {
                Ok(output) => return Ok(output),
                Err(reason) => {
                    warn!(run = %id, step = %step.name, attempt, error = %reason, "step attempt failed");
                    if attempt >= max_attempts {
                        return Err(MeshError::ActionFailed {
                            action: step.action.clone(),
                            reason,
                        });
                    }
                    tokio::time::sleep(self.config.backoff_for(attempt)).await;
                }
            }
        }
    }

    /// Poll the registry until a matching worker is reserved or the run is
    /// cancelled.
    async fn acquire_worker(&self, id: RunId, step: &SagaStep) -> MeshResult<WorkerId> {
        loop {
            if self.is_cancelled(id).await {
                return Err(MeshError::ActionFailed {
                    action: step.action.clone(),
                    reason: "cancelled by caller".to_string(),
                });
            }
            match self
                .registry
                .find_match(std::slice::from_ref(&step.capability))
                .await
            {
                Some(worker) => match self.registry.reserve(worker.id, 1).await {
                    Ok(()) => return Ok(worker.id),
                    // Lost the race for the last capacity slot; re-poll.
                    Err(_) => {
                        tokio::time::sleep(jittered(self.config.no_worker_retry())).await;
                    }
                },
                None => {
                    debug!(run = %id, capability = %step.capability, "no worker available, re-polling");
                    tokio::time::sleep(jittered(self.config.no_worker_retry())).await;
                }
            }
        }
    }

    /// Record the failure, then unwind completed steps in strict reverse
    /// order. Every compensation is attempted exactly once; failures are
    /// logged and never halt the unwind.
    async fn fail_and_compensate(&self, id: RunId, failed_step: &str, error: &str) {
        let (definition, completed, data) = {
            let mut runs = self.runs.write().await;
            let Some(run) = runs.get_mut(&id) else { return };
            run.begin_compensation(failed_step, error);
            (
                run.definition.clone(),
                run.completed_steps.clone(),
                run.data.clone(),
            )
        };
        warn!(run = %id, failed_step, error, "saga failed, compensating");
        self.persist(id).await;

        for name in completed.iter().rev() {
            let Some(step) = definition.step_named(name) else {
                continue;
            };
            match self.compensate_step(step, &data).await {
                Ok(()) => {
                    debug!(run = %id, step = %name, "step compensated");
                    self.events.publish(MeshEvent::SagaStepCompensated {
                        run: id,
                        step: name.clone(),
                    });
                }
                Err(e) => {
                    warn!(run = %id, step = %name, error = %e, "compensation failed");
                    self.events.publish(MeshEvent::SagaCompensationFailed {
                        run: id,
                        step: name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let status = {
            let mut runs = self.runs.write().await;
            let Some(run) = runs.get_mut(&id) else { return };
            run.finish_compensated();
            run.status()
        };
        self.events.publish(MeshEvent::SagaCompensated { run: id });
        self.events.publish(MeshEvent::SagaFailed {
            run: id,
            failed_step: failed_step.to_string(),
            error: error.to_string(),
        });
        self.persist(id).await;
        self.hooks.on_failure(&status).await;
    }

    /// Invoke one compensating action with the run's current data. Never
    /// retried: a missing worker or executor failure surfaces as
    /// [`MeshError::CompensationFailed`].
    async fn compensate_step(&self, step: &SagaStep, data: &Value) -> MeshResult<()> {
        let worker = self
            .registry
            .find_match(std::slice::from_ref(&step.capability))
            .await
            .ok_or_else(|| MeshError::CompensationFailed {
                step: step.name.clone(),
                reason: "no worker available".to_string(),
            })?;
        self.registry
            .reserve(worker.id, 1)
            .await
            .map_err(|e| MeshError::CompensationFailed {
                step: step.name.clone(),
                reason: e.to_string(),
            })?;

        let timeout = step.timeout().unwrap_or_else(|| self.config.step_timeout());
        let dispatched = tokio::time::timeout(
            timeout,
            self.executor
                .execute(worker.id, &step.compensation, data.clone()),
        )
        .await;
        let result = match dispatched {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(MeshError::CompensationFailed {
                step: step.name.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(MeshError::CompensationFailed {
                step: step.name.clone(),
                reason: format!("timed out after {}ms", timeout.as_millis()),
            }),
        };
        if let Err(e) = self
            .registry
            .record_outcome(worker.id, result.is_ok(), 1)
            .await
        {
            warn!(worker = %worker.id, error = %e, "failed to record compensation outcome");
        }
        result
    }

    async fn is_cancelled(&self, id: RunId) -> bool {
        self.runs
            .read()
            .await
            .get(&id)
            .is_some_and(|r| r.cancelled)
    }

    async fn run_data(&self, id: RunId) -> Option<Value> {
        self.runs.read().await.get(&id).map(|r| r.data.clone())
    }

    /// Best-effort mirror of the run snapshot into the state store.
    async fn persist(&self, id: RunId) {
        let Some(status) = self.runs.read().await.get(&id).map(SagaRun::status) else {
            return;
        };
        match serde_json::to_value(&status) {
            Ok(value) => {
                if let Err(e) = self.store.set(&format!("saga/{id}"), value).await {
                    warn!(run = %id, error = %e, "failed to persist saga run");
                }
            }
            Err(e) => warn!(run = %id, error = %e, "failed to serialize saga run"),
        }
    }
}

/// Base delay plus up to 50% random jitter, so competing pollers spread out.
fn jittered(base: Duration) -> Duration {
    let half = (base.as_millis() as u64 / 2).max(1);
    let jitter = rand::thread_rng().gen_range(0..half);
    base + Duration::from_millis(jitter)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_stays_bounded() {
        let base = Duration::from_millis(100);
        for _ in 0..50 {
            let d = jittered(base);
            assert!(d >= base);
            assert!(d < base + Duration::from_millis(50));
        }
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_definition() {
        let store: Arc<taskmesh_core::InMemoryStateStore> =
            Arc::new(taskmesh_core::InMemoryStateStore::new());
        let events = EventBus::default();
        let registry = Arc::new(WorkerRegistry::new(events.clone(), store.clone()));

        struct NeverExecutor;
        #[async_trait]
        impl ActionExecutor for NeverExecutor {
            async fn execute(
                &self,
                _worker: taskmesh_core::WorkerId,
                action: &str,
                _input: Value,
            ) -> MeshResult<Value> {
                Err(MeshError::ActionFailed {
                    action: action.to_string(),
                    reason: "unexpected dispatch".to_string(),
                })
            }
        }

        let coordinator = SagaCoordinator::new(
            registry,
            Arc::new(NeverExecutor),
            events,
            store,
            SagaConfig::default(),
        );

        let err = coordinator
            .submit(SagaDefinition::new("empty"), Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::InvalidDefinition(_)));

        let dup = SagaDefinition::new("dup")
            .step(SagaStep::new("a", "c", "x", "undo-x"))
            .step(SagaStep::new("a", "c", "y", "undo-y"));
        let err = coordinator.submit(dup, Value::Null).await.unwrap_err();
        assert!(matches!(err, MeshError::InvalidDefinition(_)));
    }
}
