use crate::consensus::{PerformanceReport, Solution, Validator, Verdict, WorkerVote};
use crate::decompose::{validate_graph, StrategyMap};
use crate::problem::{Problem, ProblemPhase, ProblemStatus};
use crate::task::{SubTask, TaskState};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use taskmesh_core::{
    ActionExecutor, EventBus, MeshError, MeshEvent, MeshResult, ProblemId, SchedulerConfig,
    StateStore, TaskId, WorkerId,
};
use taskmesh_registry::WorkerRegistry;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Mutable aggregate for one submitted problem: the immutable problem, its
/// task set, and execution bookkeeping. Only ever touched under the
/// scheduler's lock.
struct ProblemRun {
    problem: Problem,
    tasks: HashMap<TaskId, SubTask>,
    phase: ProblemPhase,
    failure: Option<String>,
    solution: Option<Solution>,
    extra_rounds_used: u32,
    running_now: usize,
    peak_parallelism: usize,
    compute_ms: u64,
    cancelled: bool,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ProblemRun {
    fn new(problem: Problem, tasks: Vec<SubTask>) -> Self {
        let now = Utc::now();
        Self {
            problem,
            tasks: tasks.into_iter().map(|t| (t.id, t)).collect(),
            phase: ProblemPhase::Running,
            failure: None,
            solution: None,
            extra_rounds_used: 0,
            running_now: 0,
            peak_parallelism: 0,
            compute_ms: 0,
            cancelled: false,
            started_at: now,
            updated_at: now,
        }
    }

    fn completed_ids(&self) -> BTreeSet<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.state == TaskState::Completed)
            .map(|t| t.id)
            .collect()
    }

    fn completed_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.state == TaskState::Completed)
            .count()
    }

    fn all_terminal(&self) -> bool {
        self.tasks.values().all(SubTask::is_terminal)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Bump the dispatch epoch of every non-terminal task so any in-flight
    /// result is discarded on arrival.
    fn invalidate_inflight(&mut self) {
        for task in self.tasks.values_mut() {
            if !task.is_terminal() {
                task.epoch += 1;
                task.assigned_to = None;
            }
        }
        self.running_now = 0;
    }

    fn status(&self) -> ProblemStatus {
        let total = self.tasks.len();
        let completed = self.completed_count();
        ProblemStatus {
            problem: self.problem.id,
            phase: self.phase,
            percent_complete: if total == 0 {
                1.0
            } else {
                completed as f64 / total as f64
            },
            total_tasks: total,
            completed_tasks: completed,
            solution: self.solution.clone(),
            failure: self.failure.clone(),
            started_at: self.started_at,
            updated_at: self.updated_at,
        }
    }
}

/// Completion message sent from a dispatch back to the scheduling loop.
struct TaskOutcome {
    task: TaskId,
    epoch: u64,
    worker: WorkerId,
    result: Result<Value, String>,
    elapsed_ms: u64,
}

/// Everything a fire-and-forget dispatch needs.
struct Dispatch {
    problem: ProblemId,
    task: TaskId,
    epoch: u64,
    worker: WorkerId,
    action: String,
    input: Value,
    cost: u32,
    timeout: Duration,
}

enum Applied {
    Completed { task: TaskId },
    Retry { task: TaskId, error: String },
    Terminal { task: TaskId, name: String, error: String },
    Stale,
}

enum Reconcile {
    KeepGoing,
    Finished,
    Validate {
        problem: Problem,
        votes: Vec<WorkerVote>,
        final_result: Option<Value>,
        perf: PerformanceReport,
        rounds_left: u32,
    },
}

/// Decomposes problems into dependency graphs of sub-tasks, assigns ready
/// tasks to matching workers, reschedules on failure and worker loss, and
/// hands finished problems to the validator.
///
/// Each submitted problem gets its own scheduling loop; independent
/// problems run fully in parallel. Dispatches are fire-and-forget: the
/// loop never blocks on a single worker call, and completions come back
/// over a channel tagged with the dispatch epoch so late or duplicate
/// results are discarded instead of applied.
#[derive(Clone)]
pub struct TaskScheduler {
    registry: Arc<WorkerRegistry>,
    executor: Arc<dyn ActionExecutor>,
    events: EventBus,
    store: Arc<dyn StateStore>,
    strategies: Arc<StrategyMap>,
    validator: Arc<Validator>,
    config: SchedulerConfig,
    problems: Arc<RwLock<HashMap<ProblemId, ProblemRun>>>,
}

impl TaskScheduler {
    /// Create a scheduler over the given registry, executor seam, event
    /// bus, store, strategy map, and validator.
    pub fn new(
        registry: Arc<WorkerRegistry>,
        executor: Arc<dyn ActionExecutor>,
        events: EventBus,
        store: Arc<dyn StateStore>,
        strategies: Arc<StrategyMap>,
        validator: Arc<Validator>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            executor,
            events,
            store,
            strategies,
            validator,
            config,
            problems: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Submit a problem. Non-blocking: decomposes it via the registered
    /// strategy, validates the dependency graph, and spawns the problem's
    /// scheduling loop. Completion is observed via the event stream or
    /// [`get_status`](Self::get_status).
    pub async fn submit(&self, problem: Problem) -> MeshResult<ProblemId> {
        let strategy = self.strategies.get(&problem.problem_type).ok_or_else(|| {
            MeshError::NotFound(format!(
                "no decomposition strategy for problem type '{}'",
                problem.problem_type
            ))
        })?;
        let tasks = strategy.decompose(&problem)?;
        if tasks.is_empty() {
            return Err(MeshError::InvalidDefinition(format!(
                "strategy for '{}' produced no tasks",
                problem.problem_type
            )));
        }
        validate_graph(&tasks)?;

        let id = problem.id;
        let problem_type = problem.problem_type.clone();
        let task_count = tasks.len();
        self.problems
            .write()
            .await
            .insert(id, ProblemRun::new(problem, tasks));

        info!(problem = %id, problem_type = %problem_type, tasks = task_count, "problem submitted");
        self.events.publish(MeshEvent::ProblemSubmitted {
            problem: id,
            problem_type,
            tasks: task_count,
        });
        self.persist(id).await;

        let this = self.clone();
        tokio::spawn(async move {
            this.run_problem(id).await;
        });
        Ok(id)
    }

    /// Current snapshot of a problem, well-formed at any lifecycle point.
    pub async fn get_status(&self, id: ProblemId) -> MeshResult<ProblemStatus> {
        self.problems
            .read()
            .await
            .get(&id)
            .map(ProblemRun::status)
            .ok_or_else(|| MeshError::NotFound(format!("problem {id}")))
    }

    /// Snapshot of a problem's sub-tasks.
    pub async fn tasks(&self, id: ProblemId) -> MeshResult<Vec<SubTask>> {
        self.problems
            .read()
            .await
            .get(&id)
            .map(|run| run.tasks.values().cloned().collect())
            .ok_or_else(|| MeshError::NotFound(format!("problem {id}")))
    }

    /// Mark a problem cancelled. In-flight dispatches are invalidated by
    /// epoch, so late results are discarded rather than applied.
    pub async fn cancel(&self, id: ProblemId) -> MeshResult<()> {
        let mut problems = self.problems.write().await;
        let run = problems
            .get_mut(&id)
            .ok_or_else(|| MeshError::NotFound(format!("problem {id}")))?;
        if !run.phase.is_terminal() {
            run.cancelled = true;
        }
        Ok(())
    }

    /// Non-terminal problems with no progress inside `window` — the health
    /// check surface. (The scheduling loop also fails stalled problems on
    /// its own once the configured stall window elapses.)
    pub async fn stalled_problems(&self, window: Duration) -> Vec<ProblemId> {
        let now = Utc::now();
        self.problems
            .read()
            .await
            .values()
            .filter(|r| !r.phase.is_terminal())
            .filter(|r| (now - r.updated_at).to_std().unwrap_or_default() > window)
            .map(|r| r.problem.id)
            .collect()
    }

    /// Number of tracked problems (any phase).
    pub async fn problem_count(&self) -> usize {
        self.problems.read().await.len()
    }

    /// Per-problem scheduling loop: assign ready tasks, then wait on
    /// completions, registry events, or the tick.
    async fn run_problem(&self, id: ProblemId) {
        let (tx, mut rx) = mpsc::unbounded_channel::<TaskOutcome>();
        let mut registry_events = self.events.subscribe();

        loop {
            self.assign_ready(id, &tx).await;

            if self.reconcile(id).await {
                break;
            }

            let pause = jittered(self.config.tick(), self.config.assign_jitter_max_ms);
            tokio::select! {
                Some(outcome) = rx.recv() => {
                    self.apply_outcome(id, outcome).await;
                    // Drain whatever else already arrived before the next
                    // assignment pass.
                    while let Ok(outcome) = rx.try_recv() {
                        self.apply_outcome(id, outcome).await;
                    }
                }
                event = registry_events.recv() => {
                    if let Ok(MeshEvent::WorkerLost { worker }) = event {
                        self.requeue_worker_tasks(id, worker).await;
                    }
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
        debug!(problem = %id, "scheduling loop finished");
    }

    /// Offer every ready task to the registry and dispatch the matches.
    ///
    /// The task set and the registry are never locked at the same time:
    /// readiness is snapshotted first, the worker is reserved second, and
    /// the assignment commits task-side last — releasing the reservation
    /// if the task moved on in between.
    async fn assign_ready(&self, id: ProblemId, tx: &mpsc::UnboundedSender<TaskOutcome>) {
        let ready: Vec<(TaskId, String, u32)> = {
            let problems = self.problems.read().await;
            let Some(run) = problems.get(&id) else { return };
            if run.phase != ProblemPhase::Running || run.cancelled {
                return;
            }
            let completed = run.completed_ids();
            run.tasks
                .values()
                .filter(|t| t.is_ready(&completed))
                .map(|t| (t.id, t.capability.clone(), t.estimated_cost))
                .collect()
        };

        for (task_id, capability, cost) in ready {
            let Some(worker) = self
                .registry
                .find_match(std::slice::from_ref(&capability))
                .await
            else {
                // Backpressure: re-offered on the next jittered tick.
                debug!(problem = %id, task = %task_id, capability = %capability, "no worker available");
                continue;
            };
            if self.registry.reserve(worker.id, cost).await.is_err() {
                continue;
            }

            let committed = {
                let mut problems = self.problems.write().await;
                problems.get_mut(&id).and_then(|run| {
                    if run.phase != ProblemPhase::Running || run.cancelled {
                        return None;
                    }
                    let input = {
                        let task = run.tasks.get(&task_id)?;
                        if task.state != TaskState::Pending {
                            return None;
                        }
                        let inputs: serde_json::Map<String, Value> = task
                            .dependencies
                            .iter()
                            .filter_map(|d| run.tasks.get(d))
                            .filter_map(|t| t.result.as_ref().map(|r| (t.name.clone(), r.clone())))
                            .collect();
                        json!({
                            "problem": run.problem.payload,
                            "task": task.name,
                            "inputs": inputs,
                        })
                    };
                    let task = run.tasks.get_mut(&task_id)?;
                    task.state = TaskState::Assigned;
                    task.assigned_to = Some(worker.id);
                    task.attempts += 1;
                    task.epoch += 1;
                    let commit = (task.epoch, task.action.clone(), input);
                    run.touch();
                    Some(commit)
                })
            };

            match committed {
                Some((epoch, action, input)) => {
                    debug!(problem = %id, task = %task_id, worker = %worker.id, action = %action, "task assigned");
                    self.events.publish(MeshEvent::TaskScheduled {
                        problem: id,
                        task: task_id,
                        worker: worker.id,
                    });
                    let this = self.clone();
                    let tx = tx.clone();
                    let dispatch = Dispatch {
                        problem: id,
                        task: task_id,
                        epoch,
                        worker: worker.id,
                        action,
                        input,
                        cost,
                        timeout: self.config.task_timeout(),
                    };
                    tokio::spawn(async move {
                        this.dispatch(dispatch, tx).await;
                    });
                }
                None => {
                    // The task moved on while we reserved; drop the
                    // reservation without recording an outcome.
                    if let Err(e) = self.registry.release(worker.id, cost).await {
                        warn!(worker = %worker.id, error = %e, "failed to release reservation");
                    }
                }
            }
        }
    }

    /// Execute one assignment against the worker seam and report back.
    async fn dispatch(&self, dispatch: Dispatch, tx: mpsc::UnboundedSender<TaskOutcome>) {
        let Dispatch {
            problem,
            task,
            epoch,
            worker,
            action,
            input,
            cost,
            timeout,
        } = dispatch;

        self.mark_running(problem, task, epoch).await;
        let started = std::time::Instant::now();
        let outcome =
            tokio::time::timeout(timeout, self.executor.execute(worker, &action, input)).await;
        let result = match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "action '{action}' timed out after {}ms",
                timeout.as_millis()
            )),
        };

        if let Err(e) = self
            .registry
            .record_outcome(worker, result.is_ok(), cost)
            .await
        {
            warn!(worker = %worker, error = %e, "failed to record task outcome");
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let _ = tx.send(TaskOutcome {
            task,
            epoch,
            worker,
            result,
            elapsed_ms,
        });
    }

    /// `Assigned → Running` once the dispatch actually starts executing.
    async fn mark_running(&self, id: ProblemId, task_id: TaskId, epoch: u64) {
        let mut problems = self.problems.write().await;
        let Some(run) = problems.get_mut(&id) else { return };
        let Some(task) = run.tasks.get_mut(&task_id) else { return };
        if task.epoch == epoch && task.state == TaskState::Assigned {
            task.state = TaskState::Running;
            run.running_now += 1;
            run.peak_parallelism = run.peak_parallelism.max(run.running_now);
            run.touch();
        }
    }

    /// Apply a completion message. Results with a stale epoch (cancelled,
    /// reassigned, or timed-out-then-returned dispatches) are discarded.
    async fn apply_outcome(&self, id: ProblemId, outcome: TaskOutcome) {
        let applied = {
            let mut problems = self.problems.write().await;
            let Some(run) = problems.get_mut(&id) else { return };
            let max_attempts = self.config.max_attempts;
            let Some(task) = run.tasks.get_mut(&outcome.task) else { return };
            if task.epoch != outcome.epoch || task.is_terminal() {
                Applied::Stale
            } else {
                let was_running = task.state == TaskState::Running;
                task.assigned_to = None;
                match outcome.result {
                    Ok(value) => {
                        let t = task.id;
                        task.state = TaskState::Completed;
                        task.result = Some(value);
                        task.completed_by = Some(outcome.worker);
                        if was_running {
                            run.running_now = run.running_now.saturating_sub(1);
                        }
                        run.compute_ms += outcome.elapsed_ms;
                        run.touch();
                        Applied::Completed { task: t }
                    }
                    Err(error) => {
                        let t = task.id;
                        let name = task.name.clone();
                        let exhausted = task.attempts >= max_attempts;
                        task.state = if exhausted {
                            TaskState::Failed
                        } else {
                            TaskState::Pending
                        };
                        if was_running {
                            run.running_now = run.running_now.saturating_sub(1);
                        }
                        run.touch();
                        if exhausted {
                            Applied::Terminal {
                                task: t,
                                name,
                                error,
                            }
                        } else {
                            Applied::Retry { task: t, error }
                        }
                    }
                }
            }
        };

        match applied {
            Applied::Stale => {
                debug!(problem = %id, task = %outcome.task, "discarding stale task result");
            }
            Applied::Completed { task } => {
                self.events
                    .publish(MeshEvent::TaskCompleted { problem: id, task });
                self.persist(id).await;
            }
            Applied::Retry { task, error } => {
                warn!(problem = %id, task = %task, error = %error, "task attempt failed, requeueing");
                self.events.publish(MeshEvent::TaskFailed {
                    problem: id,
                    task,
                    error,
                    terminal: false,
                });
                self.persist(id).await;
            }
            Applied::Terminal { task, name, error } => {
                self.events.publish(MeshEvent::TaskFailed {
                    problem: id,
                    task,
                    error: error.clone(),
                    terminal: true,
                });
                self.fail_problem(id, format!("task '{name}' failed permanently: {error}"))
                    .await;
            }
        }
    }

    /// Check for cancellation, stall, and completion; returns whether the
    /// scheduling loop should stop.
    async fn reconcile(&self, id: ProblemId) -> bool {
        let action = {
            let mut problems = self.problems.write().await;
            let Some(run) = problems.get_mut(&id) else { return true };
            if run.phase.is_terminal() {
                return true;
            }
            if run.cancelled {
                run.phase = ProblemPhase::Cancelled;
                run.failure = Some("cancelled by caller".to_string());
                run.invalidate_inflight();
                run.touch();
                Reconcile::Finished
            } else if run.all_terminal() {
                // A task failing at the attempt ceiling flips the phase in
                // apply_outcome, so everything terminal here completed.
                run.phase = ProblemPhase::Validating;
                let votes: Vec<WorkerVote> = run
                    .tasks
                    .values()
                    .filter(|t| t.candidate && t.state == TaskState::Completed)
                    .map(|t| WorkerVote {
                        worker: t.completed_by.unwrap_or_default(),
                        task: t.name.clone(),
                        value: t.result.clone().unwrap_or(Value::Null),
                    })
                    .collect();
                let depended: BTreeSet<TaskId> = run
                    .tasks
                    .values()
                    .flat_map(|t| t.dependencies.iter().copied())
                    .collect();
                let sink_result = |candidate: bool| {
                    run.tasks
                        .values()
                        .filter(|t| {
                            t.state == TaskState::Completed
                                && !depended.contains(&t.id)
                                && t.candidate == candidate
                        })
                        .filter_map(|t| t.result.clone())
                        .next()
                };
                let final_result = sink_result(false).or_else(|| sink_result(true));
                let perf = PerformanceReport {
                    wall_ms: (Utc::now() - run.started_at).num_milliseconds().max(0) as u64,
                    compute_ms: run.compute_ms,
                    parallelism: run.peak_parallelism,
                };
                let rounds_left = self
                    .validator
                    .max_extra_rounds()
                    .saturating_sub(run.extra_rounds_used);
                Reconcile::Validate {
                    problem: run.problem.clone(),
                    votes,
                    final_result,
                    perf,
                    rounds_left,
                }
            } else if (Utc::now() - run.updated_at).to_std().unwrap_or_default()
                > self.config.stall_window()
            {
                run.phase = ProblemPhase::Failed;
                run.failure = Some(format!(
                    "stalled: no progress within {}ms",
                    self.config.stall_window_ms
                ));
                run.invalidate_inflight();
                run.touch();
                Reconcile::Finished
            } else {
                Reconcile::KeepGoing
            }
        };

        match action {
            Reconcile::KeepGoing => false,
            Reconcile::Finished => {
                let reason = self
                    .problems
                    .read()
                    .await
                    .get(&id)
                    .and_then(|r| r.failure.clone())
                    .unwrap_or_else(|| "unknown".to_string());
                warn!(problem = %id, reason = %reason, "problem did not complete");
                self.events
                    .publish(MeshEvent::ProblemFailed { problem: id, reason });
                self.persist(id).await;
                true
            }
            Reconcile::Validate {
                problem,
                votes,
                final_result,
                perf,
                rounds_left,
            } => {
                self.finish_validation(id, &problem, votes, final_result, perf, rounds_left)
                    .await
            }
        }
    }

    /// Hand the finished problem to the validator; either finalize the
    /// solution or spawn an extra solver round.
    async fn finish_validation(
        &self,
        id: ProblemId,
        problem: &Problem,
        votes: Vec<WorkerVote>,
        final_result: Option<Value>,
        perf: PerformanceReport,
        rounds_left: u32,
    ) -> bool {
        match self
            .validator
            .validate(problem, votes, final_result, perf, rounds_left)
        {
            Verdict::Accept(solution) => {
                let confidence = solution.confidence;
                {
                    let mut problems = self.problems.write().await;
                    if let Some(run) = problems.get_mut(&id) {
                        run.phase = ProblemPhase::Solved;
                        run.solution = Some(solution);
                        run.touch();
                    }
                }
                info!(problem = %id, confidence, "problem solved");
                self.events.publish(MeshEvent::ProblemSolved {
                    problem: id,
                    confidence,
                });
                self.persist(id).await;
                true
            }
            Verdict::NeedsMoreCandidates { score } => {
                let spawned = {
                    let mut problems = self.problems.write().await;
                    let Some(run) = problems.get_mut(&id) else { return true };
                    run.extra_rounds_used += 1;
                    let round = run.extra_rounds_used;
                    let replicas: Vec<SubTask> = run
                        .tasks
                        .values()
                        .filter(|t| t.candidate && t.round == 0)
                        .map(|t| t.replicate(round))
                        .collect();
                    let count = replicas.len();
                    for replica in replicas {
                        run.tasks.insert(replica.id, replica);
                    }
                    run.phase = ProblemPhase::Running;
                    run.touch();
                    count
                };
                info!(problem = %id, score, spawned, "agreement below threshold, spawning extra solver round");
                self.persist(id).await;
                false
            }
        }
    }

    /// Single surfaced failure: flip the phase, invalidate in-flight
    /// dispatches (cancelling the non-terminal siblings), and publish.
    async fn fail_problem(&self, id: ProblemId, reason: String) {
        let newly_failed = {
            let mut problems = self.problems.write().await;
            let Some(run) = problems.get_mut(&id) else { return };
            if run.phase.is_terminal() {
                false
            } else {
                run.phase = ProblemPhase::Failed;
                run.failure = Some(reason.clone());
                run.invalidate_inflight();
                run.touch();
                true
            }
        };
        if newly_failed {
            warn!(problem = %id, reason = %reason, "problem failed");
            self.events
                .publish(MeshEvent::ProblemFailed { problem: id, reason });
            self.persist(id).await;
        }
    }

    /// `worker:lost`: every task assigned to the lost worker goes back to
    /// `pending` and is rescheduled, unless its attempt budget is already
    /// spent — then the problem fails deterministically.
    async fn requeue_worker_tasks(&self, id: ProblemId, worker: WorkerId) {
        let mut exhausted: Option<String> = None;
        let mut requeued = 0usize;
        {
            let mut problems = self.problems.write().await;
            let Some(run) = problems.get_mut(&id) else { return };
            if run.phase != ProblemPhase::Running {
                return;
            }
            let mut was_running = 0usize;
            for task in run.tasks.values_mut() {
                if task.assigned_to == Some(worker)
                    && matches!(task.state, TaskState::Assigned | TaskState::Running)
                {
                    if task.state == TaskState::Running {
                        was_running += 1;
                    }
                    task.epoch += 1;
                    task.assigned_to = None;
                    if task.attempts >= self.config.max_attempts {
                        task.state = TaskState::Failed;
                        if exhausted.is_none() {
                            exhausted = Some(
                                MeshError::DependencyUnsatisfiable {
                                    task: task.name.clone(),
                                    reason: "worker lost with no retry budget left".to_string(),
                                }
                                .to_string(),
                            );
                        }
                    } else {
                        task.state = TaskState::Pending;
                        requeued += 1;
                    }
                }
            }
            run.running_now = run.running_now.saturating_sub(was_running);
            if requeued > 0 || exhausted.is_some() {
                run.touch();
            }
        }
        if requeued > 0 {
            info!(problem = %id, worker = %worker, requeued, "requeued tasks after worker loss");
        }
        if let Some(reason) = exhausted {
            self.fail_problem(id, reason).await;
        }
    }

    /// Best-effort mirror of the problem snapshot into the state store.
    async fn persist(&self, id: ProblemId) {
        let Some(status) = self.problems.read().await.get(&id).map(ProblemRun::status) else {
            return;
        };
        match serde_json::to_value(&status) {
            Ok(value) => {
                if let Err(e) = self.store.set(&format!("problem/{id}"), value).await {
                    warn!(problem = %id, error = %e, "failed to persist problem");
                }
            }
            Err(e) => warn!(problem = %id, error = %e, "failed to serialize problem"),
        }
    }
}

/// Base delay plus bounded random jitter, so concurrent loops spread out.
fn jittered(base: Duration, jitter_max_ms: u64) -> Duration {
    if jitter_max_ms == 0 {
        return base;
    }
    let jitter = rand::thread_rng().gen_range(0..jitter_max_ms);
    base + Duration::from_millis(jitter)
}
