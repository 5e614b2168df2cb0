//! End-to-end scheduling: decomposition, parallel dispatch, failure
//! reassignment, consensus rounds, and stall handling against a scripted
//! executor.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskmesh_core::{
    ActionExecutor, ConsensusConfig, EventBus, InMemoryStateStore, MeshError, MeshEvent,
    MeshResult, ProblemId, SchedulerConfig, WorkerId,
};
use taskmesh_registry::{WorkerAgent, WorkerRegistry, WorkerStatus};
use taskmesh_scheduler::{
    Complexity, FanOutStrategy, NumericTolerance, Problem, ProblemPhase, ProblemStatus,
    StrategyMap, TaskScheduler, TaskState, Validator,
};

// ---------------------------------------------------------------------------
// Scripted executor
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScriptedExecutor {
    /// (action, input) per dispatch, in order.
    calls: Mutex<Vec<(String, Value)>>,
    /// action -> always fail.
    fail_actions: Mutex<HashMap<String, bool>>,
    /// action -> artificial latency.
    delays: Mutex<HashMap<String, Duration>>,
    /// When set, each `solve` returns a different value (10 * call index).
    distinct_solve_values: AtomicBool,
    solve_calls: AtomicUsize,
}

impl ScriptedExecutor {
    fn new() -> Self {
        Self::default()
    }

    fn always_fail(&self, action: &str) {
        self.fail_actions
            .lock()
            .unwrap()
            .insert(action.to_string(), true);
    }

    fn delay(&self, action: &str, latency: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(action.to_string(), latency);
    }

    fn calls_for(&self, action: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| a == action)
            .count()
    }

    fn inputs_for(&self, action: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| a == action)
            .map(|(_, input)| input.clone())
            .collect()
    }

    fn call_order(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(a, _)| a.clone())
            .collect()
    }
}

#[async_trait]
impl ActionExecutor for ScriptedExecutor {
    async fn execute(&self, _worker: WorkerId, action: &str, input: Value) -> MeshResult<Value> {
        self.calls
            .lock()
            .unwrap()
            .push((action.to_string(), input));

        let delay = self.delays.lock().unwrap().get(action).copied();
        if let Some(latency) = delay {
            tokio::time::sleep(latency).await;
        }

        if self
            .fail_actions
            .lock()
            .unwrap()
            .get(action)
            .copied()
            .unwrap_or(false)
        {
            return Err(MeshError::ActionFailed {
                action: action.to_string(),
                reason: "scripted failure".to_string(),
            });
        }

        Ok(match action {
            "seed" => json!({"seed": 10}),
            "solve" => {
                let n = self.solve_calls.fetch_add(1, Ordering::SeqCst);
                if self.distinct_solve_values.load(Ordering::SeqCst) {
                    json!(n as f64 * 10.0)
                } else {
                    json!(42.0)
                }
            }
            "aggregate" => json!({"aggregated": 42.0}),
            other => json!({ "ok": other }),
        })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        max_attempts: 3,
        tick_ms: 10,
        assign_jitter_max_ms: 5,
        stall_window_ms: 5_000,
        task_timeout_ms: 1_000,
    }
}

struct Harness {
    scheduler: TaskScheduler,
    registry: Arc<WorkerRegistry>,
    executor: Arc<ScriptedExecutor>,
    events: EventBus,
}

fn harness_with(config: SchedulerConfig) -> Harness {
    // RUST_LOG=debug shows assignment and reconciliation decisions.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let events = EventBus::new(1024);
    let store = Arc::new(InMemoryStateStore::new());
    let registry = Arc::new(WorkerRegistry::new(events.clone(), store.clone()));
    let executor = Arc::new(ScriptedExecutor::new());
    let strategies = Arc::new(StrategyMap::new().with(
        "optimization",
        Arc::new(FanOutStrategy::new("seed", "solve", "aggregate")),
    ));
    let validator = Arc::new(
        Validator::new(ConsensusConfig::default())
            .with_policy("optimization", Arc::new(NumericTolerance::new(0.5))),
    );
    let scheduler = TaskScheduler::new(
        registry.clone(),
        executor.clone(),
        events.clone(),
        store,
        strategies,
        validator,
        config,
    );
    Harness {
        scheduler,
        registry,
        executor,
        events,
    }
}

fn harness() -> Harness {
    harness_with(fast_config())
}

async fn register_workers(registry: &WorkerRegistry, count: usize) -> Vec<WorkerId> {
    let mut ids = Vec::new();
    for _ in 0..count {
        let id = registry
            .register(WorkerAgent::new(["seed", "solve", "aggregate"], 1))
            .await
            .unwrap();
        ids.push(id);
    }
    ids
}

async fn wait_terminal(scheduler: &TaskScheduler, id: ProblemId) -> ProblemStatus {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let status = scheduler.get_status(id).await.unwrap();
            if status.phase.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("problem did not reach a terminal phase in time")
}

fn optimization(complexity: Complexity) -> Problem {
    Problem::new("optimization", json!({"target": "min"}), complexity)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_medium_problem_solves_with_full_parallelism() {
    let h = harness();
    register_workers(&h.registry, 4).await;
    // Slow solvers overlap across all four workers.
    h.executor.delay("solve", Duration::from_millis(80));
    let mut rx = h.events.subscribe();

    let id = h
        .scheduler
        .submit(optimization(Complexity::Medium))
        .await
        .unwrap();
    let status = wait_terminal(&h.scheduler, id).await;

    assert_eq!(status.phase, ProblemPhase::Solved);
    assert!((status.percent_complete - 1.0).abs() < f64::EPSILON);
    assert_eq!(status.total_tasks, 6);

    let solution = status.solution.unwrap();
    assert_eq!(solution.result, json!({"aggregated": 42.0}));
    assert!(solution.consensus.achieved);
    assert_eq!(solution.consensus.votes.len(), 4);
    // Four idle matching workers -> the four solvers ran concurrently.
    assert_eq!(solution.performance.parallelism, 4);
    assert!(solution.performance.compute_ms > 0);

    // The aggregate saw every solver's output.
    let aggregate_inputs = h.executor.inputs_for("aggregate");
    assert_eq!(aggregate_inputs.len(), 1);
    let inputs = aggregate_inputs[0]["inputs"].as_object().unwrap();
    assert_eq!(inputs.len(), 4);
    assert!(inputs.values().all(|v| *v == json!(42.0)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut saw_solved = false;
    let mut scheduled = 0;
    while let Ok(ev) = rx.try_recv() {
        match ev {
            MeshEvent::ProblemSolved { problem, .. } if problem == id => saw_solved = true,
            MeshEvent::TaskScheduled { problem, .. } if problem == id => scheduled += 1,
            _ => {}
        }
    }
    assert!(saw_solved);
    assert_eq!(scheduled, 6);
}

#[tokio::test]
async fn test_dependency_ordering_seed_solvers_aggregate() {
    let h = harness();
    register_workers(&h.registry, 4).await;

    let id = h
        .scheduler
        .submit(optimization(Complexity::Medium))
        .await
        .unwrap();
    wait_terminal(&h.scheduler, id).await;

    let order = h.executor.call_order();
    assert_eq!(order.first().map(String::as_str), Some("seed"));
    assert_eq!(order.last().map(String::as_str), Some("aggregate"));
    // No solver starts before the seed completed, and the aggregate starts
    // only after every solver: with the strict call order above plus one
    // seed and one aggregate, everything in between is a solver.
    assert_eq!(order.len(), 6);
    assert!(order[1..5].iter().all(|a| a == "solve"));

    // The recorded states agree: everything completed.
    let tasks = h.scheduler.tasks(id).await.unwrap();
    assert!(tasks.iter().all(|t| t.state == TaskState::Completed));
}

#[tokio::test]
async fn test_worker_loss_reassigns_in_flight_tasks() {
    let h = harness();
    let workers = register_workers(&h.registry, 2).await;
    h.executor.delay("solve", Duration::from_millis(300));

    let id = h
        .scheduler
        .submit(optimization(Complexity::Low))
        .await
        .unwrap();

    // Let the seed finish and both solvers start, then lose one worker.
    tokio::time::sleep(Duration::from_millis(150)).await;
    h.registry
        .mark_status(workers[0], WorkerStatus::Offline)
        .await
        .unwrap();

    let status = wait_terminal(&h.scheduler, id).await;
    assert_eq!(status.phase, ProblemPhase::Solved);

    // The orphaned solver was re-dispatched: more solve calls than solvers.
    assert!(h.executor.calls_for("solve") >= 3);

    // Nothing stayed assigned to the lost worker.
    let tasks = h.scheduler.tasks(id).await.unwrap();
    assert!(tasks.iter().all(|t| t.assigned_to != Some(workers[0])));
    assert!(tasks.iter().all(|t| t.state == TaskState::Completed));
}

#[tokio::test]
async fn test_permanent_failure_fails_problem_and_cancels_siblings() {
    let h = harness();
    register_workers(&h.registry, 2).await;
    h.executor.always_fail("solve");
    let mut rx = h.events.subscribe();

    let id = h
        .scheduler
        .submit(optimization(Complexity::Low))
        .await
        .unwrap();
    let status = wait_terminal(&h.scheduler, id).await;

    assert_eq!(status.phase, ProblemPhase::Failed);
    let failure = status.failure.unwrap();
    assert!(failure.contains("failed permanently"), "got: {failure}");
    assert!(status.solution.is_none());

    // Three attempts per solver at most, and the aggregate never ran.
    assert!(h.executor.calls_for("solve") <= 6);
    assert!(h.executor.calls_for("solve") >= 3);
    assert_eq!(h.executor.calls_for("aggregate"), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut saw_failed = false;
    let mut saw_terminal_task_failure = false;
    while let Ok(ev) = rx.try_recv() {
        match ev {
            MeshEvent::ProblemFailed { problem, .. } if problem == id => saw_failed = true,
            MeshEvent::TaskFailed { terminal: true, .. } => saw_terminal_task_failure = true,
            _ => {}
        }
    }
    assert!(saw_failed);
    assert!(saw_terminal_task_failure);
}

#[tokio::test]
async fn test_disagreement_spawns_one_extra_round_then_low_confidence() {
    let h = harness();
    register_workers(&h.registry, 2).await;
    h.executor.distinct_solve_values.store(true, Ordering::SeqCst);

    let id = h
        .scheduler
        .submit(optimization(Complexity::Low))
        .await
        .unwrap();
    let status = wait_terminal(&h.scheduler, id).await;

    // Scattered candidates never agree, but a solution still ships.
    assert_eq!(status.phase, ProblemPhase::Solved);
    let solution = status.solution.unwrap();
    assert!(!solution.consensus.achieved);
    assert!(solution.consensus.score < 0.8);
    // 2 original solvers + 2 from the single extra round.
    assert_eq!(h.executor.calls_for("solve"), 4);
    assert_eq!(solution.consensus.votes.len(), 4);
    assert_eq!(status.total_tasks, 6);
}

#[tokio::test]
async fn test_submit_unknown_type_is_rejected() {
    let h = harness();
    let err = h
        .scheduler
        .submit(Problem::new("translation", json!({}), Complexity::Low))
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::NotFound(_)));
    assert_eq!(h.scheduler.problem_count().await, 0);
}

#[tokio::test]
async fn test_no_matching_worker_stalls_deterministically() {
    let h = harness_with(SchedulerConfig {
        stall_window_ms: 200,
        ..fast_config()
    });
    // No workers at all: nothing can ever be assigned.
    let id = h
        .scheduler
        .submit(optimization(Complexity::Low))
        .await
        .unwrap();
    let status = wait_terminal(&h.scheduler, id).await;

    assert_eq!(status.phase, ProblemPhase::Failed);
    assert!(status.failure.unwrap().contains("stalled"));
    assert_eq!(h.executor.calls_for("seed"), 0);
}

#[tokio::test]
async fn test_cancel_discards_in_flight_work() {
    let h = harness();
    register_workers(&h.registry, 4).await;
    h.executor.delay("solve", Duration::from_millis(400));

    let id = h
        .scheduler
        .submit(optimization(Complexity::Medium))
        .await
        .unwrap();

    // Mid-run status is well-formed.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let status = h.scheduler.get_status(id).await.unwrap();
    assert_eq!(status.phase, ProblemPhase::Running);
    assert!(status.percent_complete > 0.0);
    assert!(status.percent_complete < 1.0);

    h.scheduler.cancel(id).await.unwrap();
    let status = wait_terminal(&h.scheduler, id).await;
    assert_eq!(status.phase, ProblemPhase::Cancelled);
    assert!(status.solution.is_none());
    // The aggregate never ran: its dependencies' results were discarded.
    assert_eq!(h.executor.calls_for("aggregate"), 0);
}

#[tokio::test]
async fn test_many_problems_run_independently() {
    let h = harness();
    register_workers(&h.registry, 4).await;

    let a = h
        .scheduler
        .submit(optimization(Complexity::Low))
        .await
        .unwrap();
    let b = h
        .scheduler
        .submit(optimization(Complexity::Low))
        .await
        .unwrap();

    let status_a = wait_terminal(&h.scheduler, a).await;
    let status_b = wait_terminal(&h.scheduler, b).await;
    assert_eq!(status_a.phase, ProblemPhase::Solved);
    assert_eq!(status_b.phase, ProblemPhase::Solved);
    assert_eq!(h.scheduler.problem_count().await, 2);
}
