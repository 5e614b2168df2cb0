use crate::problem::{Complexity, Problem};
use crate::task::SubTask;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use taskmesh_core::{MeshError, MeshResult, TaskId};

/// Turns a [`Problem`] into a set of sub-tasks with explicit dependency
/// edges. Pure: the engine never interprets problem semantics itself.
pub trait DecompositionStrategy: Send + Sync {
    /// Decompose `problem` into sub-tasks.
    fn decompose(&self, problem: &Problem) -> MeshResult<Vec<SubTask>>;
}

/// Registered decomposition strategies keyed by problem type, so new types
/// are added without touching the scheduler.
#[derive(Default)]
pub struct StrategyMap {
    strategies: HashMap<String, Arc<dyn DecompositionStrategy>>,
}

impl StrategyMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a strategy for a problem type (builder style).
    pub fn with(
        mut self,
        problem_type: impl Into<String>,
        strategy: Arc<dyn DecompositionStrategy>,
    ) -> Self {
        self.strategies.insert(problem_type.into(), strategy);
        self
    }

    /// Look up the strategy for a problem type.
    pub fn get(&self, problem_type: &str) -> Option<Arc<dyn DecompositionStrategy>> {
        self.strategies.get(problem_type).cloned()
    }

    /// Registered problem types.
    pub fn problem_types(&self) -> Vec<&str> {
        self.strategies.keys().map(String::as_str).collect()
    }
}

/// Seed → N parallel solvers → one aggregate.
///
/// The solvers are redundant consensus candidates; their count scales with
/// the problem's complexity hint.
pub struct FanOutStrategy {
    seed_capability: String,
    solver_capability: String,
    aggregate_capability: String,
}

impl FanOutStrategy {
    /// Create a strategy with the three capability tags it schedules on.
    pub fn new(
        seed_capability: impl Into<String>,
        solver_capability: impl Into<String>,
        aggregate_capability: impl Into<String>,
    ) -> Self {
        Self {
            seed_capability: seed_capability.into(),
            solver_capability: solver_capability.into(),
            aggregate_capability: aggregate_capability.into(),
        }
    }

    fn solver_count(complexity: Complexity) -> usize {
        match complexity {
            Complexity::Low => 2,
            Complexity::Medium => 4,
            Complexity::High => 8,
        }
    }
}

impl DecompositionStrategy for FanOutStrategy {
    fn decompose(&self, problem: &Problem) -> MeshResult<Vec<SubTask>> {
        let seed = SubTask::new(problem.id, "seed", &self.seed_capability);
        let seed_id = seed.id;
        let mut tasks = vec![seed];

        let mut solver_ids = BTreeSet::new();
        for i in 0..Self::solver_count(problem.complexity) {
            let solver = SubTask::new(problem.id, format!("solve-{i}"), &self.solver_capability)
                .with_action("solve")
                .depends_on([seed_id])
                .as_candidate();
            solver_ids.insert(solver.id);
            tasks.push(solver);
        }

        let aggregate = SubTask::new(problem.id, "aggregate", &self.aggregate_capability)
            .depends_on(solver_ids);
        tasks.push(aggregate);
        Ok(tasks)
    }
}

/// Reject graphs with unknown dependency ids or cycles before any task is
/// offered to a worker.
pub fn validate_graph(tasks: &[SubTask]) -> MeshResult<()> {
    let ids: BTreeSet<TaskId> = tasks.iter().map(|t| t.id).collect();
    for task in tasks {
        for dep in &task.dependencies {
            if !ids.contains(dep) {
                return Err(MeshError::InvalidDefinition(format!(
                    "task '{}' depends on unknown task {dep}",
                    task.name
                )));
            }
        }
    }

    let by_id: HashMap<TaskId, &SubTask> = tasks.iter().map(|t| (t.id, t)).collect();
    let mut visited: HashMap<TaskId, u8> = HashMap::new();
    for &id in by_id.keys() {
        if dfs_cycle(id, &by_id, &mut visited) {
            return Err(MeshError::Cycle);
        }
    }
    Ok(())
}

fn dfs_cycle(
    id: TaskId,
    tasks: &HashMap<TaskId, &SubTask>,
    visited: &mut HashMap<TaskId, u8>,
) -> bool {
    match visited.get(&id) {
        Some(1) => return true,  // back edge
        Some(2) => return false, // already processed
        _ => {}
    }
    visited.insert(id, 1);
    if let Some(task) = tasks.get(&id) {
        for dep in &task.dependencies {
            if dfs_cycle(*dep, tasks, visited) {
                return true;
            }
        }
    }
    visited.insert(id, 2);
    false
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::task::TaskState;
    use serde_json::json;
    use taskmesh_core::ProblemId;

    fn problem(complexity: Complexity) -> Problem {
        Problem::new("optimization", json!({"target": "min"}), complexity)
    }

    #[test]
    fn test_fan_out_shape_medium() {
        let strategy = FanOutStrategy::new("seed", "solve", "aggregate");
        let tasks = strategy.decompose(&problem(Complexity::Medium)).unwrap();
        // 1 seed + 4 solvers + 1 aggregate.
        assert_eq!(tasks.len(), 6);

        let seed = &tasks[0];
        assert!(seed.dependencies.is_empty());
        assert_eq!(seed.state, TaskState::Pending);

        let solvers: Vec<&SubTask> = tasks.iter().filter(|t| t.candidate).collect();
        assert_eq!(solvers.len(), 4);
        for solver in &solvers {
            assert_eq!(solver.dependencies, BTreeSet::from([seed.id]));
            assert_eq!(solver.action, "solve");
        }

        let aggregate = tasks.last().unwrap();
        assert_eq!(aggregate.name, "aggregate");
        assert_eq!(aggregate.dependencies.len(), 4);
        assert!(!aggregate.candidate);
    }

    #[test]
    fn test_fan_out_scales_with_complexity() {
        let strategy = FanOutStrategy::new("seed", "solve", "aggregate");
        assert_eq!(strategy.decompose(&problem(Complexity::Low)).unwrap().len(), 4);
        assert_eq!(strategy.decompose(&problem(Complexity::High)).unwrap().len(), 10);
    }

    #[test]
    fn test_strategy_map_lookup() {
        let map = StrategyMap::new().with(
            "optimization",
            Arc::new(FanOutStrategy::new("seed", "solve", "aggregate")),
        );
        assert!(map.get("optimization").is_some());
        assert!(map.get("translation").is_none());
        assert_eq!(map.problem_types(), vec!["optimization"]);
    }

    #[test]
    fn test_validate_graph_accepts_dag() {
        let strategy = FanOutStrategy::new("seed", "solve", "aggregate");
        let tasks = strategy.decompose(&problem(Complexity::Medium)).unwrap();
        assert!(validate_graph(&tasks).is_ok());
    }

    #[test]
    fn test_validate_graph_rejects_unknown_dependency() {
        let pid = ProblemId::new();
        let task = SubTask::new(pid, "lonely", "cap").depends_on([TaskId::new()]);
        let err = validate_graph(&[task]).unwrap_err();
        assert!(matches!(err, MeshError::InvalidDefinition(_)));
    }

    #[test]
    fn test_validate_graph_rejects_cycle() {
        let pid = ProblemId::new();
        let mut a = SubTask::new(pid, "a", "cap");
        let mut b = SubTask::new(pid, "b", "cap");
        a.dependencies.insert(b.id);
        b.dependencies.insert(a.id);
        let err = validate_graph(&[a, b]).unwrap_err();
        assert!(matches!(err, MeshError::Cycle));
    }
}
