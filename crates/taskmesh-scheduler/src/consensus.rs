use crate::problem::Problem;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use taskmesh_core::{ConsensusConfig, ProblemId, WorkerId};

/// One candidate result contributed by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerVote {
    /// Worker that produced the candidate.
    pub worker: WorkerId,
    /// Sub-task name the candidate came from.
    pub task: String,
    /// The candidate value.
    pub value: Value,
}

/// How strongly the candidates agree, and which value represents them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusOutcome {
    /// Agreement ratio in `[0, 1]`.
    pub score: f64,
    /// Representative value of the best-agreeing cluster.
    pub chosen: Value,
}

/// Pluggable agreement metric.
///
/// The right metric is problem-specific (numeric closeness, majority vote,
/// weighted confidence, ...), so it is a registered policy rather than a
/// fixed algorithm.
pub trait ConsensusPolicy: Send + Sync {
    /// Score agreement across candidate values.
    fn agreement(&self, candidates: &[Value]) -> ConsensusOutcome;
}

/// Agreement = largest fraction of candidates whose numeric values lie
/// within `tolerance` of a common anchor; the chosen value is that
/// cluster's mean. Non-numeric candidates count against agreement.
pub struct NumericTolerance {
    tolerance: f64,
}

impl NumericTolerance {
    /// Create a policy with an absolute tolerance.
    pub fn new(tolerance: f64) -> Self {
        Self {
            tolerance: tolerance.abs(),
        }
    }
}

impl ConsensusPolicy for NumericTolerance {
    fn agreement(&self, candidates: &[Value]) -> ConsensusOutcome {
        let numbers: Vec<f64> = candidates.iter().filter_map(Value::as_f64).collect();
        if candidates.is_empty() || numbers.is_empty() {
            return ConsensusOutcome {
                score: 0.0,
                chosen: candidates.first().cloned().unwrap_or(Value::Null),
            };
        }

        let mut best_count = 0usize;
        let mut best_mean = numbers[0];
        for &anchor in &numbers {
            let members: Vec<f64> = numbers
                .iter()
                .copied()
                .filter(|n| (n - anchor).abs() <= self.tolerance)
                .collect();
            if members.len() > best_count {
                best_count = members.len();
                best_mean = members.iter().sum::<f64>() / members.len() as f64;
            }
        }

        ConsensusOutcome {
            score: best_count as f64 / candidates.len() as f64,
            chosen: json!(best_mean),
        }
    }
}

/// Agreement = fraction of candidates equal to the modal value (exact JSON
/// equality). Ties resolve to the value seen first.
pub struct MajorityVote;

impl ConsensusPolicy for MajorityVote {
    fn agreement(&self, candidates: &[Value]) -> ConsensusOutcome {
        if candidates.is_empty() {
            return ConsensusOutcome {
                score: 0.0,
                chosen: Value::Null,
            };
        }
        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut best_count = 0usize;
        let mut chosen = candidates[0].clone();
        for candidate in candidates {
            let key = candidate.to_string();
            let count = counts.entry(key).or_insert(0);
            *count += 1;
            if *count > best_count {
                best_count = *count;
                chosen = candidate.clone();
            }
        }
        ConsensusOutcome {
            score: best_count as f64 / candidates.len() as f64,
            chosen,
        }
    }
}

/// The consensus record attached to a solution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusRecord {
    /// Whether agreement met the configured threshold.
    pub achieved: bool,
    /// Observed agreement ratio.
    pub score: f64,
    /// Every contributing candidate.
    pub votes: Vec<WorkerVote>,
}

/// Wall time, compute time, and achieved parallelism of a solved problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    /// Submission-to-solution wall time.
    pub wall_ms: u64,
    /// Summed execution time across all completed sub-tasks.
    pub compute_ms: u64,
    /// Peak number of sub-tasks running concurrently.
    pub parallelism: usize,
}

/// Final output for a problem. Created once, immutable thereafter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    /// The solved problem.
    pub problem: ProblemId,
    /// Aggregated result.
    pub result: Value,
    /// Confidence in `[0, 1]`; the agreement score when candidates exist.
    pub confidence: f64,
    /// Agreement record across contributing workers.
    pub consensus: ConsensusRecord,
    /// Execution metadata.
    pub performance: PerformanceReport,
}

/// What the validator decided.
#[derive(Debug, Clone)]
pub enum Verdict {
    /// A solution was produced (possibly with `consensus.achieved = false`
    /// once the extra-round budget ran out).
    Accept(Solution),
    /// Agreement is below threshold and the budget allows another solver
    /// round.
    NeedsMoreCandidates {
        /// The insufficient agreement score.
        score: f64,
    },
}

/// Reconciles completed sub-task results into a single validated solution.
pub struct Validator {
    policies: HashMap<String, Arc<dyn ConsensusPolicy>>,
    default_policy: Arc<dyn ConsensusPolicy>,
    config: ConsensusConfig,
}

impl Validator {
    /// Create a validator with [`MajorityVote`] as the default policy.
    pub fn new(config: ConsensusConfig) -> Self {
        Self {
            policies: HashMap::new(),
            default_policy: Arc::new(MajorityVote),
            config,
        }
    }

    /// Register a policy for a problem type (builder style).
    pub fn with_policy(
        mut self,
        problem_type: impl Into<String>,
        policy: Arc<dyn ConsensusPolicy>,
    ) -> Self {
        self.policies.insert(problem_type.into(), policy);
        self
    }

    /// Replace the fallback policy.
    pub fn with_default_policy(mut self, policy: Arc<dyn ConsensusPolicy>) -> Self {
        self.default_policy = policy;
        self
    }

    /// Extra solver rounds the scheduler may spend on low agreement.
    pub fn max_extra_rounds(&self) -> u32 {
        self.config.max_extra_rounds
    }

    /// Produce a verdict for a finished problem.
    ///
    /// `final_result` is the output of the problem's sink task (e.g. the
    /// aggregate), preferred as the solution result when present; the
    /// consensus-chosen candidate is used otherwise. With no redundant
    /// candidates there is nothing to disagree about and the solution is
    /// accepted at full confidence.
    pub fn validate(
        &self,
        problem: &Problem,
        votes: Vec<WorkerVote>,
        final_result: Option<Value>,
        performance: PerformanceReport,
        rounds_left: u32,
    ) -> Verdict {
        if votes.is_empty() {
            return Verdict::Accept(Solution {
                problem: problem.id,
                result: final_result.unwrap_or(Value::Null),
                confidence: 1.0,
                consensus: ConsensusRecord {
                    achieved: true,
                    score: 1.0,
                    votes,
                },
                performance,
            });
        }

        let policy = self
            .policies
            .get(&problem.problem_type)
            .unwrap_or(&self.default_policy);
        let values: Vec<Value> = votes.iter().map(|v| v.value.clone()).collect();
        let outcome = policy.agreement(&values);
        let achieved = outcome.score >= self.config.threshold;

        if !achieved && rounds_left > 0 {
            return Verdict::NeedsMoreCandidates {
                score: outcome.score,
            };
        }

        Verdict::Accept(Solution {
            problem: problem.id,
            result: final_result.unwrap_or_else(|| outcome.chosen.clone()),
            confidence: outcome.score,
            consensus: ConsensusRecord {
                achieved,
                score: outcome.score,
                votes,
            },
            performance,
        })
    }
}
