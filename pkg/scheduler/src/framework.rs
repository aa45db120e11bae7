//! Placement decision aggregator: runs every filter for every node of a
//! snapshot and collects the feasible ones.

use pkg_constants::scheduler::{DEFAULT_PARALLELISM, MIN_NODES_FOR_PARALLEL_EVALUATION};
use pkg_types::pod::Pod;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::Arc;
use tracing::warn;

use crate::affinity::AffinityState;
use crate::error::{Diagnosis, FailureReason, SchedulerError, SchedulerResult};
use crate::filter::{check_node, untolerated_soft_taints};
use crate::selector::validate_pod_selectors;
use crate::snapshot::{NodeInfo, Snapshot};
use crate::spread::SpreadState;

/// A node that passed every hard check, with its advisory score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeasibleNode {
    pub name: String,
    pub score: i64,
}

/// Result of evaluating one pod against a whole snapshot.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    /// In snapshot (node name) order.
    pub feasible: Vec<FeasibleNode>,
    pub diagnosis: Diagnosis,
}

#[derive(Debug, Clone)]
pub struct Framework {
    parallelism: usize,
    /// Evaluation pool, absent when `parallelism` is 1.
    pool: Option<Arc<ThreadPool>>,
}

impl Framework {
    pub fn new(parallelism: usize) -> Self {
        let parallelism = parallelism.max(1);
        let pool = if parallelism > 1 {
            match build_pool(parallelism) {
                Ok(pool) => Some(Arc::new(pool)),
                Err(e) => {
                    warn!(
                        "Failed to build evaluation pool with {} threads, evaluating sequentially: {}",
                        parallelism, e
                    );
                    None
                }
            }
        } else {
            None
        };
        Self { parallelism, pool }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Evaluate `pod` against every node. Only a malformed selector on the
    /// pod itself is an error; an empty feasible set is not.
    pub fn evaluate(&self, pod: &Pod, snapshot: &Snapshot) -> SchedulerResult<Evaluation> {
        validate_pod_selectors(pod)?;

        let affinity = AffinityState::compute(pod, snapshot);
        let spread = SpreadState::compute(pod, snapshot);
        let eval = |info: &NodeInfo| evaluate_node(pod, info, &affinity, &spread);

        let nodes = snapshot.nodes();
        let outcomes: Vec<Result<i64, FailureReason>> = match self.pool {
            Some(ref pool) if nodes.len() >= MIN_NODES_FOR_PARALLEL_EVALUATION => {
                pool.install(|| nodes.par_iter().map(eval).collect())
            }
            _ => nodes.iter().map(eval).collect(),
        };

        let mut evaluation = Evaluation {
            diagnosis: Diagnosis {
                total_nodes: nodes.len(),
                ..Default::default()
            },
            ..Default::default()
        };
        for (info, outcome) in nodes.iter().zip(outcomes) {
            match outcome {
                Ok(score) => evaluation.feasible.push(FeasibleNode {
                    name: info.name().to_string(),
                    score,
                }),
                Err(reason) => evaluation.diagnosis.record(reason),
            }
        }
        Ok(evaluation)
    }

    /// Feasible nodes for `pod`, or `NoFeasibleNode` with the per-reason
    /// diagnosis when there are none.
    pub fn candidates(&self, pod: &Pod, snapshot: &Snapshot) -> SchedulerResult<Vec<FeasibleNode>> {
        let evaluation = self.evaluate(pod, snapshot)?;
        if evaluation.feasible.is_empty() {
            return Err(SchedulerError::NoFeasibleNode {
                pod: pod.key(),
                diagnosis: evaluation.diagnosis,
            });
        }
        Ok(evaluation.feasible)
    }
}

impl Default for Framework {
    fn default() -> Self {
        Self::new(DEFAULT_PARALLELISM)
    }
}

fn build_pool(threads: usize) -> Result<ThreadPool, rayon::ThreadPoolBuildError> {
    ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("kplace-eval-{}", i))
        .build()
}

fn evaluate_node(
    pod: &Pod,
    info: &NodeInfo,
    affinity: &AffinityState,
    spread: &SpreadState,
) -> Result<i64, FailureReason> {
    check_node(pod, info)?;
    affinity.check(&info.node)?;
    let spread_score = spread.check(&info.node)?;
    Ok(affinity.score(&info.node) + spread_score
        - untolerated_soft_taints(pod, &info.node) as i64)
}
