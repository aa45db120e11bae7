pub mod affinity;
pub mod binder;
pub mod cache;
pub mod error;
pub mod event;
pub mod filter;
pub mod framework;
pub mod preemption;
pub mod queue;
pub mod selector;
pub mod snapshot;
pub mod spread;

use pkg_types::pod::Pod;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

pub use error::{Diagnosis, FailureReason, RequeueAction, SchedulerError, SchedulerResult};
pub use framework::{Evaluation, FeasibleNode, Framework};
pub use snapshot::Snapshot;

/// Outcome of one successful scheduling decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleResult {
    pub node_name: String,
    pub feasible_nodes: usize,
    pub evaluated_nodes: usize,
}

/// Picks a node for a pod: the highest-scoring feasible node, with ties
/// rotated round-robin so equal nodes share the load.
pub struct Scheduler {
    framework: Framework,
    round_robin_index: AtomicUsize,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_framework(Framework::default())
    }

    pub fn with_parallelism(parallelism: usize) -> Self {
        Self::with_framework(Framework::new(parallelism))
    }

    pub fn with_framework(framework: Framework) -> Self {
        Self {
            framework,
            round_robin_index: AtomicUsize::new(0),
        }
    }

    pub fn framework(&self) -> &Framework {
        &self.framework
    }

    /// Schedule a pod against a snapshot. Does not bind.
    pub fn schedule(&self, pod: &Pod, snapshot: &Snapshot) -> SchedulerResult<ScheduleResult> {
        let feasible = self.framework.candidates(pod, snapshot)?;

        // Round-robin selection among the best-scoring nodes
        let best = feasible.iter().map(|n| n.score).max().unwrap_or(0);
        let top: Vec<&FeasibleNode> = feasible.iter().filter(|n| n.score == best).collect();
        let idx = self.round_robin_index.fetch_add(1, Ordering::Relaxed) % top.len();
        let selected = top[idx];

        info!(
            "Scheduled pod {}/{} → node {} ({}/{} feasible, score {})",
            pod.namespace,
            pod.name,
            selected.name,
            feasible.len(),
            snapshot.len(),
            selected.score
        );
        Ok(ScheduleResult {
            node_name: selected.name.clone(),
            feasible_nodes: feasible.len(),
            evaluated_nodes: snapshot.len(),
        })
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
