//! Topology spread constraints.
//!
//! Per constraint, matching placed pods in the candidate's namespace are
//! counted per domain over the nodes the candidate could land on at all
//! (node selector and node affinity). A node is acceptable when placing the candidate there keeps
//! `count + 1 - min` within `max_skew`.

use pkg_types::node::Node;
use pkg_types::pod::{Pod, TopologySpreadConstraint, WhenUnsatisfiable};
use std::collections::HashMap;

use crate::error::FailureReason;
use crate::filter::check_node_placement;
use crate::selector::matches_validated;
use crate::snapshot::{Snapshot, is_same_pod};

/// Outcome for one node: hard constraints first, then the advisory penalty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpreadVerdict {
    pub hard_ok: bool,
    /// Zero or negative; the total skew excess over soft constraints.
    pub soft_score: i64,
}

#[derive(Debug)]
struct ConstraintCounts {
    max_skew: i64,
    topology_key: String,
    hard: bool,
    counts: HashMap<String, i64>,
    min: i64,
}

impl ConstraintCounts {
    fn compute(pod: &Pod, constraint: &TopologySpreadConstraint, snapshot: &Snapshot) -> Self {
        let mut counts: HashMap<String, i64> = HashMap::new();
        for info in snapshot.nodes() {
            if check_node_placement(pod, &info.node).is_err() {
                continue;
            }
            let Some(domain) = info.node.topology_value(&constraint.topology_key) else {
                continue;
            };
            let matching = info
                .pods
                .iter()
                .filter(|p| p.namespace == pod.namespace && !is_same_pod(p, pod))
                .filter(|p| matches_validated(&constraint.label_selector, &p.labels))
                .count() as i64;
            *counts.entry(domain.to_string()).or_insert(0) += matching;
        }
        let min = counts.values().copied().min().unwrap_or(0);
        Self {
            max_skew: constraint.max_skew as i64,
            topology_key: constraint.topology_key.clone(),
            hard: constraint.when_unsatisfiable == WhenUnsatisfiable::Hard,
            counts,
            min,
        }
    }

    /// How far placing on `node` would exceed `max_skew`; `None` if the node
    /// has no value for the topology key.
    fn excess(&self, node: &Node) -> Option<i64> {
        let domain = node.topology_value(&self.topology_key)?;
        let projected = self.counts.get(domain).copied().unwrap_or(0) + 1;
        Some((projected - self.min - self.max_skew).max(0))
    }
}

/// Per-domain counts for every spread constraint of one candidate.
#[derive(Debug, Default)]
pub struct SpreadState {
    constraints: Vec<ConstraintCounts>,
}

impl SpreadState {
    /// The candidate's selectors must already be validated.
    pub fn compute(pod: &Pod, snapshot: &Snapshot) -> Self {
        Self {
            constraints: pod
                .spec
                .topology_spread_constraints
                .iter()
                .map(|c| ConstraintCounts::compute(pod, c, snapshot))
                .collect(),
        }
    }

    /// Hard constraints are ANDed in order. On success returns the soft score.
    pub fn check(&self, node: &Node) -> Result<i64, FailureReason> {
        let mut penalty = 0;
        for c in &self.constraints {
            match (c.excess(node), c.hard) {
                (None, true) => return Err(FailureReason::SpreadMissingTopologyKey),
                (Some(excess), true) if excess > 0 => {
                    return Err(FailureReason::SpreadConstraintMismatch);
                }
                (Some(excess), false) => penalty += excess,
                _ => {}
            }
        }
        Ok(-penalty)
    }

    pub fn evaluate(&self, node: &Node) -> SpreadVerdict {
        match self.check(node) {
            Ok(soft_score) => SpreadVerdict {
                hard_ok: true,
                soft_score,
            },
            Err(_) => SpreadVerdict {
                hard_ok: false,
                soft_score: 0,
            },
        }
    }
}

/// Spread verdict for placing `pod` on `node`.
pub fn feasible(pod: &Pod, node: &Node, snapshot: &Snapshot) -> SpreadVerdict {
    SpreadState::compute(pod, snapshot).evaluate(node)
}
