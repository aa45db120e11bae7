//! Scheduler error types and per-node failure diagnosis.

use pkg_types::selector::SelectorError;
use std::collections::BTreeMap;
use thiserror::Error;

/// Why a single node was rejected for a pod. Each rejected node reports the
/// first check it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FailureReason {
    NodeNotReady,
    NodeUnschedulable,
    NodeSelectorMismatch,
    NodeAffinityMismatch,
    UntoleratedTaint,
    InsufficientResources,
    ExistingAntiAffinityConflict,
    PodAffinityMismatch,
    PodAntiAffinityConflict,
    SpreadMissingTopologyKey,
    SpreadConstraintMismatch,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            FailureReason::NodeNotReady => "node(s) were not ready",
            FailureReason::NodeUnschedulable => "node(s) were unschedulable",
            FailureReason::NodeSelectorMismatch => "node(s) didn't match node selector",
            FailureReason::NodeAffinityMismatch => "node(s) didn't match node affinity",
            FailureReason::UntoleratedTaint => "node(s) had untolerated taints",
            FailureReason::InsufficientResources => "node(s) had insufficient resources",
            FailureReason::ExistingAntiAffinityConflict => {
                "node(s) didn't satisfy existing pods anti-affinity rules"
            }
            FailureReason::PodAffinityMismatch => "node(s) didn't match pod affinity rules",
            FailureReason::PodAntiAffinityConflict => {
                "node(s) didn't match pod anti-affinity rules"
            }
            FailureReason::SpreadMissingTopologyKey => {
                "node(s) didn't match pod topology spread constraints (missing required label)"
            }
            FailureReason::SpreadConstraintMismatch => {
                "node(s) didn't match pod topology spread constraints"
            }
        };
        write!(f, "{}", text)
    }
}

/// Per-reason count of rejected nodes for one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnosis {
    pub total_nodes: usize,
    pub reasons: BTreeMap<FailureReason, usize>,
}

impl Diagnosis {
    pub fn record(&mut self, reason: FailureReason) {
        *self.reasons.entry(reason).or_insert(0) += 1;
    }

    pub fn count(&self, reason: FailureReason) -> usize {
        self.reasons.get(&reason).copied().unwrap_or(0)
    }
}

impl std::fmt::Display for Diagnosis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0/{} nodes are available", self.total_nodes)?;
        let mut first = true;
        for (reason, count) in &self.reasons {
            let sep = if first { ": " } else { ", " };
            write!(f, "{}{} {}", sep, count, reason)?;
            first = false;
        }
        write!(f, ".")
    }
}

/// What the scheduling queue should do with a pod after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueAction {
    /// The decision is moot (pod deleted or bound elsewhere).
    Discard,
    /// The pod can never be placed as written; drop it until it changes.
    Reject,
    /// Park until a cluster event.
    Unschedulable,
    /// Re-evaluate right away.
    Immediate,
    /// Retry after an exponential backoff.
    Backoff,
}

/// Errors that can occur while scheduling a pod.
/// Only `InvalidSelector` is permanent; everything else leaves the pod pending.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("pod {pod}: invalid selector at {field}: {source}")]
    InvalidSelector {
        pod: String,
        field: String,
        #[source]
        source: SelectorError,
    },

    #[error("pod {pod} is unschedulable: {diagnosis}")]
    NoFeasibleNode { pod: String, diagnosis: Diagnosis },

    #[error("bind conflict for pod {pod} on node {node}: {reason}")]
    BindConflict {
        pod: String,
        node: String,
        reason: String,
    },

    #[error("stale snapshot for pod {pod} on node {node}: {reason}")]
    SnapshotStale {
        pod: String,
        node: String,
        reason: String,
    },

    #[error("pod {0} no longer exists")]
    PodNotFound(String),

    #[error("pod {pod} is already bound to node {node}")]
    AlreadyBound { pod: String, node: String },

    #[error("state store error: {0}")]
    Store(#[from] anyhow::Error),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn requeue_action(&self) -> RequeueAction {
        match self {
            SchedulerError::InvalidSelector { .. } => RequeueAction::Reject,
            SchedulerError::NoFeasibleNode { .. } => RequeueAction::Unschedulable,
            SchedulerError::BindConflict { .. } | SchedulerError::SnapshotStale { .. } => {
                RequeueAction::Immediate
            }
            SchedulerError::PodNotFound(_) | SchedulerError::AlreadyBound { .. } => {
                RequeueAction::Discard
            }
            SchedulerError::Store(_) => RequeueAction::Backoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::selector::SelectorOperator;

    #[test]
    fn diagnosis_message() {
        let mut diagnosis = Diagnosis {
            total_nodes: 4,
            ..Default::default()
        };
        diagnosis.record(FailureReason::SpreadConstraintMismatch);
        diagnosis.record(FailureReason::SpreadConstraintMismatch);
        diagnosis.record(FailureReason::NodeAffinityMismatch);
        assert_eq!(
            diagnosis.to_string(),
            "0/4 nodes are available: 1 node(s) didn't match node affinity, \
             2 node(s) didn't match pod topology spread constraints."
        );
        assert_eq!(Diagnosis::default().to_string(), "0/0 nodes are available.");
    }

    #[test]
    fn only_invalid_selectors_are_permanent() {
        let invalid = SchedulerError::InvalidSelector {
            pod: "default/p".to_string(),
            field: "affinity.pod_affinity.required[0]".to_string(),
            source: SelectorError::UnexpectedValues {
                key: "foo".to_string(),
                operator: SelectorOperator::Exists,
            },
        };
        assert_eq!(invalid.requeue_action(), RequeueAction::Reject);
        assert!(invalid.to_string().contains("must not carry values"));

        let conflict = SchedulerError::BindConflict {
            pod: "default/p".to_string(),
            node: "node-1".to_string(),
            reason: "insufficient cpu".to_string(),
        };
        assert_eq!(conflict.requeue_action(), RequeueAction::Immediate);
        assert_eq!(
            SchedulerError::PodNotFound("default/p".to_string()).requeue_action(),
            RequeueAction::Discard
        );
        assert_eq!(
            SchedulerError::from(anyhow::anyhow!("disk full")).requeue_action(),
            RequeueAction::Backoff
        );
    }
}
