//! Per-node eligibility filters that do not depend on other pods' placement:
//! readiness, cordon, node selector, node affinity, taints and resources.

use pkg_types::node::{Node, NodeStatus};
use pkg_types::pod::{Pod, TaintEffect};

use crate::error::FailureReason;
use crate::selector::matches_validated;
use crate::snapshot::NodeInfo;

/// Run every node-level filter. Returns the first failure.
pub fn check_node(pod: &Pod, info: &NodeInfo) -> Result<(), FailureReason> {
    let node = &info.node;

    // 1. Node must be Ready
    if node.status != NodeStatus::Ready {
        return Err(FailureReason::NodeNotReady);
    }

    // 2. Node must not be cordoned
    if node.unschedulable {
        return Err(FailureReason::NodeUnschedulable);
    }

    // 3. Node selector and required node affinity
    check_node_placement(pod, node)?;

    // 4. Taints & tolerations
    for taint in &node.taints {
        if taint.effect == TaintEffect::PreferNoSchedule {
            continue;
        }
        if !pod.spec.tolerations.iter().any(|t| t.tolerates(taint)) {
            return Err(FailureReason::UntoleratedTaint);
        }
    }

    // 5. Resource availability
    let needed = info.requested.add(&pod.spec.resources);
    if !needed.fits_within(&node.capacity) {
        return Err(FailureReason::InsufficientResources);
    }

    Ok(())
}

/// Node selector and required node affinity only. These also decide which
/// nodes take part in topology spread counting.
pub fn check_node_placement(pod: &Pod, node: &Node) -> Result<(), FailureReason> {
    for (key, value) in &pod.spec.node_selector {
        match node.labels.get(key) {
            Some(v) if v == value => {}
            _ => return Err(FailureReason::NodeSelectorMismatch),
        }
    }
    if let Some(ref node_affinity) = pod.spec.affinity.node_affinity
        && !matches_validated(node_affinity, &node.labels)
    {
        return Err(FailureReason::NodeAffinityMismatch);
    }
    Ok(())
}

/// Number of `PreferNoSchedule` taints on the node the pod does not tolerate.
pub fn untolerated_soft_taints(pod: &Pod, node: &Node) -> usize {
    node.taints
        .iter()
        .filter(|taint| taint.effect == TaintEffect::PreferNoSchedule)
        .filter(|taint| !pod.spec.tolerations.iter().any(|t| t.tolerates(taint)))
        .count()
}
