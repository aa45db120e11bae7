//! Cluster change notifications consumed by the scheduling queue.

use pkg_types::node::Node;
use pkg_types::pod::Pod;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum ClusterEvent {
    NodeAdded(Arc<Node>),
    NodeUpdated { old: Arc<Node>, new: Arc<Node> },
    NodeDeleted(Arc<Node>),
    PodAdded(Arc<Pod>),
    PodUpdated { old: Arc<Pod>, new: Arc<Pod> },
    PodDeleted(Arc<Pod>),
}

impl ClusterEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClusterEvent::NodeAdded(_) => "NodeAdd",
            ClusterEvent::NodeUpdated { .. } => "NodeUpdate",
            ClusterEvent::NodeDeleted(_) => "NodeDelete",
            ClusterEvent::PodAdded(_) => "PodAdd",
            ClusterEvent::PodUpdated { .. } => "PodUpdate",
            ClusterEvent::PodDeleted(_) => "PodDelete",
        }
    }

    /// Whether the event could make some unschedulable pod placeable.
    ///
    /// Deliberately coarse: any node addition or removal, any change to a
    /// node's labels, taints, readiness or capacity, any pod deletion and any
    /// pod change the scheduler can observe. Status-only writes are not.
    ///
    /// Removing a node takes its pods out of every domain count, which can
    /// lift an anti-affinity or spread restriction elsewhere in the domain.
    pub fn is_wake_up(&self) -> bool {
        match self {
            ClusterEvent::NodeAdded(_) => true,
            ClusterEvent::NodeUpdated { old, new } => !old.same_scheduling_inputs(new),
            ClusterEvent::NodeDeleted(_) => true,
            ClusterEvent::PodAdded(pod) => pod.is_placed(),
            ClusterEvent::PodUpdated { old, new } => !old.same_scheduling_inputs(new),
            ClusterEvent::PodDeleted(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::node::Taint;
    use pkg_types::pod::TaintEffect;

    #[test]
    fn taint_removal_wakes_up() {
        let mut tainted = Node::new("node-tainted");
        tainted.taints.push(Taint {
            key: "test".to_string(),
            value: "test".to_string(),
            effect: TaintEffect::NoSchedule,
        });
        let event = ClusterEvent::NodeUpdated {
            old: Arc::new(tainted),
            new: Arc::new(Node::new("node-tainted")),
        };
        assert!(event.is_wake_up());
    }

    #[test]
    fn status_only_pod_update_does_not_wake_up() {
        let pod = Pod::new("default", "p");
        let mut with_message = pod.clone();
        with_message.status_message = Some("0/0 nodes are available.".to_string());
        let event = ClusterEvent::PodUpdated {
            old: Arc::new(pod),
            new: Arc::new(with_message),
        };
        assert!(!event.is_wake_up());
        assert!(ClusterEvent::NodeAdded(Arc::new(Node::new("n"))).is_wake_up());
        assert!(ClusterEvent::NodeDeleted(Arc::new(Node::new("n"))).is_wake_up());
        assert!(!ClusterEvent::PodAdded(Arc::new(Pod::new("default", "q"))).is_wake_up());
    }
}
