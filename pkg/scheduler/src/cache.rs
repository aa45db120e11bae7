//! In-memory cluster state fed by the watch stream; the source of snapshots.

use pkg_types::node::Node;
use pkg_types::pod::{Pod, PodStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::event::ClusterEvent;
use crate::snapshot::Snapshot;

#[derive(Default)]
pub struct ClusterCache {
    nodes: HashMap<String, Arc<Node>>,
    pods: HashMap<String, Arc<Pod>>,
    generation: u64,
    snapshot: Option<Arc<Snapshot>>,
}

impl ClusterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole cache contents, e.g. after a relist.
    pub fn replace_all(&mut self, nodes: Vec<Node>, pods: Vec<Pod>) {
        self.nodes = nodes
            .into_iter()
            .map(|n| (n.name.clone(), Arc::new(n)))
            .collect();
        self.pods = pods.into_iter().map(|p| (p.key(), Arc::new(p))).collect();
        self.touch();
    }

    pub fn upsert_node(&mut self, node: Node) -> ClusterEvent {
        let new = Arc::new(node);
        self.touch();
        match self.nodes.insert(new.name.clone(), new.clone()) {
            Some(old) => ClusterEvent::NodeUpdated { old, new },
            None => ClusterEvent::NodeAdded(new),
        }
    }

    pub fn remove_node(&mut self, name: &str) -> Option<ClusterEvent> {
        let old = self.nodes.remove(name)?;
        self.touch();
        Some(ClusterEvent::NodeDeleted(old))
    }

    pub fn upsert_pod(&mut self, pod: Pod) -> ClusterEvent {
        let new = Arc::new(pod);
        self.touch();
        match self.pods.insert(new.key(), new.clone()) {
            Some(old) => ClusterEvent::PodUpdated { old, new },
            None => ClusterEvent::PodAdded(new),
        }
    }

    pub fn remove_pod(&mut self, key: &str) -> Option<ClusterEvent> {
        let old = self.pods.remove(key)?;
        self.touch();
        Some(ClusterEvent::PodDeleted(old))
    }

    /// Record a successful bind before the store's watch event arrives, so the
    /// next cycle already counts the pod on its node.
    pub fn assume_pod(&mut self, pod: &Pod, node_name: &str) -> ClusterEvent {
        debug!("Assuming pod {} on node {}", pod.key(), node_name);
        let mut assumed = pod.clone();
        assumed.node_name = Some(node_name.to_string());
        assumed.status = PodStatus::Scheduled;
        assumed.status_message = None;
        self.upsert_pod(assumed)
    }

    pub fn node(&self, name: &str) -> Option<&Arc<Node>> {
        self.nodes.get(name)
    }

    pub fn pod(&self, key: &str) -> Option<&Arc<Pod>> {
        self.pods.get(key)
    }

    /// Pods still waiting for a node.
    pub fn pending_pods(&self) -> Vec<Arc<Pod>> {
        self.pods
            .values()
            .filter(|p| p.is_pending())
            .cloned()
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Snapshot of the current state. Reused until the next mutation.
    pub fn snapshot(&mut self) -> Arc<Snapshot> {
        if let Some(ref snapshot) = self.snapshot {
            return snapshot.clone();
        }
        let snapshot = Arc::new(Snapshot::new(
            self.nodes.values().cloned(),
            self.pods.values().cloned(),
            self.generation,
        ));
        self.snapshot = Some(snapshot.clone());
        snapshot
    }

    fn touch(&mut self) {
        self.generation += 1;
        self.snapshot = None;
    }
}
