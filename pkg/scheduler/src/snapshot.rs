//! Immutable, point-in-time view of the cluster used for one evaluation pass.

use pkg_types::node::Node;
use pkg_types::pod::{Pod, ResourceRequirements};
use std::collections::HashMap;
use std::sync::Arc;

/// A node together with the pods placed on it.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node: Arc<Node>,
    pub pods: Vec<Arc<Pod>>,
    /// Sum of the resource requests of `pods`.
    pub requested: ResourceRequirements,
}

impl NodeInfo {
    fn new(node: Arc<Node>) -> Self {
        Self {
            node,
            pods: Vec::new(),
            requested: ResourceRequirements::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }
}

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    nodes: Vec<NodeInfo>,
    index: HashMap<String, usize>,
    generation: u64,
}

impl Snapshot {
    /// Build a snapshot. Nodes are ordered by name; pods that are not placed,
    /// or whose node is unknown, are left out.
    pub fn new(
        nodes: impl IntoIterator<Item = Arc<Node>>,
        pods: impl IntoIterator<Item = Arc<Pod>>,
        generation: u64,
    ) -> Self {
        let mut infos: Vec<NodeInfo> = nodes.into_iter().map(NodeInfo::new).collect();
        infos.sort_by(|a, b| a.node.name.cmp(&b.node.name));
        let index: HashMap<String, usize> = infos
            .iter()
            .enumerate()
            .map(|(i, info)| (info.node.name.clone(), i))
            .collect();

        for pod in pods {
            if !pod.is_placed() {
                continue;
            }
            let Some(&i) = pod.node_name.as_ref().and_then(|n| index.get(n)) else {
                continue;
            };
            let info = &mut infos[i];
            info.requested = info.requested.add(&pod.spec.resources);
            info.pods.push(pod);
        }

        Self {
            nodes: infos,
            index,
            generation,
        }
    }

    /// Convenience constructor from owned objects.
    pub fn from_objects(nodes: Vec<Node>, pods: Vec<Pod>) -> Self {
        Self::new(
            nodes.into_iter().map(Arc::new),
            pods.into_iter().map(Arc::new),
            0,
        )
    }

    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&NodeInfo> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Cache generation this snapshot was taken at.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Every placed pod with the node it runs on.
    pub fn placed_pods(&self) -> impl Iterator<Item = (&NodeInfo, &Arc<Pod>)> {
        self.nodes
            .iter()
            .flat_map(|info| info.pods.iter().map(move |pod| (info, pod)))
    }
}

/// Same pod identity, regardless of version.
pub(crate) fn is_same_pod(a: &Pod, b: &Pod) -> bool {
    a.namespace == b.namespace && a.name == b.name
}
