use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::pod::{ResourceRequirements, TaintEffect};

// --- Node status ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum NodeStatus {
    #[default]
    Ready,
    NotReady,
    Unknown,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Ready => write!(f, "Ready"),
            NodeStatus::NotReady => write!(f, "NotReady"),
            NodeStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

// --- Taint ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub effect: TaintEffect,
}

// --- Persisted Node object ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: NodeStatus,
    /// Topology labels (zone, region, hostname, ...) live here.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
    #[serde(default)]
    pub capacity: ResourceRequirements,
    /// If true, the scheduler will not place new pods on this node.
    #[serde(default)]
    pub unschedulable: bool,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
}

impl Node {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            status: NodeStatus::Ready,
            labels: HashMap::new(),
            taints: vec![],
            capacity: ResourceRequirements::default(),
            unschedulable: false,
            created_at: Utc::now(),
        }
    }

    /// The node's domain value for `topology_key`, if it belongs to one.
    pub fn topology_value(&self, topology_key: &str) -> Option<&str> {
        self.labels.get(topology_key).map(String::as_str)
    }

    /// True if nothing a placement decision depends on differs.
    pub fn same_scheduling_inputs(&self, other: &Node) -> bool {
        self.name == other.name
            && self.status == other.status
            && self.labels == other.labels
            && self.taints == other.taints
            && self.capacity == other.capacity
            && self.unschedulable == other.unschedulable
    }
}
