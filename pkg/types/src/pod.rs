use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::node::Taint;
use crate::selector::LabelSelector;

// --- Resource requirements ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ResourceRequirements {
    /// CPU in millicores (1000 = 1 core)
    #[serde(default)]
    pub cpu_millis: u64,
    /// Memory in bytes
    #[serde(default)]
    pub memory_bytes: u64,
}

impl ResourceRequirements {
    pub fn add(&self, other: &ResourceRequirements) -> ResourceRequirements {
        ResourceRequirements {
            cpu_millis: self.cpu_millis.saturating_add(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
        }
    }

    /// True if `self` fits in `capacity`. A zero capacity dimension is unlimited.
    pub fn fits_within(&self, capacity: &ResourceRequirements) -> bool {
        (capacity.cpu_millis == 0 || self.cpu_millis <= capacity.cpu_millis)
            && (capacity.memory_bytes == 0 || self.memory_bytes <= capacity.memory_bytes)
    }
}

// --- Pod status ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PodStatus {
    #[default]
    Pending,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodStatus {
    /// Terminal pods no longer occupy their node.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PodStatus::Succeeded | PodStatus::Failed)
    }
}

impl std::fmt::Display for PodStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PodStatus::Pending => write!(f, "Pending"),
            PodStatus::Scheduled => write!(f, "Scheduled"),
            PodStatus::Running => write!(f, "Running"),
            PodStatus::Succeeded => write!(f, "Succeeded"),
            PodStatus::Failed => write!(f, "Failed"),
            PodStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

// --- Tolerations ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Toleration {
    /// Empty key with `Exists` tolerates every taint.
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub operator: TolerationOperator,
    #[serde(default)]
    pub value: String,
    /// `None` tolerates every effect.
    #[serde(default)]
    pub effect: Option<TaintEffect>,
}

impl Toleration {
    pub fn tolerates(&self, taint: &Taint) -> bool {
        if let Some(effect) = self.effect
            && effect != taint.effect
        {
            return false;
        }
        match self.operator {
            TolerationOperator::Exists => self.key.is_empty() || self.key == taint.key,
            TolerationOperator::Equal => self.key == taint.key && self.value == taint.value,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum TolerationOperator {
    #[default]
    Equal,
    Exists,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
pub enum TaintEffect {
    #[default]
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

// --- Inter-pod affinity ---

/// Co-location rule: pods matching `label_selector` in `namespaces`, within the
/// domain named by `topology_key`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodAffinityTerm {
    #[serde(default)]
    pub label_selector: LabelSelector,
    pub topology_key: String,
    /// Empty means the namespace of the pod that owns the term.
    #[serde(default)]
    pub namespaces: Vec<String>,
}

impl PodAffinityTerm {
    pub fn new(label_selector: LabelSelector, topology_key: &str) -> Self {
        Self {
            label_selector,
            topology_key: topology_key.to_string(),
            namespaces: vec![],
        }
    }

    /// Whether pods in `namespace` are in scope for this term, owned by a pod
    /// living in `owner_namespace`.
    pub fn applies_to_namespace(&self, owner_namespace: &str, namespace: &str) -> bool {
        if self.namespaces.is_empty() {
            owner_namespace == namespace
        } else {
            self.namespaces.iter().any(|ns| ns == namespace)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WeightedPodAffinityTerm {
    /// 1..=100
    pub weight: i32,
    pub term: PodAffinityTerm,
}

/// Required and preferred terms. Used for both affinity and anti-affinity.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodAffinity {
    #[serde(default)]
    pub required: Vec<PodAffinityTerm>,
    #[serde(default)]
    pub preferred: Vec<WeightedPodAffinityTerm>,
}

impl PodAffinity {
    pub fn is_empty(&self) -> bool {
        self.required.is_empty() && self.preferred.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Affinity {
    /// Required node affinity, matched against node labels.
    #[serde(default)]
    pub node_affinity: Option<LabelSelector>,
    #[serde(default)]
    pub pod_affinity: PodAffinity,
    #[serde(default)]
    pub pod_anti_affinity: PodAffinity,
}

// --- Topology spread ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum WhenUnsatisfiable {
    /// Violations make the node infeasible.
    #[default]
    #[serde(alias = "DoNotSchedule")]
    Hard,
    /// Violations only lower the node's score.
    #[serde(alias = "ScheduleAnyway")]
    Soft,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopologySpreadConstraint {
    pub max_skew: u32,
    pub topology_key: String,
    #[serde(default)]
    pub when_unsatisfiable: WhenUnsatisfiable,
    #[serde(default)]
    pub label_selector: LabelSelector,
}

// --- Pod spec ---

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodSpec {
    /// Higher values preempt lower ones.
    #[serde(default)]
    pub priority: i32,
    /// Total resources requested by the pod's containers.
    #[serde(default)]
    pub resources: ResourceRequirements,
    /// Node labels that must all be present with these exact values.
    #[serde(default)]
    pub node_selector: HashMap<String, String>,
    #[serde(default)]
    pub affinity: Affinity,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    #[serde(default)]
    pub topology_spread_constraints: Vec<TopologySpreadConstraint>,
    #[serde(default)]
    pub termination_grace_period_seconds: Option<u64>,
}

// --- Pod ---

fn default_namespace() -> String {
    pkg_constants::labels::DEFAULT_NAMESPACE.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pod {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Labels for selector-based matching
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
    /// Human-readable reason for the current status (e.g. why it is unschedulable).
    #[serde(default)]
    pub status_message: Option<String>,
    /// The node this pod is bound to (set by the scheduler, final once set)
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
}

impl Pod {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            labels: HashMap::new(),
            spec: PodSpec::default(),
            status: PodStatus::Pending,
            status_message: None,
            node_name: None,
            created_at: Utc::now(),
        }
    }

    /// `namespace/name`, unique across the cluster.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn priority(&self) -> i32 {
        self.spec.priority
    }

    /// Bound to a node and still occupying it.
    pub fn is_placed(&self) -> bool {
        self.node_name.is_some() && !self.status.is_terminal()
    }

    /// Waiting for the scheduler.
    pub fn is_pending(&self) -> bool {
        self.node_name.is_none() && self.status == PodStatus::Pending
    }

    /// True if nothing the scheduler looks at differs between the two versions.
    /// Status-only writes compare equal.
    pub fn same_scheduling_inputs(&self, other: &Pod) -> bool {
        self.namespace == other.namespace
            && self.name == other.name
            && self.labels == other.labels
            && self.spec == other.spec
            && self.node_name == other.node_name
            && self.status.is_terminal() == other.status.is_terminal()
    }

    /// Every label selector carried by the pod, with the field path it lives at.
    pub fn label_selectors(&self) -> Vec<(String, &LabelSelector)> {
        let affinity = &self.spec.affinity;
        let mut selectors = Vec::new();
        if let Some(ref node_affinity) = affinity.node_affinity {
            selectors.push(("affinity.node_affinity".to_string(), node_affinity));
        }
        for (kind, rules) in [
            ("pod_affinity", &affinity.pod_affinity),
            ("pod_anti_affinity", &affinity.pod_anti_affinity),
        ] {
            for (i, term) in rules.required.iter().enumerate() {
                selectors.push((
                    format!("affinity.{}.required[{}]", kind, i),
                    &term.label_selector,
                ));
            }
            for (i, weighted) in rules.preferred.iter().enumerate() {
                selectors.push((
                    format!("affinity.{}.preferred[{}]", kind, i),
                    &weighted.term.label_selector,
                ));
            }
        }
        for (i, c) in self.spec.topology_spread_constraints.iter().enumerate() {
            selectors.push((
                format!("topology_spread_constraints[{}]", i),
                &c.label_selector,
            ));
        }
        selectors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taint(key: &str, value: &str, effect: TaintEffect) -> Taint {
        Taint {
            key: key.to_string(),
            value: value.to_string(),
            effect,
        }
    }

    #[test]
    fn toleration_matching() {
        let t = taint("dedicated", "gpu", TaintEffect::NoSchedule);

        let equal = Toleration {
            key: "dedicated".to_string(),
            operator: TolerationOperator::Equal,
            value: "gpu".to_string(),
            effect: None,
        };
        assert!(equal.tolerates(&t));

        let wrong_value = Toleration {
            value: "cpu".to_string(),
            ..equal.clone()
        };
        assert!(!wrong_value.tolerates(&t));

        let wrong_effect = Toleration {
            effect: Some(TaintEffect::NoExecute),
            ..equal.clone()
        };
        assert!(!wrong_effect.tolerates(&t));

        let wildcard = Toleration {
            key: String::new(),
            operator: TolerationOperator::Exists,
            value: String::new(),
            effect: None,
        };
        assert!(wildcard.tolerates(&t));
    }

    #[test]
    fn resources_fit_with_unlimited_dimensions() {
        let request = ResourceRequirements {
            cpu_millis: 500,
            memory_bytes: 1024,
        };
        let cpu_only = ResourceRequirements {
            cpu_millis: 1000,
            memory_bytes: 0,
        };
        assert!(request.fits_within(&cpu_only));
        assert!(!request.add(&request).add(&request).fits_within(&cpu_only));
        assert!(request.fits_within(&ResourceRequirements::default()));
    }

    #[test]
    fn status_only_changes_keep_scheduling_inputs() {
        let pod = Pod::new("default", "web");
        let mut updated = pod.clone();
        updated.status_message = Some("0/1 nodes are available".to_string());
        assert!(pod.same_scheduling_inputs(&updated));

        updated.labels.insert("app".to_string(), "web".to_string());
        assert!(!pod.same_scheduling_inputs(&updated));
    }

    #[test]
    fn pod_defaults_from_minimal_json() {
        let pod: Pod = serde_json::from_str(r#"{"name": "p"}"#).unwrap();
        assert_eq!(pod.namespace, "default");
        assert_eq!(pod.status, PodStatus::Pending);
        assert!(pod.is_pending());
        assert!(pod.label_selectors().is_empty());
    }

    #[test]
    fn label_selectors_name_their_field() {
        let mut pod = Pod::new("default", "p");
        pod.spec
            .affinity
            .pod_anti_affinity
            .required
            .push(PodAffinityTerm::new(LabelSelector::new().exists("a"), "zone"));
        pod.spec
            .topology_spread_constraints
            .push(TopologySpreadConstraint {
                max_skew: 1,
                topology_key: "zone".to_string(),
                when_unsatisfiable: WhenUnsatisfiable::Hard,
                label_selector: LabelSelector::new(),
            });
        let fields: Vec<String> = pod.label_selectors().into_iter().map(|(f, _)| f).collect();
        assert_eq!(
            fields,
            vec![
                "affinity.pod_anti_affinity.required[0]".to_string(),
                "topology_spread_constraints[0]".to_string(),
            ]
        );
    }

    #[test]
    fn when_unsatisfiable_accepts_kubernetes_names() {
        let hard: WhenUnsatisfiable = serde_yaml::from_str("DoNotSchedule").unwrap();
        let soft: WhenUnsatisfiable = serde_yaml::from_str("ScheduleAnyway").unwrap();
        assert_eq!(hard, WhenUnsatisfiable::Hard);
        assert_eq!(soft, WhenUnsatisfiable::Soft);
    }
}
