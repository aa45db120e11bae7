//! Inter-pod affinity and anti-affinity.
//!
//! Everything is derived from the snapshot in one pass over the placed pods
//! ([`AffinityState::compute`]); per-node checks are then lookups. The
//! symmetric rule (anti-affinity declared by a placed pod binding newcomers)
//! is part of the same pass, so no pod holds references to another.

use pkg_types::node::Node;
use pkg_types::pod::{Pod, PodAffinityTerm};
use std::collections::{HashMap, HashSet};
use tracing::warn;

use crate::error::FailureReason;
use crate::selector::{matches, matches_validated};
use crate::snapshot::{Snapshot, is_same_pod};

/// Does `term`, owned by a pod in `owner_namespace`, select `candidate`?
fn term_selects(term: &PodAffinityTerm, owner_namespace: &str, candidate: &Pod) -> bool {
    term.applies_to_namespace(owner_namespace, &candidate.namespace)
        && matches_validated(&term.label_selector, &candidate.labels)
}

/// Domains (values of one topology key) that hold at least one pod matched by a term.
#[derive(Debug, Default)]
struct TermDomains {
    topology_key: String,
    counts: HashMap<String, i64>,
}

impl TermDomains {
    fn new(term: &PodAffinityTerm) -> Self {
        Self {
            topology_key: term.topology_key.clone(),
            counts: HashMap::new(),
        }
    }

    fn record(&mut self, node: &Node) {
        if let Some(value) = node.topology_value(&self.topology_key) {
            *self.counts.entry(value.to_string()).or_insert(0) += 1;
        }
    }

    fn count_for(&self, node: &Node) -> i64 {
        node.topology_value(&self.topology_key)
            .and_then(|v| self.counts.get(v))
            .copied()
            .unwrap_or(0)
    }
}

/// The snapshot, seen from one candidate pod.
#[derive(Debug, Default)]
pub struct AffinityState {
    /// One entry per required affinity term, in order.
    affinity: Vec<TermDomains>,
    /// One entry per required anti-affinity term, in order.
    anti_affinity: Vec<TermDomains>,
    /// topology key -> domain values where a placed pod's required
    /// anti-affinity term selects the candidate.
    existing_anti_affinity: HashMap<String, HashSet<String>>,
    /// (weight, domains) for preferred affinity (+) and anti-affinity (-).
    preferred: Vec<(i64, TermDomains)>,
}

impl AffinityState {
    /// Precompute every domain set the candidate's checks need.
    /// The candidate's selectors must already be validated.
    pub fn compute(pod: &Pod, snapshot: &Snapshot) -> Self {
        let rules = &pod.spec.affinity;
        let mut state = AffinityState {
            affinity: rules.pod_affinity.required.iter().map(TermDomains::new).collect(),
            anti_affinity: rules
                .pod_anti_affinity
                .required
                .iter()
                .map(TermDomains::new)
                .collect(),
            existing_anti_affinity: HashMap::new(),
            preferred: rules
                .pod_affinity
                .preferred
                .iter()
                .map(|w| (w.weight as i64, TermDomains::new(&w.term)))
                .chain(
                    rules
                        .pod_anti_affinity
                        .preferred
                        .iter()
                        .map(|w| (-(w.weight as i64), TermDomains::new(&w.term))),
                )
                .collect(),
        };
        let preferred_terms: Vec<&PodAffinityTerm> = rules
            .pod_affinity
            .preferred
            .iter()
            .chain(rules.pod_anti_affinity.preferred.iter())
            .map(|w| &w.term)
            .collect();

        for (info, existing) in snapshot.placed_pods() {
            if is_same_pod(existing, pod) {
                continue;
            }
            let node = &info.node;

            for (term, domains) in rules.pod_affinity.required.iter().zip(&mut state.affinity) {
                if term_selects(term, &pod.namespace, existing) {
                    domains.record(node);
                }
            }
            for (term, domains) in rules
                .pod_anti_affinity
                .required
                .iter()
                .zip(&mut state.anti_affinity)
            {
                if term_selects(term, &pod.namespace, existing) {
                    domains.record(node);
                }
            }
            for (term, (_, domains)) in preferred_terms.iter().zip(&mut state.preferred) {
                if term_selects(term, &pod.namespace, existing) {
                    domains.record(node);
                }
            }

            // Symmetry: the placed pod's own anti-affinity, applied to the candidate.
            for term in &existing.spec.affinity.pod_anti_affinity.required {
                if !term.applies_to_namespace(&existing.namespace, &pod.namespace) {
                    continue;
                }
                match matches(&term.label_selector, &pod.labels) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(
                            "Ignoring anti-affinity term of placed pod {}: {}",
                            existing.key(),
                            e
                        );
                        continue;
                    }
                }
                if let Some(value) = node.topology_value(&term.topology_key) {
                    state
                        .existing_anti_affinity
                        .entry(term.topology_key.clone())
                        .or_default()
                        .insert(value.to_string());
                }
            }
        }
        state
    }

    /// Hard check for one node: existing pods' anti-affinity, then the
    /// candidate's affinity, then its anti-affinity.
    pub fn check(&self, node: &Node) -> Result<(), FailureReason> {
        for (key, values) in &self.existing_anti_affinity {
            if node.topology_value(key).is_some_and(|v| values.contains(v)) {
                return Err(FailureReason::ExistingAntiAffinityConflict);
            }
        }

        // A node without the topology key is in no domain, so an affinity
        // term can never be satisfied there.
        for domains in &self.affinity {
            if domains.count_for(node) == 0 {
                return Err(FailureReason::PodAffinityMismatch);
            }
        }

        for domains in &self.anti_affinity {
            if domains.count_for(node) > 0 {
                return Err(FailureReason::PodAntiAffinityConflict);
            }
        }
        Ok(())
    }

    /// Advisory score from preferred terms: weight times matching pods in the
    /// node's domain, negative for anti-affinity.
    pub fn score(&self, node: &Node) -> i64 {
        self.preferred
            .iter()
            .map(|(weight, domains)| weight * domains.count_for(node))
            .sum()
    }
}

/// Whether `pod` may be placed on `node` as far as inter-pod affinity is concerned.
pub fn feasible(pod: &Pod, node: &Node, snapshot: &Snapshot) -> bool {
    AffinityState::compute(pod, snapshot).check(node).is_ok()
}
