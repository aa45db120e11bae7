use anyhow::{Result, bail};
use pkg_constants::scheduler::MAX_PREFERRED_WEIGHT;

use crate::pod::{Pod, PodAffinity};

/// Validate a Kubernetes-style resource name.
/// Rules: lowercase `[a-z0-9-]`, max 63 chars, no leading/trailing hyphens.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("name must not be empty");
    }
    if name.len() > 63 {
        bail!("name '{}' exceeds 63 characters (got {})", name, name.len());
    }
    if name.starts_with('-') || name.ends_with('-') {
        bail!("name '{}' must not start or end with a hyphen", name);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        bail!(
            "name '{}' must contain only lowercase letters, digits, and hyphens [a-z0-9-]",
            name
        );
    }
    Ok(())
}

/// Admission check for a pod. Rejects malformed selectors, empty topology
/// keys, non-positive skews and out-of-range preference weights so that such
/// pods never reach the scheduler.
pub fn validate_pod(pod: &Pod) -> Result<()> {
    validate_name(&pod.name)?;
    validate_name(&pod.namespace)?;

    for (field, selector) in pod.label_selectors() {
        if let Err(e) = selector.validate() {
            bail!("pod {}: invalid selector at {}: {}", pod.key(), field, e);
        }
    }

    let affinity = &pod.spec.affinity;
    validate_pod_affinity(pod, "pod_affinity", &affinity.pod_affinity)?;
    validate_pod_affinity(pod, "pod_anti_affinity", &affinity.pod_anti_affinity)?;

    for (i, c) in pod.spec.topology_spread_constraints.iter().enumerate() {
        if c.max_skew == 0 {
            bail!(
                "pod {}: topology_spread_constraints[{}].max_skew must be positive",
                pod.key(),
                i
            );
        }
        if c.topology_key.is_empty() {
            bail!(
                "pod {}: topology_spread_constraints[{}].topology_key must not be empty",
                pod.key(),
                i
            );
        }
    }
    Ok(())
}

fn validate_pod_affinity(pod: &Pod, kind: &str, rules: &PodAffinity) -> Result<()> {
    for (i, term) in rules.required.iter().enumerate() {
        if term.topology_key.is_empty() {
            bail!(
                "pod {}: affinity.{}.required[{}].topology_key must not be empty",
                pod.key(),
                kind,
                i
            );
        }
    }
    for (i, weighted) in rules.preferred.iter().enumerate() {
        if weighted.term.topology_key.is_empty() {
            bail!(
                "pod {}: affinity.{}.preferred[{}].topology_key must not be empty",
                pod.key(),
                kind,
                i
            );
        }
        if !(1..=MAX_PREFERRED_WEIGHT).contains(&weighted.weight) {
            bail!(
                "pod {}: affinity.{}.preferred[{}].weight must be in 1..={} (got {})",
                pod.key(),
                kind,
                i,
                MAX_PREFERRED_WEIGHT,
                weighted.weight
            );
        }
    }
    Ok(())
}
