//! Label selector evaluation.

use pkg_types::pod::Pod;
use pkg_types::selector::{LabelSelector, LabelSelectorRequirement, SelectorError, SelectorOperator};
use std::collections::HashMap;

use crate::error::{SchedulerError, SchedulerResult};

/// Evaluate `selector` against `labels`. Malformed selectors are an error,
/// never a silent non-match.
pub fn matches(
    selector: &LabelSelector,
    labels: &HashMap<String, String>,
) -> Result<bool, SelectorError> {
    selector.validate()?;
    Ok(matches_validated(selector, labels))
}

/// Evaluate a selector that already passed validation.
pub(crate) fn matches_validated(
    selector: &LabelSelector,
    labels: &HashMap<String, String>,
) -> bool {
    selector
        .match_labels
        .iter()
        .all(|(k, v)| labels.get(k) == Some(v))
        && selector
            .match_expressions
            .iter()
            .all(|req| requirement_matches(req, labels))
}

fn requirement_matches(req: &LabelSelectorRequirement, labels: &HashMap<String, String>) -> bool {
    match req.operator {
        SelectorOperator::In => labels.get(&req.key).is_some_and(|v| req.values.contains(v)),
        SelectorOperator::NotIn => labels
            .get(&req.key)
            .is_none_or(|v| !req.values.contains(v)),
        SelectorOperator::Exists => labels.contains_key(&req.key),
        SelectorOperator::DoesNotExist => !labels.contains_key(&req.key),
    }
}

/// Admission check run before any node is evaluated for `pod`.
pub fn validate_pod_selectors(pod: &Pod) -> SchedulerResult<()> {
    for (field, selector) in pod.label_selectors() {
        selector
            .validate()
            .map_err(|source| SchedulerError::InvalidSelector {
                pod: pod.key(),
                field,
                source,
            })?;
    }
    Ok(())
}
