use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

// --- Selector operator ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl std::fmt::Display for SelectorOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectorOperator::In => write!(f, "In"),
            SelectorOperator::NotIn => write!(f, "NotIn"),
            SelectorOperator::Exists => write!(f, "Exists"),
            SelectorOperator::DoesNotExist => write!(f, "DoesNotExist"),
        }
    }
}

// --- Selector errors ---

/// A structurally invalid selector. Raised at admission; never a silent non-match.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    #[error("label selector requirement has an empty key")]
    EmptyKey,

    #[error("operator {operator} on key '{key}' must not carry values")]
    UnexpectedValues {
        key: String,
        operator: SelectorOperator,
    },

    #[error("operator {operator} on key '{key}' requires at least one value")]
    MissingValues {
        key: String,
        operator: SelectorOperator,
    },
}

// --- Match expression ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl LabelSelectorRequirement {
    pub fn validate(&self) -> Result<(), SelectorError> {
        if self.key.is_empty() {
            return Err(SelectorError::EmptyKey);
        }
        match self.operator {
            SelectorOperator::In | SelectorOperator::NotIn if self.values.is_empty() => {
                Err(SelectorError::MissingValues {
                    key: self.key.clone(),
                    operator: self.operator,
                })
            }
            SelectorOperator::Exists | SelectorOperator::DoesNotExist
                if !self.values.is_empty() =>
            {
                Err(SelectorError::UnexpectedValues {
                    key: self.key.clone(),
                    operator: self.operator,
                })
            }
            _ => Ok(()),
        }
    }
}

// --- Label selector ---

/// Label query over a label set. `match_labels` and every expression are ANDed;
/// an empty selector matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    /// Check every requirement for impossible operator/value combinations.
    pub fn validate(&self) -> Result<(), SelectorError> {
        if self.match_labels.keys().any(|k| k.is_empty()) {
            return Err(SelectorError::EmptyKey);
        }
        for expr in &self.match_expressions {
            expr.validate()?;
        }
        Ok(())
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.match_labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn expression(mut self, key: &str, operator: SelectorOperator, values: &[&str]) -> Self {
        self.match_expressions.push(LabelSelectorRequirement {
            key: key.to_string(),
            operator,
            values: values.iter().map(|v| v.to_string()).collect(),
        });
        self
    }

    pub fn in_values(self, key: &str, values: &[&str]) -> Self {
        self.expression(key, SelectorOperator::In, values)
    }

    pub fn not_in(self, key: &str, values: &[&str]) -> Self {
        self.expression(key, SelectorOperator::NotIn, values)
    }

    pub fn exists(self, key: &str) -> Self {
        self.expression(key, SelectorOperator::Exists, &[])
    }

    pub fn does_not_exist(self, key: &str) -> Self {
        self.expression(key, SelectorOperator::DoesNotExist, &[])
    }
}
