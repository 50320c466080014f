//! Label selectors (wire compatible with `metav1.LabelSelector`).

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Operator for a label selector requirement
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LabelSelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: LabelSelectorOperator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

impl LabelSelector {
    pub fn from_labels(labels: BTreeMap<String, String>) -> Self {
        Self { match_labels: labels, match_expressions: Vec::new() }
    }

    /// An empty selector matches everything.
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let labels_ok = self.match_labels.iter().all(|(k, v)| labels.get(k) == Some(v));
        labels_ok
            && self.match_expressions.iter().all(|req| {
                let cur = labels.get(&req.key);
                match req.operator {
                    LabelSelectorOperator::In => cur.map(|v| req.values.contains(v)).unwrap_or(false),
                    LabelSelectorOperator::NotIn => cur.map(|v| !req.values.contains(v)).unwrap_or(true),
                    LabelSelectorOperator::Exists => cur.is_some(),
                    LabelSelectorOperator::DoesNotExist => cur.is_none(),
                }
            })
    }

    /// Render as a list-call `labelSelector` query string.
    pub fn to_query(&self) -> String {
        let mut parts: Vec<String> = self.match_labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        for req in &self.match_expressions {
            let values = req.values.join(",");
            parts.push(match req.operator {
                LabelSelectorOperator::In => format!("{} in ({})", req.key, values),
                LabelSelectorOperator::NotIn => format!("{} notin ({})", req.key, values),
                LabelSelectorOperator::Exists => req.key.clone(),
                LabelSelectorOperator::DoesNotExist => format!("!{}", req.key),
            });
        }
        parts.join(",")
    }
}
