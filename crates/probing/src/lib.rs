//! Availability probes: composable predicates over live objects.

#![forbid(unsafe_code)]

mod cel;
mod parse;

use std::fmt::Debug;

use serde_json::Value;

use pko_core::jsonpath;
use pko_core::object::{gvk_of_value, split_api_version};
use pko_core::LabelSelector;

pub use cel::CelProbe;
pub use parse::{parse, parse_probes, parse_selector};

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("invalid CEL rule {rule:?}: {reason}")]
    Cel { rule: String, reason: String },
    #[error(transparent)]
    Path(#[from] jsonpath::PathError),
}

/// Result of probing one object. `message` is empty on success.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Outcome {
    pub success: bool,
    pub message: String,
}

impl Outcome {
    pub fn ok() -> Self {
        Self { success: true, message: String::new() }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into() }
    }
}

pub trait Prober: Send + Sync + Debug {
    fn probe(&self, obj: &Value) -> Outcome;
}

/// Conjunction; failure messages are joined with `", "`.
#[derive(Debug, Default)]
pub struct ProbeList(pub Vec<Box<dyn Prober>>);

impl Prober for ProbeList {
    fn probe(&self, obj: &Value) -> Outcome {
        let messages: Vec<String> =
            self.0.iter().map(|p| p.probe(obj)).filter(|o| !o.success).map(|o| o.message).collect();
        if messages.is_empty() {
            Outcome::ok()
        } else {
            Outcome::fail(messages.join(", "))
        }
    }
}

fn generation_of(obj: &Value) -> Option<i64> {
    obj.pointer("/metadata/generation").and_then(Value::as_i64)
}

/// `status.conditions[type=T].status == S`, honouring the condition's observedGeneration.
#[derive(Debug, Clone)]
pub struct ConditionProbe {
    pub type_: String,
    pub status: String,
}

impl ConditionProbe {
    fn check(&self, obj: &Value) -> Result<(), &'static str> {
        let conditions = obj.pointer("/status/conditions").ok_or("missing .status.conditions")?;
        let conditions = conditions.as_array().ok_or("malformed")?;
        for cond in conditions {
            let cond = cond.as_object().ok_or("malformed")?;
            if cond.get("type").and_then(Value::as_str) != Some(self.type_.as_str()) {
                continue;
            }
            if let Some(observed) = cond.get("observedGeneration").and_then(Value::as_i64) {
                if Some(observed) != generation_of(obj) {
                    return Err("outdated");
                }
            }
            if cond.get("status").and_then(Value::as_str) == Some(self.status.as_str()) {
                return Ok(());
            }
            return Err("wrong status");
        }
        Err("not reported")
    }
}

impl Prober for ConditionProbe {
    fn probe(&self, obj: &Value) -> Outcome {
        match self.check(obj) {
            Ok(()) => Outcome::ok(),
            Err(reason) => Outcome::fail(format!("condition {:?} == {:?}: {}", self.type_, self.status, reason)),
        }
    }
}

/// Succeeds when both paths resolve and hold semantically equal values.
#[derive(Debug, Clone)]
pub struct FieldsEqualProbe {
    pub field_a: String,
    pub field_b: String,
    path_a: Vec<jsonpath::Segment>,
    path_b: Vec<jsonpath::Segment>,
}

impl FieldsEqualProbe {
    pub fn new(field_a: &str, field_b: &str) -> Result<Self, ProbeError> {
        Ok(Self {
            field_a: field_a.to_string(),
            field_b: field_b.to_string(),
            path_a: jsonpath::parse(field_a)?,
            path_b: jsonpath::parse(field_b)?,
        })
    }
}

impl Prober for FieldsEqualProbe {
    fn probe(&self, obj: &Value) -> Outcome {
        let prefix = format!("{:?} == {:?}", self.field_a, self.field_b);
        let Some(a) = jsonpath::get_segments(obj, &self.path_a) else {
            return Outcome::fail(format!("{}: {:?} missing", prefix, self.field_a));
        };
        let Some(b) = jsonpath::get_segments(obj, &self.path_b) else {
            return Outcome::fail(format!("{}: {:?} missing", prefix, self.field_b));
        };
        if jsonpath::semantic_eq(a, b) {
            Outcome::ok()
        } else {
            Outcome::fail(format!("{}: {} != {}", prefix, a, b))
        }
    }
}

/// Fails with `.status outdated` while `.status.observedGeneration` lags `.metadata.generation`.
#[derive(Debug)]
pub struct ObservedGenerationGate(pub Box<dyn Prober>);

impl Prober for ObservedGenerationGate {
    fn probe(&self, obj: &Value) -> Outcome {
        if let Some(observed) = obj.pointer("/status/observedGeneration").and_then(Value::as_i64) {
            if Some(observed) != generation_of(obj) {
                return Outcome::fail(".status outdated");
            }
        }
        self.0.probe(obj)
    }
}

/// Runs the inner probe only on objects of one GroupKind.
#[derive(Debug)]
pub struct KindSelector {
    pub group: String,
    pub kind: String,
    pub inner: Box<dyn Prober>,
}

impl Prober for KindSelector {
    fn probe(&self, obj: &Value) -> Outcome {
        let matches = obj
            .get("apiVersion")
            .and_then(Value::as_str)
            .map(|av| split_api_version(av).0 == self.group)
            .unwrap_or(false)
            && gvk_of_value(obj).map(|g| g.kind == self.kind).unwrap_or(false);
        if matches {
            self.inner.probe(obj)
        } else {
            Outcome::ok()
        }
    }
}

/// Runs the inner probe only on objects matching a label selector.
#[derive(Debug)]
pub struct LabelSelectorGate {
    pub selector: LabelSelector,
    pub inner: Box<dyn Prober>,
}

impl Prober for LabelSelectorGate {
    fn probe(&self, obj: &Value) -> Outcome {
        let labels = obj
            .pointer("/metadata/labels")
            .and_then(Value::as_object)
            .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string()))).collect())
            .unwrap_or_default();
        if self.selector.matches(&labels) {
            self.inner.probe(obj)
        } else {
            Outcome::ok()
        }
    }
}
