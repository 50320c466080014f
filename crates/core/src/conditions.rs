//! Kubernetes-style status conditions and the helpers every controller uses to stamp them.

use chrono::{SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition types written by the controllers.
pub mod types {
    pub const AVAILABLE: &str = "Available";
    pub const PROGRESSING: &str = "Progressing";
    pub const PAUSED: &str = "Paused";
    pub const SUCCEEDED: &str = "Succeeded";
    pub const ARCHIVED: &str = "Archived";
    pub const IN_TRANSITION: &str = "InTransition";
    pub const UNPACKED: &str = "Unpacked";
    pub const INVALID: &str = "Invalid";
}

/// Reasons attached to the condition types above.
pub mod reasons {
    pub const AVAILABLE: &str = "Available";
    pub const AVAILABLE_ONCE: &str = "AvailableOnce";
    pub const PROBE_FAILURE: &str = "ProbeFailure";
    pub const CONFLICT: &str = "Conflict";
    pub const COLLISION_DETECTED: &str = "CollisionDetected";
    pub const PREFLIGHT_ERROR: &str = "PreflightError";
    pub const PAUSED: &str = "Paused";
    pub const PARTIALLY_PAUSED: &str = "PartiallyPaused";
    pub const ARCHIVAL_IN_PROGRESS: &str = "ArchivalInProgress";
    pub const ARCHIVED: &str = "Archived";
    pub const IN_TRANSITION: &str = "InTransition";
    pub const IDLE: &str = "Idle";
    pub const PROGRESSING: &str = "Progressing";
    pub const OBJECT_SET_UNREADY: &str = "ObjectSetUnready";
    pub const UNPACK_SUCCESS: &str = "UnpackSuccess";
    pub const IMAGE_PULL_BACK_OFF: &str = "ImagePullBackOff";
    pub const SECRET_VALIDATION_FAILED: &str = "SecretValidationFailed";
    pub const LOAD_ERROR: &str = "LoadError";
    pub const SOURCE_MISSING: &str = "SourceMissing";
    pub const SOURCE_ERROR: &str = "SourceError";
    pub const TEMPLATE_ERROR: &str = "TemplateError";
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl ConditionStatus {
    pub fn from_bool(v: bool) -> Self {
        if v { Self::True } else { Self::False }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConditionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "True" => Ok(Self::True),
            "False" => Ok(Self::False),
            "Unknown" => Ok(Self::Unknown),
            other => Err(format!("invalid condition status: {}", other)),
        }
    }
}

/// Kubernetes-style condition (wire compatible with `metav1.Condition`).
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    /// Generation of the owning object this condition was computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// RFC3339 timestamp of the last status flip
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation: None,
            last_transition_time: None,
        }
    }

    pub fn with_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Insert or update a condition. The transition time only moves when the status flips.
pub fn set_condition(conditions: &mut Vec<Condition>, mut new: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) => {
            if existing.status != new.status || existing.last_transition_time.is_none() {
                existing.last_transition_time = new.last_transition_time.take().or_else(|| Some(now_rfc3339()));
            }
            existing.status = new.status;
            existing.reason = new.reason;
            existing.message = new.message;
            existing.observed_generation = new.observed_generation;
        }
        None => {
            if new.last_transition_time.is_none() {
                new.last_transition_time = Some(now_rfc3339());
            }
            conditions.push(new);
        }
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).map(|c| c.is_true()).unwrap_or(false)
}

pub fn is_condition_false(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).map(|c| c.status == ConditionStatus::False).unwrap_or(false)
}

/// Returns true when a condition was removed.
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) -> bool {
    let before = conditions.len();
    conditions.retain(|c| c.type_ != type_);
    before != conditions.len()
}

/// Mapped conditions are the ones propagated from managed objects; their type carries a `/`.
pub fn is_mapped_condition(type_: &str) -> bool {
    type_.contains('/')
}

/// Replace every mapped condition in `dst` with the mapped conditions of `src`,
/// restamping them with `generation`. A condition whose status did not change
/// keeps its transition time.
pub fn sync_mapped_conditions(dst: &mut Vec<Condition>, src: &[Condition], generation: Option<i64>) {
    let previous: Vec<Condition> = dst.iter().filter(|c| is_mapped_condition(&c.type_)).cloned().collect();
    dst.retain(|c| !is_mapped_condition(&c.type_));
    for c in src.iter().filter(|c| is_mapped_condition(&c.type_)) {
        let mut c = c.clone();
        c.observed_generation = generation;
        if let Some(old) = find_condition(&previous, &c.type_).filter(|old| old.status == c.status) {
            c.last_transition_time = old.last_transition_time.clone();
        }
        set_condition(dst, c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_condition_keeps_transition_time_when_status_is_unchanged() {
        let mut conds = Vec::new();
        let mut first = Condition::new(types::AVAILABLE, ConditionStatus::True, reasons::AVAILABLE, "");
        first.last_transition_time = Some("2020-01-01T00:00:00Z".into());
        set_condition(&mut conds, first);
        set_condition(&mut conds, Condition::new(types::AVAILABLE, ConditionStatus::True, "Other", "msg"));
        assert_eq!(conds.len(), 1);
        assert_eq!(conds[0].reason, "Other");
        assert_eq!(conds[0].last_transition_time.as_deref(), Some("2020-01-01T00:00:00Z"));

        set_condition(&mut conds, Condition::new(types::AVAILABLE, ConditionStatus::False, "Down", ""));
        assert_ne!(conds[0].last_transition_time.as_deref(), Some("2020-01-01T00:00:00Z"));
        assert!(is_condition_false(&conds, types::AVAILABLE));
    }

    #[test]
    fn mapped_conditions_are_replaced_and_restamped() {
        let mut dst = vec![
            Condition::new(types::AVAILABLE, ConditionStatus::True, "", ""),
            Condition::new("stale/Gone", ConditionStatus::True, "", ""),
        ];
        let src = vec![
            Condition::new(types::PROGRESSING, ConditionStatus::True, "", ""),
            Condition::new("my-prefix/Progressing", ConditionStatus::True, "", "").with_generation(Some(1)),
        ];
        sync_mapped_conditions(&mut dst, &src, Some(7));
        let types: Vec<_> = dst.iter().map(|c| c.type_.as_str()).collect();
        assert_eq!(types, vec!["Available", "my-prefix/Progressing"]);
        assert_eq!(dst[1].observed_generation, Some(7));
    }

    #[test]
    fn mapped_conditions_keep_transition_time_across_syncs() {
        let mut dst = Vec::new();
        let mut src = vec![Condition::new("my-prefix/Ready", ConditionStatus::True, "Up", "")];
        sync_mapped_conditions(&mut dst, &src, Some(1));
        let first = dst[0].last_transition_time.clone();
        assert!(first.is_some());

        // A later sync with an unchanged status must not move the time.
        dst[0].last_transition_time = Some("2020-01-01T00:00:00Z".into());
        src[0].message = "still up".into();
        sync_mapped_conditions(&mut dst, &src, Some(2));
        assert_eq!(dst[0].last_transition_time.as_deref(), Some("2020-01-01T00:00:00Z"));
        assert_eq!(dst[0].message, "still up");
        assert_eq!(dst[0].observed_generation, Some(2));

        src[0].status = ConditionStatus::False;
        sync_mapped_conditions(&mut dst, &src, Some(2));
        assert_ne!(dst[0].last_transition_time.as_deref(), Some("2020-01-01T00:00:00Z"));
    }

    #[test]
    fn condition_status_parses_wire_values() {
        assert_eq!("True".parse::<ConditionStatus>().unwrap(), ConditionStatus::True);
        assert!("yes".parse::<ConditionStatus>().is_err());
        let c: Condition = serde_json::from_value(serde_json::json!({"type": "Available", "status": "False"})).unwrap();
        assert_eq!(c.status, ConditionStatus::False);
        assert_eq!(c.reason, "");
    }
}
