//! Checks that run before any object of a phase is written.

use crate::{Desired, PhaseOwner};

/// One rejected object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub position: String,
    pub error: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.position, self.error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightError {
    pub violations: Vec<Violation>,
}

impl std::fmt::Display for PreflightError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.violations.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join(", "))
    }
}

impl std::error::Error for PreflightError {}

/// Kind must be served; namespaced owners may only write into their own namespace.
pub(crate) fn check_object(owner: &PhaseOwner, d: &Desired) -> Vec<Violation> {
    let mut errors = Vec::new();
    match (d.namespaced, owner.identity.namespace.as_deref()) {
        (None, _) => errors.push(format!("{} not registered on the api server", pko_core::object::gvk_key(&d.gvk))),
        (Some(false), Some(_)) => errors.push("cluster-scoped object requires a cluster-scoped owner".to_string()),
        (Some(true), Some(ns)) if d.object.metadata.namespace.as_deref() != Some(ns) => {
            errors.push(format!("must be within namespace {:?}", ns));
        }
        _ => {}
    }
    errors.into_iter().map(|error| Violation { position: d.position(), error }).collect()
}

pub(crate) fn check_phase(owner: &PhaseOwner, phase: &str, desired: &[Desired]) -> Result<(), PreflightError> {
    let violations: Vec<Violation> = desired
        .iter()
        .flat_map(|d| check_object(owner, d))
        .map(|v| Violation { position: format!("Phase {:?}, {}", phase, v.position), ..v })
        .collect();
    if violations.is_empty() {
        Ok(())
    } else {
        Err(PreflightError { violations })
    }
}
