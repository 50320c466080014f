use kube::{Resource, ResourceExt};

use pko_core::apis::{ObjectDeploymentPhase, ObjectDeploymentStatus, ObjectSetKind, ObjectSetRevisionReference};
use pko_core::conditions::{find_condition, is_condition_true, reasons, set_condition, sync_mapped_conditions, types};
use pko_core::{Condition, ConditionStatus};

use crate::revisions::revision_of;

fn is_fresh_true<S: ObjectSetKind>(set: &S, type_: &str) -> bool {
    let conditions = set.status().map(|s| s.conditions.as_slice()).unwrap_or_default();
    find_condition(conditions, type_).map_or(false, |c| c.is_true() && c.observed_generation == set.meta().generation)
}

/// Projects the revisions onto the deployment status. `current` is the
/// revision built from the present template, `previous` everything older.
pub(crate) fn project<S: ObjectSetKind>(
    status: &mut ObjectDeploymentStatus,
    current: Option<&S>,
    previous: &[S],
    generation: Option<i64>,
) {
    status.object_sets = previous
        .iter()
        .chain(current)
        .map(|s| ObjectSetRevisionReference {
            name: s.name_any(),
            revision: revision_of(s).unwrap_or_default(),
            lifecycle_state: s.body().lifecycle_state,
        })
        .collect();
    status.revision = current.and_then(revision_of);
    status.controller_of = current.and_then(|c| c.status()).map(|s| s.controller_of.clone()).unwrap_or_default();

    let condition = |type_: &str, status: ConditionStatus, reason: &str, message: &str| {
        Condition::new(type_, status, reason, message).with_generation(generation)
    };

    let mut succeeded = false;
    if let Some(current) = current {
        let set_status = current.status().cloned().unwrap_or_default();
        let fresh: Vec<Condition> = set_status
            .conditions
            .iter()
            .filter(|c| c.observed_generation == current.meta().generation)
            .cloned()
            .collect();
        sync_mapped_conditions(&mut status.conditions, &fresh, generation);

        if is_condition_true(&set_status.conditions, types::AVAILABLE) {
            set_condition(
                &mut status.conditions,
                condition(types::PROGRESSING, ConditionStatus::False, reasons::IDLE, "Update concluded."),
            );
            set_condition(
                &mut status.conditions,
                condition(types::AVAILABLE, ConditionStatus::True, reasons::AVAILABLE, "Latest ObjectSet is Available."),
            );
            status.phase = Some(derive_phase(&status.conditions));
            return;
        }
        succeeded = find_condition(&set_status.conditions, types::SUCCEEDED).is_some();
    }

    if !succeeded {
        set_condition(
            &mut status.conditions,
            condition(types::PROGRESSING, ConditionStatus::True, reasons::PROGRESSING, "Progressing to a new ObjectSet."),
        );
    }
    if previous.iter().any(|s| is_fresh_true(s, types::AVAILABLE)) {
        set_condition(
            &mut status.conditions,
            condition(
                types::AVAILABLE,
                ConditionStatus::True,
                reasons::AVAILABLE,
                "At least one revision ObjectSet is Available.",
            ),
        );
    } else {
        set_condition(
            &mut status.conditions,
            condition(types::AVAILABLE, ConditionStatus::False, reasons::OBJECT_SET_UNREADY, "No ObjectSet is available."),
        );
    }
    status.phase = Some(derive_phase(&status.conditions));
}

/// Coarse phase from the Available condition.
pub fn derive_phase(conditions: &[Condition]) -> ObjectDeploymentPhase {
    match find_condition(conditions, types::AVAILABLE).map(|c| c.status) {
        Some(ConditionStatus::True) => ObjectDeploymentPhase::Available,
        Some(ConditionStatus::False) => ObjectDeploymentPhase::NotReady,
        _ => ObjectDeploymentPhase::Progressing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;
    use pko_core::apis::{ObjectSet, ObjectSetBody, ObjectSetStatus};

    fn set(revision: i64, conditions: Vec<Condition>) -> ObjectSet {
        let meta = ObjectMeta { name: Some(format!("rev{}", revision)), generation: Some(1), ..Default::default() };
        let mut os = ObjectSet::from_parts(meta, ObjectSetBody { revision, ..Default::default() });
        os.status = Some(ObjectSetStatus { revision: Some(revision), conditions, ..Default::default() });
        os
    }

    fn cond(type_: &str, status: ConditionStatus) -> Condition {
        Condition::new(type_, status, "R", "m").with_generation(Some(1))
    }

    #[test]
    fn available_current_concludes_rollout() {
        let mut status = ObjectDeploymentStatus::default();
        let current = set(2, vec![cond(types::AVAILABLE, ConditionStatus::True), cond("app/Ready", ConditionStatus::True)]);
        project(&mut status, Some(&current), &[set(1, vec![])], Some(3));

        assert_eq!(status.phase, Some(ObjectDeploymentPhase::Available));
        assert_eq!(status.revision, Some(2));
        assert!(find_condition(&status.conditions, types::PROGRESSING).map_or(false, |c| !c.is_true()));
        let mapped = find_condition(&status.conditions, "app/Ready").unwrap();
        assert_eq!(mapped.observed_generation, Some(3));
        assert_eq!(status.object_sets.iter().map(|r| r.revision).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn previous_revision_keeps_deployment_available() {
        let mut status = ObjectDeploymentStatus::default();
        let current = set(2, vec![cond(types::AVAILABLE, ConditionStatus::False)]);
        project(&mut status, Some(&current), &[set(1, vec![cond(types::AVAILABLE, ConditionStatus::True)])], Some(1));

        assert_eq!(status.phase, Some(ObjectDeploymentPhase::Available));
        assert!(is_condition_true(&status.conditions, types::PROGRESSING));
        assert_eq!(find_condition(&status.conditions, types::AVAILABLE).unwrap().message, "At least one revision ObjectSet is Available.");
    }

    #[test]
    fn nothing_available_is_not_ready() {
        let mut status = ObjectDeploymentStatus::default();
        project::<ObjectSet>(&mut status, None, &[], Some(1));
        assert_eq!(status.phase, Some(ObjectDeploymentPhase::NotReady));
        assert_eq!(find_condition(&status.conditions, types::AVAILABLE).unwrap().reason, reasons::OBJECT_SET_UNREADY);
        assert_eq!(status.revision, None);
    }

    #[test]
    fn stale_mapped_conditions_are_dropped() {
        let mut status = ObjectDeploymentStatus::default();
        let stale = Condition::new("app/Ready", ConditionStatus::True, "R", "").with_generation(Some(0));
        let current = set(1, vec![cond(types::AVAILABLE, ConditionStatus::True), stale]);
        project(&mut status, Some(&current), &[], Some(1));
        assert!(find_condition(&status.conditions, "app/Ready").is_none());
    }

    #[test]
    fn phase_follows_available() {
        assert_eq!(derive_phase(&[]), ObjectDeploymentPhase::Progressing);
        assert_eq!(derive_phase(&[cond(types::AVAILABLE, ConditionStatus::Unknown)]), ObjectDeploymentPhase::Progressing);
    }
}
