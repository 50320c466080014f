//! Whether a revision may take over the controller role of a live object.

use kube::api::DynamicObject;
use kube::core::ObjectMeta;

use pko_core::apis::CollisionProtection;
use pko_core::meta::{PACKAGE_LABEL, REVISION_ANNOTATION};
use pko_ownership::OwnerStrategy;

use crate::{object_ref, PhaseError, PhaseOwner, PreviousRevision};

/// Package whose objects are always adopted, so the operator can upgrade itself.
const SELF_PACKAGE: &str = "package-operator";

/// Revision stamped on an object; absent means 0.
pub fn object_revision(meta: &ObjectMeta) -> Result<i64, std::num::ParseIntError> {
    match meta.annotations.as_ref().and_then(|a| a.get(REVISION_ANNOTATION)) {
        Some(raw) if !raw.is_empty() => raw.parse(),
        _ => Ok(0),
    }
}

pub fn set_object_revision(meta: &mut ObjectMeta, revision: i64) {
    meta.annotations.get_or_insert_with(Default::default).insert(REVISION_ANNOTATION.to_string(), revision.to_string());
}

fn controlled_by_previous(strategy: &dyn OwnerStrategy, meta: &ObjectMeta, previous: &[PreviousRevision]) -> bool {
    previous.iter().any(|prev| {
        strategy.is_controller(&prev.owner, meta) || prev.remote_phases.iter().any(|r| strategy.is_controller(r, meta))
    })
}

/// `Ok(true)` when `owner` should become the controller of `obj`.
pub(crate) fn needs_adoption(
    strategy: &dyn OwnerStrategy,
    owner: &PhaseOwner,
    obj: &DynamicObject,
    previous: &[PreviousRevision],
    protection: CollisionProtection,
    force: bool,
) -> Result<bool, PhaseError> {
    let meta = &obj.metadata;
    if strategy.is_controller(&owner.identity, meta) {
        return Ok(false);
    }

    let current = object_revision(meta).map_err(|e| PhaseError::InvalidObject {
        object: object_ref(obj),
        reason: format!("invalid {} annotation: {}", REVISION_ANNOTATION, e),
    })?;
    // Objects of newer revisions are never taken back.
    if current > owner.revision {
        return Ok(false);
    }

    let own_package = meta.labels.as_ref().and_then(|l| l.get(PACKAGE_LABEL)).map(String::as_str) == Some(SELF_PACKAGE);
    let protection = if force || own_package { CollisionProtection::None } else { protection };
    match protection {
        CollisionProtection::None => return Ok(true),
        CollisionProtection::IfNoController if !strategy.has_controller(meta) => return Ok(true),
        _ => {}
    }

    if !controlled_by_previous(strategy, meta, previous) {
        return Err(PhaseError::NotOwnedByPreviousRevision { object: object_ref(obj) });
    }
    if current == owner.revision {
        return Err(PhaseError::RevisionCollision { object: object_ref(obj) });
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pko_core::object::value_to_dynamic;
    use pko_ownership::{NativeStrategy, OwnerIdentity};
    use serde_json::json;

    fn identity(name: &str) -> OwnerIdentity {
        OwnerIdentity {
            api_version: "package-operator.run/v1alpha1".into(),
            kind: "ObjectSet".into(),
            name: name.into(),
            namespace: Some("ns".into()),
            uid: format!("uid-{}", name),
        }
    }

    fn owner(revision: i64) -> PhaseOwner {
        PhaseOwner {
            identity: identity("rev2"),
            labels: Default::default(),
            generation: Some(1),
            revision,
            paused: false,
        }
    }

    fn object(controller: Option<&str>, revision: &str, labels: serde_json::Value) -> DynamicObject {
        let refs: Vec<_> = controller
            .map(|c| {
                json!({
                    "apiVersion": "package-operator.run/v1alpha1", "kind": "ObjectSet",
                    "name": c, "uid": format!("uid-{}", c), "controller": true
                })
            })
            .into_iter()
            .collect();
        value_to_dynamic(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {
                "name": "cm", "namespace": "ns", "labels": labels,
                "annotations": { REVISION_ANNOTATION: revision },
                "ownerReferences": refs
            }
        }))
        .unwrap()
    }

    fn previous() -> Vec<PreviousRevision> {
        vec![PreviousRevision { owner: identity("rev1"), remote_phases: vec![] }]
    }

    #[test]
    fn adopts_from_listed_previous_revision() {
        let obj = object(Some("rev1"), "1", json!({}));
        assert!(needs_adoption(&NativeStrategy, &owner(2), &obj, &previous(), CollisionProtection::Prevent, false).unwrap());
    }

    #[test]
    fn never_adopts_from_newer_revision() {
        let obj = object(Some("rev3"), "3", json!({}));
        assert!(!needs_adoption(&NativeStrategy, &owner(2), &obj, &previous(), CollisionProtection::None, false).unwrap());
    }

    #[test]
    fn refuses_unrelated_controller() {
        let obj = object(Some("stranger"), "1", json!({}));
        let err = needs_adoption(&NativeStrategy, &owner(2), &obj, &previous(), CollisionProtection::Prevent, false)
            .unwrap_err();
        assert!(matches!(err, PhaseError::NotOwnedByPreviousRevision { .. }));
        assert!(err.to_string().starts_with("refusing adoption"));
    }

    #[test]
    fn collision_protection_levels() {
        let orphan = object(None, "", json!({}));
        let s = &NativeStrategy;
        assert!(needs_adoption(s, &owner(2), &orphan, &[], CollisionProtection::Prevent, false).is_err());
        assert!(needs_adoption(s, &owner(2), &orphan, &[], CollisionProtection::IfNoController, false).unwrap());
        let foreign = object(Some("stranger"), "", json!({}));
        assert!(needs_adoption(s, &owner(2), &foreign, &[], CollisionProtection::IfNoController, false).is_err());
        assert!(needs_adoption(s, &owner(2), &foreign, &[], CollisionProtection::None, false).unwrap());
        assert!(needs_adoption(s, &owner(2), &foreign, &[], CollisionProtection::Prevent, true).unwrap());
        let own = object(Some("stranger"), "", json!({ PACKAGE_LABEL: SELF_PACKAGE }));
        assert!(needs_adoption(s, &owner(2), &own, &[], CollisionProtection::Prevent, false).unwrap());
    }

    #[test]
    fn same_revision_is_a_collision() {
        let obj = object(Some("rev1"), "2", json!({}));
        let err = needs_adoption(&NativeStrategy, &owner(2), &obj, &previous(), CollisionProtection::Prevent, false)
            .unwrap_err();
        assert!(matches!(err, PhaseError::RevisionCollision { .. }));
    }

    #[test]
    fn remote_phase_of_previous_counts_as_previous() {
        let mut prev = previous();
        prev[0].remote_phases.push(OwnerIdentity {
            kind: "ObjectSetPhase".into(),
            name: "rev1-remote".into(),
            uid: "uid-rev1-remote".into(),
            ..identity("x")
        });
        let mut obj = object(None, "1", json!({}));
        obj.metadata.owner_references = Some(vec![k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
            api_version: "package-operator.run/v1alpha1".into(),
            kind: "ObjectSetPhase".into(),
            name: "rev1-remote".into(),
            uid: "uid-rev1-remote".into(),
            controller: Some(true),
            block_owner_deletion: None,
        }]);
        assert!(needs_adoption(&NativeStrategy, &owner(2), &obj, &prev, CollisionProtection::Prevent, false).unwrap());
    }

    #[test]
    fn revision_annotation_defaults_to_zero() {
        assert_eq!(object_revision(&ObjectMeta::default()).unwrap(), 0);
        let mut meta = ObjectMeta::default();
        set_object_revision(&mut meta, 7);
        assert_eq!(object_revision(&meta).unwrap(), 7);
    }
}
