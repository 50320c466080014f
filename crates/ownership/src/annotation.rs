use kube::core::ObjectMeta;
use serde::{Deserialize, Serialize};
use tracing::warn;

use pko_core::meta::OWNERS_ANNOTATION;
use pko_core::object::split_api_version;

use crate::{object_name, OwnerIdentity, OwnerKey, OwnerKind, OwnerStrategy, OwnershipError};

/// Ownership through a JSON array in the `package-operator.run/owners`
/// annotation. References may point across namespaces and clusters.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnnotationStrategy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotationOwnerRef {
    api_version: String,
    kind: String,
    name: String,
    #[serde(default)]
    namespace: String,
    uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    controller: Option<bool>,
}

impl AnnotationOwnerRef {
    fn is_controller(&self) -> bool {
        self.controller == Some(true)
    }

    fn identity(&self) -> OwnerIdentity {
        OwnerIdentity {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            namespace: Some(self.namespace.clone()).filter(|ns| !ns.is_empty()),
            uid: self.uid.clone(),
        }
    }
}

fn reference(owner: &OwnerIdentity, controller: bool) -> AnnotationOwnerRef {
    AnnotationOwnerRef {
        api_version: owner.api_version.clone(),
        kind: owner.kind.clone(),
        name: owner.name.clone(),
        namespace: owner.namespace.clone().unwrap_or_default(),
        uid: owner.uid.clone(),
        controller: controller.then_some(true),
    }
}

fn try_owner_refs(obj: &ObjectMeta) -> Result<Vec<AnnotationOwnerRef>, OwnershipError> {
    match obj.annotations.as_ref().and_then(|a| a.get(OWNERS_ANNOTATION)) {
        Some(raw) if !raw.is_empty() => Ok(serde_json::from_str(raw)?),
        _ => Ok(Vec::new()),
    }
}

/// Read paths treat a malformed envelope as "no owners".
fn owner_refs(obj: &ObjectMeta) -> Vec<AnnotationOwnerRef> {
    try_owner_refs(obj).unwrap_or_else(|e| {
        warn!(object = %object_name(obj), error = %e, "ignoring malformed owner annotation");
        Vec::new()
    })
}

fn set_owner_refs(obj: &mut ObjectMeta, refs: &[AnnotationOwnerRef]) -> Result<(), OwnershipError> {
    let raw = serde_json::to_string(refs)?;
    obj.annotations.get_or_insert_with(Default::default).insert(OWNERS_ANNOTATION.to_string(), raw);
    Ok(())
}

fn upsert(refs: &mut Vec<AnnotationOwnerRef>, r: AnnotationOwnerRef) {
    match refs.iter_mut().find(|existing| existing.uid == r.uid) {
        Some(existing) => *existing = r,
        None => refs.push(r),
    }
}

impl OwnerStrategy for AnnotationStrategy {
    fn set_controller_reference(&self, owner: &OwnerIdentity, obj: &mut ObjectMeta) -> Result<(), OwnershipError> {
        let mut refs = try_owner_refs(obj)?;
        if let Some(other) = refs.iter().find(|r| r.is_controller() && r.uid != owner.uid) {
            return Err(OwnershipError::AlreadyControlled {
                object: object_name(obj),
                controller: other.identity().to_string(),
            });
        }
        upsert(&mut refs, reference(owner, true));
        set_owner_refs(obj, &refs)
    }

    fn set_owner_reference(&self, owner: &OwnerIdentity, obj: &mut ObjectMeta) -> Result<(), OwnershipError> {
        let mut refs = try_owner_refs(obj)?;
        let keep_controller = refs.iter().any(|r| r.uid == owner.uid && r.is_controller());
        upsert(&mut refs, reference(owner, keep_controller));
        set_owner_refs(obj, &refs)
    }

    fn is_owner(&self, owner: &OwnerIdentity, obj: &ObjectMeta) -> bool {
        owner_refs(obj).iter().any(|r| r.uid == owner.uid)
    }

    fn is_controller(&self, owner: &OwnerIdentity, obj: &ObjectMeta) -> bool {
        owner_refs(obj).iter().any(|r| r.uid == owner.uid && r.is_controller())
    }

    fn controller_of(&self, obj: &ObjectMeta) -> Option<OwnerIdentity> {
        owner_refs(obj).iter().find(|r| r.is_controller()).map(AnnotationOwnerRef::identity)
    }

    fn release_controller(&self, obj: &mut ObjectMeta) {
        let mut refs = owner_refs(obj);
        if refs.is_empty() {
            return;
        }
        for r in refs.iter_mut() {
            r.controller = None;
        }
        if let Err(e) = set_owner_refs(obj, &refs) {
            warn!(object = %object_name(obj), error = %e, "failed to write owner annotation");
        }
    }

    fn remove_owner(&self, owner: &OwnerIdentity, obj: &mut ObjectMeta) {
        let mut refs = owner_refs(obj);
        let before = refs.len();
        refs.retain(|r| r.uid != owner.uid);
        if refs.len() != before {
            if let Err(e) = set_owner_refs(obj, &refs) {
                warn!(object = %object_name(obj), error = %e, "failed to write owner annotation");
            }
        }
    }

    fn owners_for_event(&self, kind: &OwnerKind, obj: &ObjectMeta, controller_only: bool) -> Vec<OwnerKey> {
        owner_refs(obj)
            .into_iter()
            .filter(|r| split_api_version(&r.api_version).0 == kind.group && r.kind == kind.kind)
            .filter(|r| !controller_only || r.is_controller())
            .map(|r| OwnerKey {
                namespace: if kind.namespaced { Some(r.namespace).filter(|ns| !ns.is_empty()) } else { None },
                name: r.name,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    #[test]
    fn envelope_round_trips_through_annotation() {
        let s = AnnotationStrategy;
        let rev1 = owner("rev1", "u1");
        let mut obj = meta("elsewhere");
        s.set_controller_reference(&rev1, &mut obj).unwrap();

        let raw = &obj.annotations.as_ref().unwrap()[OWNERS_ANNOTATION];
        let parsed: serde_json::Value = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed[0]["uid"], "u1");
        assert_eq!(parsed[0]["namespace"], "ns");
        assert_eq!(parsed[0]["controller"], true);

        let ctrl = s.controller_of(&obj).unwrap();
        assert_eq!(ctrl.namespace.as_deref(), Some("ns"));
    }

    #[test]
    fn release_keeps_owner() {
        let s = AnnotationStrategy;
        let rev1 = owner("rev1", "u1");
        let rev2 = owner("rev2", "u2");
        let mut obj = meta("ns");
        s.set_controller_reference(&rev1, &mut obj).unwrap();
        assert!(s.set_controller_reference(&rev2, &mut obj).is_err());
        s.release_controller(&mut obj);
        assert!(s.is_owner(&rev1, &obj));
        assert!(!s.is_controller(&rev1, &obj));
        s.set_controller_reference(&rev2, &mut obj).unwrap();
        let keys = s.owners_for_event(&object_set_kind(), &obj, true);
        assert_eq!(keys, vec![OwnerKey { namespace: Some("ns".into()), name: "rev2".into() }]);
    }

    #[test]
    fn malformed_annotation_reads_as_unowned() {
        let s = AnnotationStrategy;
        let mut obj = meta("ns");
        obj.annotations = Some([(OWNERS_ANNOTATION.to_string(), "{".to_string())].into_iter().collect());
        assert!(!s.has_controller(&obj));
        assert!(s.set_controller_reference(&owner("a", "u"), &mut obj).is_err());
    }
}
