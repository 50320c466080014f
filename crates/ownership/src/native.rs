use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::ObjectMeta;

use pko_core::object::split_api_version;

use crate::{object_name, OwnerIdentity, OwnerKey, OwnerKind, OwnerStrategy, OwnershipError};

/// Ownership through `metadata.ownerReferences`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeStrategy;

/// Same group, kind and name; uid and version are not compared.
fn refer_same_object(owner: &OwnerIdentity, r: &OwnerReference) -> bool {
    split_api_version(&r.api_version).0 == owner.group() && r.kind == owner.kind && r.name == owner.name
}

fn reference(owner: &OwnerIdentity, controller: bool) -> OwnerReference {
    OwnerReference {
        api_version: owner.api_version.clone(),
        kind: owner.kind.clone(),
        name: owner.name.clone(),
        uid: owner.uid.clone(),
        controller: controller.then_some(true),
        block_owner_deletion: controller.then_some(true),
    }
}

fn validate_namespace(owner: &OwnerIdentity, obj: &ObjectMeta) -> Result<(), OwnershipError> {
    let obj_ns = obj.namespace.clone().filter(|ns| !ns.is_empty());
    match (&owner.namespace, &obj_ns) {
        (None, _) => Ok(()),
        (Some(o), Some(n)) if o == n => Ok(()),
        _ => Err(OwnershipError::CrossNamespace {
            owner: owner.to_string(),
            owner_namespace: owner.namespace.clone(),
            object_namespace: obj_ns,
        }),
    }
}

fn upsert(obj: &mut ObjectMeta, owner: &OwnerIdentity, r: OwnerReference) {
    let refs = obj.owner_references.get_or_insert_with(Vec::new);
    match refs.iter_mut().find(|existing| refer_same_object(owner, existing)) {
        Some(existing) => *existing = r,
        None => refs.push(r),
    }
}

impl OwnerStrategy for NativeStrategy {
    fn set_controller_reference(&self, owner: &OwnerIdentity, obj: &mut ObjectMeta) -> Result<(), OwnershipError> {
        validate_namespace(owner, obj)?;
        let refs = obj.owner_references.as_deref().unwrap_or_default();
        if let Some(other) = refs.iter().find(|r| r.controller == Some(true) && !refer_same_object(owner, r)) {
            return Err(OwnershipError::AlreadyControlled {
                object: object_name(obj),
                controller: format!("{} {}", other.kind, other.name),
            });
        }
        upsert(obj, owner, reference(owner, true));
        Ok(())
    }

    fn set_owner_reference(&self, owner: &OwnerIdentity, obj: &mut ObjectMeta) -> Result<(), OwnershipError> {
        validate_namespace(owner, obj)?;
        let keep_controller = self.is_controller(owner, obj);
        upsert(obj, owner, reference(owner, keep_controller));
        Ok(())
    }

    fn is_owner(&self, owner: &OwnerIdentity, obj: &ObjectMeta) -> bool {
        obj.owner_references.iter().flatten().any(|r| refer_same_object(owner, r))
    }

    fn is_controller(&self, owner: &OwnerIdentity, obj: &ObjectMeta) -> bool {
        obj.owner_references.iter().flatten().any(|r| refer_same_object(owner, r) && r.controller == Some(true))
    }

    fn controller_of(&self, obj: &ObjectMeta) -> Option<OwnerIdentity> {
        let r = obj.owner_references.iter().flatten().find(|r| r.controller == Some(true))?;
        Some(OwnerIdentity {
            api_version: r.api_version.clone(),
            kind: r.kind.clone(),
            name: r.name.clone(),
            namespace: obj.namespace.clone().filter(|ns| !ns.is_empty()),
            uid: r.uid.clone(),
        })
    }

    fn release_controller(&self, obj: &mut ObjectMeta) {
        for r in obj.owner_references.iter_mut().flatten() {
            r.controller = None;
        }
    }

    fn remove_owner(&self, owner: &OwnerIdentity, obj: &mut ObjectMeta) {
        if let Some(refs) = obj.owner_references.as_mut() {
            if let Some(pos) = refs.iter().position(|r| refer_same_object(owner, r)) {
                refs.remove(pos);
            }
        }
    }

    fn owners_for_event(&self, kind: &OwnerKind, obj: &ObjectMeta, controller_only: bool) -> Vec<OwnerKey> {
        let namespace = if kind.namespaced { obj.namespace.clone() } else { None };
        obj.owner_references
            .iter()
            .flatten()
            .filter(|r| split_api_version(&r.api_version).0 == kind.group && r.kind == kind.kind)
            .filter(|r| !controller_only || r.controller == Some(true))
            .map(|r| OwnerKey { namespace: namespace.clone(), name: r.name.clone() })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    #[test]
    fn controller_handover() {
        let s = NativeStrategy;
        let rev1 = owner("rev1", "u1");
        let rev2 = owner("rev2", "u2");
        let mut obj = meta("ns");

        s.set_controller_reference(&rev1, &mut obj).unwrap();
        assert!(s.is_controller(&rev1, &obj));
        assert!(matches!(
            s.set_controller_reference(&rev2, &mut obj),
            Err(OwnershipError::AlreadyControlled { .. })
        ));

        s.release_controller(&mut obj);
        assert!(!s.has_controller(&obj));
        assert!(s.is_owner(&rev1, &obj));

        s.set_controller_reference(&rev2, &mut obj).unwrap();
        assert_eq!(s.controller_of(&obj).unwrap().name, "rev2");
        assert_eq!(obj.owner_references.as_ref().unwrap().len(), 2);

        s.remove_owner(&rev1, &mut obj);
        assert!(!s.is_owner(&rev1, &obj));
    }

    #[test]
    fn rejects_cross_namespace_owner() {
        let err = NativeStrategy.set_controller_reference(&owner("rev1", "u1"), &mut meta("other")).unwrap_err();
        assert!(matches!(err, OwnershipError::CrossNamespace { .. }));
    }

    #[test]
    fn events_map_to_owner_keys() {
        let s = NativeStrategy;
        let mut obj = meta("ns");
        s.set_owner_reference(&owner("rev1", "u1"), &mut obj).unwrap();
        s.set_controller_reference(&owner("rev2", "u2"), &mut obj).unwrap();
        let all = s.owners_for_event(&object_set_kind(), &obj, false);
        assert_eq!(all.len(), 2);
        let ctrl = s.owners_for_event(&object_set_kind(), &obj, true);
        assert_eq!(ctrl, vec![OwnerKey { namespace: Some("ns".into()), name: "rev2".into() }]);
    }
}
