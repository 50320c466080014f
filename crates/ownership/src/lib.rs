//! Ownership strategies: who controls a managed object.
//!
//! [`NativeStrategy`] writes `metadata.ownerReferences` and is used whenever
//! owner and object share an apiserver. [`AnnotationStrategy`] keeps the same
//! relation in the `package-operator.run/owners` annotation so it can cross
//! cluster boundaries.

#![forbid(unsafe_code)]

mod annotation;
mod native;

use std::fmt::Debug;

use kube::api::DynamicObject;
use kube::core::ObjectMeta;
use kube::Resource;

use pko_core::object::split_api_version;

pub use annotation::AnnotationStrategy;
pub use native::NativeStrategy;

#[derive(Debug, thiserror::Error)]
pub enum OwnershipError {
    #[error("{object} is already controlled by {controller}")]
    AlreadyControlled { object: String, controller: String },
    #[error("cross-namespace owner references are disallowed: owner {owner} in {owner_namespace:?}, object in {object_namespace:?}")]
    CrossNamespace { owner: String, owner_namespace: Option<String>, object_namespace: Option<String> },
    #[error("owner {0} has no uid")]
    MissingUid(String),
    #[error("malformed owner annotation: {0}")]
    Annotation(#[from] serde_json::Error),
}

/// Everything needed to reference an owner from a managed object.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OwnerIdentity {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub uid: String,
}

impl OwnerIdentity {
    pub fn of<K: Resource<DynamicType = ()>>(owner: &K) -> Result<Self, OwnershipError> {
        let meta = owner.meta();
        let name = meta.name.clone().unwrap_or_default();
        let uid = meta.uid.clone().ok_or_else(|| OwnershipError::MissingUid(name.clone()))?;
        Ok(Self {
            api_version: K::api_version(&()).to_string(),
            kind: K::kind(&()).to_string(),
            name,
            namespace: meta.namespace.clone().filter(|ns| !ns.is_empty()),
            uid,
        })
    }

    pub fn of_dynamic(owner: &DynamicObject) -> Result<Self, OwnershipError> {
        let name = owner.metadata.name.clone().unwrap_or_default();
        let uid = owner.metadata.uid.clone().ok_or_else(|| OwnershipError::MissingUid(name.clone()))?;
        let types = owner.types.clone().unwrap_or_default();
        Ok(Self {
            api_version: types.api_version,
            kind: types.kind,
            name,
            namespace: owner.metadata.namespace.clone().filter(|ns| !ns.is_empty()),
            uid,
        })
    }

    pub fn group(&self) -> &str {
        split_api_version(&self.api_version).0
    }
}

impl std::fmt::Display for OwnerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Owner type an event handler maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerKind {
    pub group: String,
    pub kind: String,
    pub namespaced: bool,
}

impl OwnerKind {
    pub fn of<K: Resource<DynamicType = ()>>(namespaced: bool) -> Self {
        Self { group: K::group(&()).to_string(), kind: K::kind(&()).to_string(), namespaced }
    }
}

/// Reconcile target produced from an event on a managed object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerKey {
    pub namespace: Option<String>,
    pub name: String,
}

pub trait OwnerStrategy: Send + Sync + Debug {
    /// Fails when another owner already holds the controller role.
    fn set_controller_reference(&self, owner: &OwnerIdentity, obj: &mut ObjectMeta) -> Result<(), OwnershipError>;

    /// Adds or refreshes a non-controlling reference.
    fn set_owner_reference(&self, owner: &OwnerIdentity, obj: &mut ObjectMeta) -> Result<(), OwnershipError>;

    fn is_owner(&self, owner: &OwnerIdentity, obj: &ObjectMeta) -> bool;

    fn is_controller(&self, owner: &OwnerIdentity, obj: &ObjectMeta) -> bool;

    /// Current controller, with the namespace filled in where the strategy can know it.
    fn controller_of(&self, obj: &ObjectMeta) -> Option<OwnerIdentity>;

    fn has_controller(&self, obj: &ObjectMeta) -> bool {
        self.controller_of(obj).is_some()
    }

    /// Clears the controller flag on every reference; owners stay.
    fn release_controller(&self, obj: &mut ObjectMeta);

    fn remove_owner(&self, owner: &OwnerIdentity, obj: &mut ObjectMeta);

    /// Owners of `kind` referenced by `obj`, optionally only the controller.
    fn owners_for_event(&self, kind: &OwnerKind, obj: &ObjectMeta, controller_only: bool) -> Vec<OwnerKey>;
}

fn object_name(obj: &ObjectMeta) -> String {
    match obj.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, obj.name.as_deref().unwrap_or("")),
        _ => obj.name.clone().unwrap_or_default(),
    }
}
