//! Custom Resource Definitions served at `package-operator.run/v1alpha1`.
//!
//! Every namespaced kind has a cluster-scoped twin with an identical body. The
//! body structs are shared and flattened into both specs; the `*Kind` traits
//! give controllers one generic view over either scope.

mod objectdeployment;
mod objectset;
mod objecttemplate;
mod package;

use std::fmt::Debug;

use kube::core::GroupVersionKind;
use kube::Resource;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::selector::LabelSelector;

pub use objectdeployment::*;
pub use objectset::*;
pub use objecttemplate::*;
pub use package::*;

pub const GROUP: &str = "package-operator.run";
pub const VERSION: &str = "v1alpha1";
pub const API_VERSION: &str = "package-operator.run/v1alpha1";

/// Schema for embedded, arbitrary Kubernetes objects.
pub(crate) fn preserve_unknown_object(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    use schemars::schema::{InstanceType, Schema, SchemaObject};
    let mut obj = SchemaObject { instance_type: Some(InstanceType::Object.into()), ..Default::default() };
    obj.extensions.insert("x-kubernetes-preserve-unknown-fields".into(), serde_json::Value::Bool(true));
    Schema::Object(obj)
}

pub(crate) fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// GroupVersionKind of a statically typed resource.
pub fn gvk_of<K: Resource<DynamicType = ()>>() -> GroupVersionKind {
    GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()))
}

// =============================================================================
// Shared object-set vocabulary
// =============================================================================

/// Lifecycle of an ObjectSet revision.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LifecycleState {
    #[default]
    Active,
    Paused,
    Archived,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Paused => write!(f, "Paused"),
            Self::Archived => write!(f, "Archived"),
        }
    }
}

/// Which existing objects a revision is allowed to take over.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CollisionProtection {
    /// Only adopt objects controlled by a listed previous revision.
    #[default]
    Prevent,
    /// Additionally adopt objects that have no controller at all.
    IfNoController,
    /// Adopt everything.
    None,
}

impl std::str::FromStr for CollisionProtection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Prevent" => Ok(Self::Prevent),
            "IfNoController" => Ok(Self::IfNoController),
            "None" => Ok(Self::None),
            other => Err(format!("invalid collision protection: {}", other)),
        }
    }
}

/// Copies a condition of a managed object onto its owner under a new type.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConditionMapping {
    pub source_type: String,
    pub destination_type: String,
}

/// One managed object of a phase.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetObject {
    #[schemars(schema_with = "preserve_unknown_object")]
    pub object: serde_json::Value,
    #[serde(default)]
    pub collision_protection: CollisionProtection,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub condition_mappings: Vec<ConditionMapping>,
}

/// An ordered group of objects reconciled as a unit.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetTemplatePhase {
    pub name: String,
    /// Non-empty class delegates the phase to an ObjectSetPhase served by another controller.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub class: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objects: Vec<ObjectSetObject>,
    /// Names of ObjectSlices whose objects are appended to this phase.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub slices: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ProbeKindSelector {
    #[serde(default)]
    pub group: String,
    pub kind: String,
}

/// Scopes a probe list to a subset of objects.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ProbeSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ProbeKindSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ProbeConditionSpec {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeFieldsEqualSpec {
    pub field_a: String,
    pub field_b: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ProbeCelSpec {
    pub rule: String,
    pub message: String,
}

/// Exactly one of the fields is expected to be set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ProbeConditionSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields_equal: Option<ProbeFieldsEqualSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cel: Option<ProbeCelSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ObjectSetProbe {
    #[serde(default)]
    pub selector: ProbeSelector,
    #[serde(default)]
    pub probes: Vec<Probe>,
}

/// The immutable part of an ObjectSet, also embedded in ObjectDeployment templates.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetTemplateSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<ObjectSetTemplatePhase>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub availability_probes: Vec<ObjectSetProbe>,
    /// Seconds Available must hold before Succeeded is reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_delay_seconds: Option<i32>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct PreviousRevisionReference {
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct RemotePhaseReference {
    pub name: String,
    #[serde(default)]
    pub uid: String,
}

/// Reference to an object controlled by an ObjectSet or ObjectTemplate.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ControlledObjectReference {
    pub kind: String,
    #[serde(default)]
    pub group: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ControlledObjectReference {
    pub fn of(obj: &kube::api::DynamicObject) -> Self {
        let (group, _) = obj.types.as_ref().map(|t| crate::object::split_api_version(&t.api_version)).unwrap_or_default();
        Self {
            kind: obj.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default(),
            group: group.to_string(),
            name: obj.metadata.name.clone().unwrap_or_default(),
            namespace: obj.metadata.namespace.clone().filter(|ns| !ns.is_empty()),
        }
    }
}

// =============================================================================
// Scope-generic views
// =============================================================================

/// Common bounds of every CRD handled by a controller.
pub trait CrdObject:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const NAMESPACED: bool;
}

pub trait ObjectSetKind: CrdObject {
    type Phase: ObjectSetPhaseKind;

    fn body(&self) -> &ObjectSetBody;
    fn status(&self) -> Option<&ObjectSetStatus>;
    fn from_parts(metadata: kube::core::ObjectMeta, body: ObjectSetBody) -> Self;
}

pub trait ObjectSetPhaseKind: CrdObject {
    fn body(&self) -> &ObjectSetPhaseBody;
    fn status(&self) -> Option<&ObjectSetPhaseStatus>;
    fn from_parts(metadata: kube::core::ObjectMeta, body: ObjectSetPhaseBody) -> Self;
}

pub trait ObjectDeploymentKind: CrdObject {
    type ObjectSet: ObjectSetKind;

    fn body(&self) -> &ObjectDeploymentBody;
    fn status(&self) -> Option<&ObjectDeploymentStatus>;
    fn from_parts(metadata: kube::core::ObjectMeta, body: ObjectDeploymentBody) -> Self;
}

pub trait PackageKind: CrdObject {
    type Deployment: ObjectDeploymentKind;

    fn body(&self) -> &PackageBody;
    fn status(&self) -> Option<&PackageStatus>;
    fn from_parts(metadata: kube::core::ObjectMeta, body: PackageBody) -> Self;
}

pub trait ObjectTemplateKind: CrdObject {
    fn body(&self) -> &ObjectTemplateBody;
    fn status(&self) -> Option<&ObjectTemplateStatus>;
}

/// Wires a namespaced/cluster CRD pair to one of the `*Kind` traits.
macro_rules! scoped_kind {
    ($ty:ident, $spec:ident, $namespaced:expr, $tr:ident, $body:ty, $status:ty $(, $assoc:ident = $target:ty)*) => {
        impl crate::apis::CrdObject for $ty {
            const NAMESPACED: bool = $namespaced;
        }

        impl crate::apis::$tr for $ty {
            $(type $assoc = $target;)*

            fn body(&self) -> &$body {
                &self.spec.body
            }

            fn status(&self) -> Option<&$status> {
                self.status.as_ref()
            }

            $crate::apis::scoped_kind!(@from_parts $tr, $ty, $spec, $body);
        }
    };
    (@from_parts ObjectTemplateKind, $ty:ident, $spec:ident, $body:ty) => {};
    (@from_parts $tr:ident, $ty:ident, $spec:ident, $body:ty) => {
        fn from_parts(metadata: kube::core::ObjectMeta, body: $body) -> Self {
            Self { metadata, spec: $spec { body }, status: None }
        }
    };
}
pub(crate) use scoped_kind;
