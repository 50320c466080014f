//! ObjectSet, ObjectSetPhase and ObjectSlice.

use kube::core::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    is_zero, ControlledObjectReference, LifecycleState, ObjectSetObject, ObjectSetProbe, ObjectSetTemplatePhase,
    ObjectSetTemplateSpec, PreviousRevisionReference, RemotePhaseReference,
};
use crate::conditions::Condition;

/// Spec body shared by ObjectSet and ClusterObjectSet.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetBody {
    /// The only field that may change after creation.
    #[serde(default)]
    pub lifecycle_state: LifecycleState,
    /// Revisions whose objects this revision may adopt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous: Vec<PreviousRevisionReference>,
    /// Assigned by the owning ObjectDeployment; zero means "derive from previous".
    #[serde(default, skip_serializing_if = "is_zero")]
    pub revision: i64,
    #[serde(flatten)]
    pub template: ObjectSetTemplateSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remote_phases: Vec<RemotePhaseReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub controller_of: Vec<ControlledObjectReference>,
}

/// One immutable revision of a set of objects
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "package-operator.run",
    version = "v1alpha1",
    kind = "ObjectSet",
    plural = "objectsets",
    shortname = "os",
    namespaced,
    status = "ObjectSetStatus",
    printcolumn = r#"{"name":"Revision","type":"string","jsonPath":".status.revision"}"#,
    printcolumn = r#"{"name":"Lifecycle","type":"string","jsonPath":".spec.lifecycleState"}"#,
    printcolumn = r#"{"name":"Available","type":"string","jsonPath":".status.conditions[?(@.type==\"Available\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ObjectSetSpec {
    #[serde(flatten)]
    pub body: ObjectSetBody,
}

/// Cluster-scoped twin of ObjectSet
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "package-operator.run",
    version = "v1alpha1",
    kind = "ClusterObjectSet",
    plural = "clusterobjectsets",
    shortname = "cos",
    status = "ObjectSetStatus",
    printcolumn = r#"{"name":"Revision","type":"string","jsonPath":".status.revision"}"#,
    printcolumn = r#"{"name":"Lifecycle","type":"string","jsonPath":".spec.lifecycleState"}"#,
    printcolumn = r#"{"name":"Available","type":"string","jsonPath":".status.conditions[?(@.type==\"Available\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ClusterObjectSetSpec {
    #[serde(flatten)]
    pub body: ObjectSetBody,
}

super::scoped_kind!(ObjectSet, ObjectSetSpec, true, ObjectSetKind, ObjectSetBody, ObjectSetStatus, Phase = ObjectSetPhase);
super::scoped_kind!(
    ClusterObjectSet,
    ClusterObjectSetSpec,
    false,
    ObjectSetKind,
    ObjectSetBody,
    ObjectSetStatus,
    Phase = ClusterObjectSetPhase
);

// =============================================================================
// ObjectSetPhase
// =============================================================================

/// Spec body shared by ObjectSetPhase and ClusterObjectSetPhase.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetPhaseBody {
    #[serde(default)]
    pub paused: bool,
    pub revision: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous: Vec<PreviousRevisionReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub availability_probes: Vec<ObjectSetProbe>,
    #[serde(flatten)]
    pub phase: ObjectSetTemplatePhase,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetPhaseStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub controller_of: Vec<ControlledObjectReference>,
}

/// A phase of an ObjectSet delegated to an external controller
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "package-operator.run",
    version = "v1alpha1",
    kind = "ObjectSetPhase",
    plural = "objectsetphases",
    namespaced,
    status = "ObjectSetPhaseStatus",
    printcolumn = r#"{"name":"Class","type":"string","jsonPath":".spec.class"}"#,
    printcolumn = r#"{"name":"Available","type":"string","jsonPath":".status.conditions[?(@.type==\"Available\")].status"}"#
)]
pub struct ObjectSetPhaseSpec {
    #[serde(flatten)]
    pub body: ObjectSetPhaseBody,
}

/// Cluster-scoped twin of ObjectSetPhase
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "package-operator.run",
    version = "v1alpha1",
    kind = "ClusterObjectSetPhase",
    plural = "clusterobjectsetphases",
    status = "ObjectSetPhaseStatus",
    printcolumn = r#"{"name":"Class","type":"string","jsonPath":".spec.class"}"#,
    printcolumn = r#"{"name":"Available","type":"string","jsonPath":".status.conditions[?(@.type==\"Available\")].status"}"#
)]
pub struct ClusterObjectSetPhaseSpec {
    #[serde(flatten)]
    pub body: ObjectSetPhaseBody,
}

super::scoped_kind!(ObjectSetPhase, ObjectSetPhaseSpec, true, ObjectSetPhaseKind, ObjectSetPhaseBody, ObjectSetPhaseStatus);
super::scoped_kind!(
    ClusterObjectSetPhase,
    ClusterObjectSetPhaseSpec,
    false,
    ObjectSetPhaseKind,
    ObjectSetPhaseBody,
    ObjectSetPhaseStatus
);

// =============================================================================
// ObjectSlice
// =============================================================================

pub const OBJECT_SLICE_KIND: &str = "ObjectSlice";
pub const CLUSTER_OBJECT_SLICE_KIND: &str = "ClusterObjectSlice";

/// Overflow storage for phase objects. Objects live at the top level, not under `spec`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSlice {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub objects: Vec<ObjectSetObject>,
}

impl ObjectSlice {
    pub fn slice_kind(namespaced: bool) -> &'static str {
        if namespaced { OBJECT_SLICE_KIND } else { CLUSTER_OBJECT_SLICE_KIND }
    }

    pub fn gvk(namespaced: bool) -> kube::core::GroupVersionKind {
        kube::core::GroupVersionKind::gvk(super::GROUP, super::VERSION, Self::slice_kind(namespaced))
    }
}

/// Hand-written CRD for the slice kinds, which carry no spec/status.
pub fn object_slice_crd(
    namespaced: bool,
) -> Result<k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition, serde_json::Error> {
    let kind = ObjectSlice::slice_kind(namespaced);
    let plural = format!("{}s", kind.to_lowercase());
    serde_json::from_value(serde_json::json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": { "name": format!("{}.{}", plural, super::GROUP) },
        "spec": {
            "group": super::GROUP,
            "names": { "kind": kind, "plural": plural, "singular": kind.to_lowercase(), "listKind": format!("{}List", kind) },
            "scope": if namespaced { "Namespaced" } else { "Cluster" },
            "versions": [{
                "name": super::VERSION,
                "served": true,
                "storage": true,
                "schema": { "openAPIV3Schema": {
                    "type": "object",
                    "properties": {
                        "apiVersion": { "type": "string" },
                        "kind": { "type": "string" },
                        "metadata": { "type": "object" },
                        "objects": {
                            "type": "array",
                            "items": { "type": "object", "x-kubernetes-preserve-unknown-fields": true }
                        }
                    }
                }}
            }]
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::ObjectSetKind;
    use serde_json::json;

    #[test]
    fn object_set_spec_flattens_template_fields() {
        let os: ObjectSet = serde_json::from_value(json!({
            "apiVersion": "package-operator.run/v1alpha1",
            "kind": "ObjectSet",
            "metadata": { "name": "demo-abc", "namespace": "ns" },
            "spec": {
                "lifecycleState": "Paused",
                "revision": 3,
                "previous": [{ "name": "demo-old" }],
                "phases": [{ "name": "deploy", "objects": [{ "object": { "apiVersion": "v1", "kind": "ConfigMap" } }] }],
                "availabilityProbes": []
            }
        }))
        .unwrap();
        let body = os.body();
        assert_eq!(body.lifecycle_state, LifecycleState::Paused);
        assert_eq!(body.revision, 3);
        assert_eq!(body.template.phases[0].objects[0].collision_protection, crate::apis::CollisionProtection::Prevent);

        let back = serde_json::to_value(&os).unwrap();
        assert_eq!(back["spec"]["phases"][0]["name"], "deploy");
        assert!(back["spec"].get("availabilityProbes").is_none());
    }

    #[test]
    fn object_slice_keeps_objects_at_top_level() {
        let slice: ObjectSlice = serde_json::from_value(json!({
            "metadata": { "name": "s-1" },
            "objects": [{ "object": { "kind": "Secret" } }]
        }))
        .unwrap();
        assert_eq!(slice.objects.len(), 1);
        let crd = object_slice_crd(false).unwrap();
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(crd.metadata.name.as_deref(), Some("clusterobjectslices.package-operator.run"));
    }
}
