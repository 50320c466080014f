//! ObjectDeployment: declarative template for ObjectSet revisions.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{ControlledObjectReference, LifecycleState, ObjectSetTemplateSpec};
use crate::conditions::Condition;
use crate::selector::LabelSelector;

pub const DEFAULT_REVISION_HISTORY_LIMIT: i32 = 10;

/// Metadata stamped onto every ObjectSet created from a template
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ObjectSetTemplateMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ObjectSetTemplate {
    #[serde(default)]
    pub metadata: ObjectSetTemplateMetadata,
    #[serde(default)]
    pub spec: ObjectSetTemplateSpec,
}

/// Spec body shared by ObjectDeployment and ClusterObjectDeployment.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDeploymentBody {
    /// Number of archived revisions to keep.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_history_limit: Option<i32>,
    pub selector: LabelSelector,
    pub template: ObjectSetTemplate,
}

impl ObjectDeploymentBody {
    pub fn history_limit(&self) -> usize {
        self.revision_history_limit.unwrap_or(DEFAULT_REVISION_HISTORY_LIMIT).max(0) as usize
    }
}

/// Coarse state derived from the deployment conditions.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ObjectDeploymentPhase {
    #[default]
    Pending,
    Available,
    NotReady,
    Progressing,
}

/// Summary of one ObjectSet revision owned by a deployment.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetRevisionReference {
    pub name: String,
    pub revision: i64,
    pub lifecycle_state: LifecycleState,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDeploymentStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ObjectDeploymentPhase>,
    /// Bumped on every name collision; salts the template hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collision_count: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
    /// ObjectSets currently owned by this deployment, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub object_sets: Vec<ObjectSetRevisionReference>,
    /// Objects controlled by the current revision.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub controller_of: Vec<ControlledObjectReference>,
}

/// Rolls out ObjectSet revisions from a template
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "package-operator.run",
    version = "v1alpha1",
    kind = "ObjectDeployment",
    plural = "objectdeployments",
    shortname = "objdeploy",
    namespaced,
    status = "ObjectDeploymentStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Revision","type":"string","jsonPath":".status.revision"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ObjectDeploymentSpec {
    #[serde(flatten)]
    pub body: ObjectDeploymentBody,
}

/// Cluster-scoped twin of ObjectDeployment
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "package-operator.run",
    version = "v1alpha1",
    kind = "ClusterObjectDeployment",
    plural = "clusterobjectdeployments",
    shortname = "cobjdeploy",
    status = "ObjectDeploymentStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Revision","type":"string","jsonPath":".status.revision"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ClusterObjectDeploymentSpec {
    #[serde(flatten)]
    pub body: ObjectDeploymentBody,
}

super::scoped_kind!(
    ObjectDeployment,
    ObjectDeploymentSpec,
    true,
    ObjectDeploymentKind,
    ObjectDeploymentBody,
    ObjectDeploymentStatus,
    ObjectSet = super::ObjectSet
);
super::scoped_kind!(
    ClusterObjectDeployment,
    ClusterObjectDeploymentSpec,
    false,
    ObjectDeploymentKind,
    ObjectDeploymentBody,
    ObjectDeploymentStatus,
    ObjectSet = super::ClusterObjectSet
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_limit_defaults_to_ten_and_clamps_negative() {
        let mut body = ObjectDeploymentBody::default();
        assert_eq!(body.history_limit(), 10);
        body.revision_history_limit = Some(0);
        assert_eq!(body.history_limit(), 0);
        body.revision_history_limit = Some(-3);
        assert_eq!(body.history_limit(), 0);
    }
}
