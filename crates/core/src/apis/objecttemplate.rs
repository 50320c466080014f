//! ObjectTemplate: one manifest rendered from values sampled off live objects.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ControlledObjectReference;
use crate::conditions::Condition;

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ObjectTemplateSourceItem {
    /// JSON path into the source object
    pub key: String,
    /// Path in the rendering context, must start with `.`
    pub destination: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectTemplateSource {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub items: Vec<ObjectTemplateSourceItem>,
    /// Missing optional sources are skipped instead of blocking the render
    #[serde(default)]
    pub optional: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ObjectTemplateBody {
    pub template: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<ObjectTemplateSource>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectTemplateStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_of: Option<ControlledObjectReference>,
}

/// Renders an object from a template and cluster sourced values
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "package-operator.run",
    version = "v1alpha1",
    kind = "ObjectTemplate",
    plural = "objecttemplates",
    namespaced,
    status = "ObjectTemplateStatus"
)]
pub struct ObjectTemplateSpec {
    #[serde(flatten)]
    pub body: ObjectTemplateBody,
}

/// Cluster-scoped twin of ObjectTemplate
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "package-operator.run",
    version = "v1alpha1",
    kind = "ClusterObjectTemplate",
    plural = "clusterobjecttemplates",
    status = "ObjectTemplateStatus"
)]
pub struct ClusterObjectTemplateSpec {
    #[serde(flatten)]
    pub body: ObjectTemplateBody,
}

super::scoped_kind!(ObjectTemplate, ObjectTemplateSpec, true, ObjectTemplateKind, ObjectTemplateBody, ObjectTemplateStatus);
super::scoped_kind!(
    ClusterObjectTemplate,
    ClusterObjectTemplateSpec,
    false,
    ObjectTemplateKind,
    ObjectTemplateBody,
    ObjectTemplateStatus
);
