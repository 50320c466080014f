//! Package: user-facing entry point pointing at an OCI image.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::preserve_unknown_object;
use crate::conditions::Condition;

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct SecretNameReference {
    pub name: String,
}

/// Exposes a Secret of the Package namespace to templates under `package.secrets.<name>`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct PackageSecretReference {
    pub name: String,
    pub secret: SecretNameReference,
}

/// Spec body shared by Package and ClusterPackage.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PackageBody {
    /// OCI image reference
    pub image: String,
    /// Rendering configuration, validated against the manifest config schema
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_object")]
    pub config: Option<serde_json::Value>,
    /// Component of a multi-component package to install
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    /// Name of a `kubernetes.io/dockerconfigjson` Secret used to pull the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<PackageSecretReference>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum PackageStatusPhase {
    #[default]
    Pending,
    Unpacking,
    Progressing,
    Available,
    NotReady,
    Invalid,
}

impl std::fmt::Display for PackageStatusPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Unpacking => "Unpacking",
            Self::Progressing => "Progressing",
            Self::Available => "Available",
            Self::NotReady => "NotReady",
            Self::Invalid => "Invalid",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PackageStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<PackageStatusPhase>,
    /// Hash of the spec that was last unpacked successfully
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unpacked_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
}

/// A package installed into a namespace
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "package-operator.run",
    version = "v1alpha1",
    kind = "Package",
    plural = "packages",
    shortname = "pkg",
    namespaced,
    status = "PackageStatus",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Revision","type":"string","jsonPath":".status.revision"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct PackageSpec {
    #[serde(flatten)]
    pub body: PackageBody,
}

/// A package installed cluster-wide
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "package-operator.run",
    version = "v1alpha1",
    kind = "ClusterPackage",
    plural = "clusterpackages",
    shortname = "cpkg",
    status = "PackageStatus",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Revision","type":"string","jsonPath":".status.revision"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ClusterPackageSpec {
    #[serde(flatten)]
    pub body: PackageBody,
}

super::scoped_kind!(
    Package,
    PackageSpec,
    true,
    PackageKind,
    PackageBody,
    PackageStatus,
    Deployment = super::ObjectDeployment
);
super::scoped_kind!(
    ClusterPackage,
    ClusterPackageSpec,
    false,
    PackageKind,
    PackageBody,
    PackageStatus,
    Deployment = super::ClusterObjectDeployment
);
