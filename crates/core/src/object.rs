//! Helpers for moving between typed resources and unstructured objects.

use std::collections::BTreeMap;

use kube::api::{DynamicObject, TypeMeta};
use kube::core::GroupVersionKind;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Split `group/version` (or bare `version` for the core group).
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version),
    }
}

pub fn api_version_of(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() { gvk.version.clone() } else { format!("{}/{}", gvk.group, gvk.version) }
}

/// `group/version/Kind` key, `version/Kind` for the core group.
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

pub fn gvk_from_parts(api_version: &str, kind: &str) -> GroupVersionKind {
    let (g, v) = split_api_version(api_version);
    GroupVersionKind::gvk(g, v, kind)
}

pub fn gvk_of_value(v: &Value) -> Option<GroupVersionKind> {
    let api_version = v.get("apiVersion")?.as_str()?;
    let kind = v.get("kind")?.as_str()?;
    if api_version.is_empty() || kind.is_empty() {
        return None;
    }
    Some(gvk_from_parts(api_version, kind))
}

pub fn gvk_of_dynamic(obj: &DynamicObject) -> Option<GroupVersionKind> {
    let types = obj.types.as_ref()?;
    Some(gvk_from_parts(&types.api_version, &types.kind))
}

pub fn type_meta(gvk: &GroupVersionKind) -> TypeMeta {
    TypeMeta { api_version: api_version_of(gvk), kind: gvk.kind.clone() }
}

/// Serialize any resource into its unstructured form.
pub fn to_dynamic<T: Serialize>(obj: &T) -> Result<DynamicObject, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(obj)?)
}

pub fn from_dynamic<T: DeserializeOwned>(obj: &DynamicObject) -> Result<T, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(obj)?)
}

pub fn value_to_dynamic(v: Value) -> Result<DynamicObject, serde_json::Error> {
    serde_json::from_value(v)
}

pub fn labels_of(obj: &DynamicObject) -> BTreeMap<String, String> {
    obj.metadata.labels.clone().unwrap_or_default()
}

/// Identity of a namespaced or cluster-scoped object of a known kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub group: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn of(gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Self {
        Self { group: gvk.group.clone(), kind: gvk.kind.clone(), namespace: namespace.map(str::to_string), name: name.to_string() }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let gk = if self.group.is_empty() { self.kind.clone() } else { format!("{}.{}", self.kind, self.group) };
        match &self.namespace {
            Some(ns) if !ns.is_empty() => write!(f, "{} {}/{}", gk, ns, self.name),
            _ => write!(f, "{} {}", gk, self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn gvk_helpers_handle_core_group() {
        let gvk = gvk_of_value(&json!({"apiVersion": "v1", "kind": "ConfigMap"})).unwrap();
        assert_eq!(gvk.group, "");
        assert_eq!(gvk_key(&gvk), "v1/ConfigMap");
        let apps = gvk_from_parts("apps/v1", "Deployment");
        assert_eq!(api_version_of(&apps), "apps/v1");
        assert!(gvk_of_value(&json!({"kind": "X"})).is_none());
    }

    #[test]
    fn dynamic_round_trip_keeps_payload() {
        let obj = value_to_dynamic(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "cm", "namespace": "ns", "labels": {"a": "b"}},
            "data": {"k": "v"}
        }))
        .unwrap();
        assert_eq!(gvk_of_dynamic(&obj).unwrap().kind, "ConfigMap");
        assert_eq!(obj.data["data"]["k"], "v");
        assert_eq!(labels_of(&obj).get("a").map(String::as_str), Some("b"));
    }
}
