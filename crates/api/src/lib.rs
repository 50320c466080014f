//! Object access façade over the Kubernetes API.
//!
//! Controllers depend on the [`ObjectReader`] and [`ObjectApi`] traits only.
//! [`KubeApi`] talks to an apiserver through a discovery cache; [`MockApi`]
//! keeps objects in memory for tests and feeds the dynamic cache through
//! [`WatchSource`].

#![forbid(unsafe_code)]

mod kube_api;
mod merge;
mod mock;

use futures::stream::BoxStream;
use kube::api::DynamicObject;
use kube::core::{GroupVersionKind, ObjectMeta};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use pko_core::object::{from_dynamic, gvk_key, to_dynamic};
use pko_core::LabelSelector;

pub use kube_api::KubeApi;
pub use merge::{apply_merge, json_merge_patch, merge_patch_diff};
pub use mock::{MockApi, Write, WriteKind};

/// API errors, classified by how callers react to them.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    /// Read from a cache that has no informer for the kind yet.
    #[error("not_ready: {0}")]
    NotReady(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("kubernetes: {0}")]
    Kube(kube::Error),
    #[error("internal: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Errors the next reconcile is expected to get past on its own.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Validation(_) | Self::Serialization(_))
    }
}

impl From<kube::Error> for ApiError {
    fn from(e: kube::Error) -> Self {
        match &e {
            kube::Error::Api(resp) if resp.code == 404 => Self::NotFound(resp.message.clone()),
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                Self::AlreadyExists(resp.message.clone())
            }
            kube::Error::Api(resp) if resp.code == 409 => Self::Conflict(resp.message.clone()),
            kube::Error::Api(resp) if resp.code == 400 || resp.code == 422 => Self::Validation(resp.message.clone()),
            _ => Self::Kube(e),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Deletion propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    Foreground,
    Background,
    Orphan,
}

/// One change observed on a watched kind.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Applied(DynamicObject),
    Deleted(DynamicObject),
    /// Full relist; replaces everything seen before.
    Restarted(Vec<DynamicObject>),
}

/// Read side of object access, implemented by the API client and the cache.
#[async_trait::async_trait]
pub trait ObjectReader: Send + Sync {
    async fn get(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> ApiResult<Option<DynamicObject>>;

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> ApiResult<Vec<DynamicObject>>;
}

/// Write side of object access.
#[async_trait::async_trait]
pub trait ObjectApi: ObjectReader {
    async fn create(&self, obj: &DynamicObject) -> ApiResult<DynamicObject>;

    /// Full replace; a set resourceVersion must match the live object.
    async fn update(&self, obj: &DynamicObject) -> ApiResult<DynamicObject>;

    /// Server-side apply with the operator field manager, forcing conflicts.
    async fn apply(&self, obj: &DynamicObject) -> ApiResult<DynamicObject>;

    /// JSON merge patch against the main resource.
    async fn patch_merge(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> ApiResult<DynamicObject>;

    /// Merge patch of the status subresource.
    async fn update_status(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        status: &Value,
    ) -> ApiResult<DynamicObject>;

    /// Deleting an absent object succeeds.
    async fn delete(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        propagation: Propagation,
    ) -> ApiResult<()>;

    async fn is_namespaced(&self, gvk: &GroupVersionKind) -> ApiResult<bool>;
}

/// Source of watch streams for the dynamic cache.
#[async_trait::async_trait]
pub trait WatchSource: Send + Sync {
    async fn watch(
        &self,
        gvk: &GroupVersionKind,
        selector: &LabelSelector,
    ) -> ApiResult<BoxStream<'static, ApiResult<WatchEvent>>>;
}

// ----------------- Typed helpers -----------------

pub async fn get_as<K: DeserializeOwned, R: ObjectReader + ?Sized>(
    api: &R,
    gvk: &GroupVersionKind,
    namespace: Option<&str>,
    name: &str,
) -> ApiResult<Option<K>> {
    match api.get(gvk, namespace, name).await? {
        Some(obj) => Ok(Some(from_dynamic(&obj)?)),
        None => Ok(None),
    }
}

pub async fn list_as<K: DeserializeOwned, R: ObjectReader + ?Sized>(
    api: &R,
    gvk: &GroupVersionKind,
    namespace: Option<&str>,
    selector: &LabelSelector,
) -> ApiResult<Vec<K>> {
    let items = api.list(gvk, namespace, selector).await?;
    items.iter().map(|o| from_dynamic(o).map_err(ApiError::from)).collect()
}

pub async fn create_as<K: Serialize + DeserializeOwned>(api: &dyn ObjectApi, obj: &K) -> ApiResult<K> {
    let created = api.create(&to_dynamic(obj)?).await?;
    Ok(from_dynamic(&created)?)
}

pub async fn update_as<K: Serialize + DeserializeOwned>(api: &dyn ObjectApi, obj: &K) -> ApiResult<K> {
    let updated = api.update(&to_dynamic(obj)?).await?;
    Ok(from_dynamic(&updated)?)
}

/// Status write for a typed object. Fields present in `previous` but gone
/// from `status` are cleared; nothing is sent when the two are equal.
pub async fn patch_status<S: Serialize>(
    api: &dyn ObjectApi,
    gvk: &GroupVersionKind,
    namespace: Option<&str>,
    name: &str,
    previous: Option<&S>,
    status: &S,
) -> ApiResult<()> {
    let to = serde_json::to_value(status)?;
    let from = match previous {
        Some(p) => serde_json::to_value(p)?,
        None => Value::Object(Default::default()),
    };
    if from == to {
        return Ok(());
    }
    api.update_status(gvk, namespace, name, &merge_patch_diff(&from, &to)).await.map(|_| ())
}

pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers.as_ref().map_or(false, |f| f.iter().any(|x| x == finalizer))
}

async fn write_finalizers(
    api: &dyn ObjectApi,
    gvk: &GroupVersionKind,
    meta: &ObjectMeta,
    finalizers: Vec<String>,
) -> ApiResult<()> {
    let name = meta.name.as_deref().ok_or_else(|| ApiError::Validation("object has no name".into()))?;
    let patch = json!({ "metadata": { "finalizers": finalizers, "resourceVersion": meta.resource_version } });
    api.patch_merge(gvk, meta.namespace.as_deref(), name, &patch).await.map(|_| ())
}

/// Adds `finalizer` unless present. Returns true when a write happened.
pub async fn ensure_finalizer(
    api: &dyn ObjectApi,
    gvk: &GroupVersionKind,
    meta: &ObjectMeta,
    finalizer: &str,
) -> ApiResult<bool> {
    if has_finalizer(meta, finalizer) {
        return Ok(false);
    }
    let mut finalizers = meta.finalizers.clone().unwrap_or_default();
    finalizers.push(finalizer.to_string());
    write_finalizers(api, gvk, meta, finalizers).await?;
    Ok(true)
}

/// Drops `finalizer` if present. A vanished object counts as done.
pub async fn remove_finalizer(
    api: &dyn ObjectApi,
    gvk: &GroupVersionKind,
    meta: &ObjectMeta,
    finalizer: &str,
) -> ApiResult<bool> {
    if !has_finalizer(meta, finalizer) {
        return Ok(false);
    }
    let finalizers = meta.finalizers.iter().flatten().filter(|f| *f != finalizer).cloned().collect();
    match write_finalizers(api, gvk, meta, finalizers).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

pub(crate) fn describe(gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{} {}/{}", gvk_key(gvk), ns, name),
        None => format!("{} {}", gvk_key(gvk), name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{} failure", reason),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn kube_errors_are_classified() {
        assert!(ApiError::from(api_err(404, "NotFound")).is_not_found());
        assert!(ApiError::from(api_err(409, "AlreadyExists")).is_already_exists());
        assert!(ApiError::from(api_err(409, "Conflict")).is_conflict());
        let invalid = ApiError::from(api_err(422, "Invalid"));
        assert!(matches!(invalid, ApiError::Validation(_)));
        assert!(!invalid.is_retryable());
        assert!(ApiError::from(api_err(500, "InternalError")).is_retryable());
    }
}
