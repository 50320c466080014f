//! In-memory apiserver for tests.
//!
//! Tracks uid, resourceVersion, generation, finalizers and deletion
//! timestamps, records every write and fans changes out to watchers.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use rustc_hash::FxHashSet;
use serde_json::{json, Value};

use pko_core::object::{gvk_key, gvk_of_dynamic, labels_of};
use pko_core::LabelSelector;

use crate::merge::{apply_merge, json_merge_patch};
use crate::{describe, ApiError, ApiResult, ObjectApi, ObjectReader, Propagation, WatchEvent, WatchSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Create,
    Update,
    Apply,
    Patch,
    Status,
    Delete,
}

/// A recorded write request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Write {
    pub kind: WriteKind,
    pub gvk: String,
    pub namespace: Option<String>,
    pub name: String,
}

type Key = (String, Option<String>, String);

struct Subscriber {
    gvk: String,
    selector: LabelSelector,
    tx: mpsc::UnboundedSender<ApiResult<WatchEvent>>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, DynamicObject>,
    writes: Vec<Write>,
    watchers: Vec<Subscriber>,
    failures: Vec<(WriteKind, String, ApiError)>,
    resource_version: u64,
}

const CLUSTER_SCOPED: &[&str] = &[
    "v1/Namespace",
    "v1/Node",
    "v1/PersistentVolume",
    "rbac.authorization.k8s.io/v1/ClusterRole",
    "rbac.authorization.k8s.io/v1/ClusterRoleBinding",
    "apiextensions.k8s.io/v1/CustomResourceDefinition",
    "storage.k8s.io/v1/StorageClass",
    "scheduling.k8s.io/v1/PriorityClass",
];

pub struct MockApi {
    state: Mutex<State>,
    cluster_scoped: Mutex<FxHashSet<String>>,
}

impl Default for MockApi {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::default()),
            cluster_scoped: Mutex::new(CLUSTER_SCOPED.iter().map(|s| s.to_string()).collect()),
        }
    }
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_cluster_scoped(&self, gvk: &GroupVersionKind) {
        self.cluster_scoped.lock().unwrap_or_else(|p| p.into_inner()).insert(gvk_key(gvk));
    }

    fn namespaced(&self, gvk: &GroupVersionKind) -> bool {
        let key = gvk_key(gvk);
        if gvk.group == pko_core::apis::GROUP && gvk.kind.starts_with("Cluster") {
            return false;
        }
        !self.cluster_scoped.lock().unwrap_or_else(|p| p.into_inner()).contains(&key)
    }

    fn key(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Key {
        let ns = if self.namespaced(gvk) { namespace.map(str::to_string) } else { None };
        (gvk_key(gvk), ns, name.to_string())
    }

    fn key_of(&self, obj: &DynamicObject) -> ApiResult<(GroupVersionKind, Key)> {
        let gvk = gvk_of_dynamic(obj).ok_or_else(|| ApiError::Validation("object has no apiVersion/kind".into()))?;
        let name = obj.metadata.name.as_deref().filter(|n| !n.is_empty());
        let name = name.ok_or_else(|| ApiError::Validation("object has no name".into()))?;
        if self.namespaced(&gvk) && obj.metadata.namespace.as_deref().unwrap_or("").is_empty() {
            return Err(ApiError::Validation(format!("namespace required for {}", gvk_key(&gvk))));
        }
        let key = self.key(&gvk, obj.metadata.namespace.as_deref(), name);
        Ok((gvk, key))
    }

    /// Seed an object as-is, including status. Not recorded as a write.
    pub fn insert(&self, obj: DynamicObject) -> DynamicObject {
        let Ok((_, key)) = self.key_of(&obj) else { return obj };
        let mut st = self.state();
        let mut obj = obj;
        st.resource_version += 1;
        obj.metadata.resource_version = Some(st.resource_version.to_string());
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        if obj.metadata.generation.is_none() {
            obj.metadata.generation = Some(1);
        }
        let old = st.objects.insert(key.clone(), obj.clone());
        notify(&mut st, &key, old.as_ref(), Some(&obj));
        obj
    }

    /// Synchronous read for assertions.
    pub fn object(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Option<DynamicObject> {
        let key = self.key(gvk, namespace, name);
        self.state().objects.get(&key).cloned()
    }

    pub fn objects(&self, gvk: &GroupVersionKind) -> Vec<DynamicObject> {
        let key = gvk_key(gvk);
        self.state().objects.iter().filter(|((g, _, _), _)| *g == key).map(|(_, o)| o.clone()).collect()
    }

    pub fn writes(&self) -> Vec<Write> {
        self.state().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state().writes.clear();
    }

    /// Make the next write of `kind` against `name` fail with `err`.
    pub fn fail_next(&self, kind: WriteKind, name: &str, err: ApiError) {
        self.state().failures.push((kind, name.to_string(), err));
    }

    fn begin(&self, st: &mut State, kind: WriteKind, key: &Key) -> ApiResult<()> {
        if let Some(pos) = st.failures.iter().position(|(k, n, _)| *k == kind && *n == key.2) {
            let (_, _, err) = st.failures.remove(pos);
            return Err(err);
        }
        st.writes.push(Write { kind, gvk: key.0.clone(), namespace: key.1.clone(), name: key.2.clone() });
        Ok(())
    }

    /// Persist `next` in place of `prev`, bumping the resourceVersion and the
    /// generation when anything outside metadata and status changed.
    fn store(&self, st: &mut State, key: Key, prev: Option<&DynamicObject>, mut next: DynamicObject) -> ApiResult<DynamicObject> {
        st.resource_version += 1;
        next.metadata.resource_version = Some(st.resource_version.to_string());
        match prev {
            Some(p) => {
                let generation = p.metadata.generation.unwrap_or(1);
                next.metadata.generation =
                    Some(if content_of(p) != content_of(&next) { generation + 1 } else { generation });
            }
            None => next.metadata.generation = Some(1),
        }
        let finalizers_empty = next.metadata.finalizers.as_ref().map_or(true, Vec::is_empty);
        if next.metadata.deletion_timestamp.is_some() && finalizers_empty {
            st.objects.remove(&key);
            notify(st, &key, prev, None);
            return Ok(next);
        }
        st.objects.insert(key.clone(), next.clone());
        notify(st, &key, prev, Some(&next));
        Ok(next)
    }
}

/// Everything but metadata and status; changes here bump the generation.
fn content_of(obj: &DynamicObject) -> Value {
    let mut v = obj.data.clone();
    if let Some(m) = v.as_object_mut() {
        m.remove("status");
        m.remove("metadata");
    }
    v
}

fn notify(st: &mut State, key: &Key, before: Option<&DynamicObject>, after: Option<&DynamicObject>) {
    st.watchers.retain(|w| !w.tx.is_closed());
    for w in st.watchers.iter().filter(|w| w.gvk == key.0) {
        let was = before.map_or(false, |o| w.selector.matches(&labels_of(o)));
        let now = after.map_or(false, |o| w.selector.matches(&labels_of(o)));
        let ev = match (was, now, after, before) {
            (_, true, Some(o), _) => WatchEvent::Applied(o.clone()),
            (true, false, _, Some(o)) => WatchEvent::Deleted(after.unwrap_or(o).clone()),
            _ => continue,
        };
        let _ = w.tx.unbounded_send(Ok(ev));
    }
}

fn strip_status(obj: &mut DynamicObject) {
    if let Some(m) = obj.data.as_object_mut() {
        m.remove("status");
    }
}

fn now() -> Time {
    Time(k8s_openapi::chrono::Utc::now())
}

fn to_object(v: Value) -> ApiResult<DynamicObject> {
    Ok(serde_json::from_value(v)?)
}

#[async_trait::async_trait]
impl ObjectReader for MockApi {
    async fn get(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> ApiResult<Option<DynamicObject>> {
        Ok(self.object(gvk, namespace, name))
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> ApiResult<Vec<DynamicObject>> {
        let key = gvk_key(gvk);
        let namespaced = self.namespaced(gvk);
        let st = self.state();
        Ok(st
            .objects
            .iter()
            .filter(|((g, ns, _), _)| *g == key && (!namespaced || namespace.is_none() || ns.as_deref() == namespace))
            .filter(|(_, o)| selector.matches(&labels_of(o)))
            .map(|(_, o)| o.clone())
            .collect())
    }
}

#[async_trait::async_trait]
impl ObjectApi for MockApi {
    async fn create(&self, obj: &DynamicObject) -> ApiResult<DynamicObject> {
        let (_, key) = self.key_of(obj)?;
        let mut st = self.state();
        self.begin(&mut st, WriteKind::Create, &key)?;
        if st.objects.contains_key(&key) {
            return Err(ApiError::AlreadyExists(format!("{} already exists", key.2)));
        }
        let mut next = obj.clone();
        strip_status(&mut next);
        next.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        next.metadata.creation_timestamp = Some(now());
        next.metadata.deletion_timestamp = None;
        self.store(&mut st, key, None, next)
    }

    async fn update(&self, obj: &DynamicObject) -> ApiResult<DynamicObject> {
        let (_, key) = self.key_of(obj)?;
        let mut st = self.state();
        self.begin(&mut st, WriteKind::Update, &key)?;
        let live = st.objects.get(&key).cloned().ok_or_else(|| ApiError::NotFound(key.2.clone()))?;
        if let Some(rv) = obj.metadata.resource_version.as_deref() {
            if Some(rv) != live.metadata.resource_version.as_deref() {
                return Err(ApiError::Conflict(format!("{} has been modified", key.2)));
            }
        }
        let mut next = obj.clone();
        strip_status(&mut next);
        if let Some(status) = live.data.get("status") {
            if let Some(m) = next.data.as_object_mut() {
                m.insert("status".into(), status.clone());
            }
        }
        next.metadata.uid = live.metadata.uid.clone();
        next.metadata.creation_timestamp = live.metadata.creation_timestamp.clone();
        next.metadata.deletion_timestamp = live.metadata.deletion_timestamp.clone();
        self.store(&mut st, key, Some(&live), next)
    }

    async fn apply(&self, obj: &DynamicObject) -> ApiResult<DynamicObject> {
        let (_, key) = self.key_of(obj)?;
        let mut st = self.state();
        self.begin(&mut st, WriteKind::Apply, &key)?;
        let mut desired = serde_json::to_value(obj)?;
        if let Some(m) = desired.as_object_mut() {
            m.remove("status");
            if let Some(meta) = m.get_mut("metadata").and_then(Value::as_object_mut) {
                for k in ["resourceVersion", "uid", "creationTimestamp", "deletionTimestamp", "generation"] {
                    meta.remove(k);
                }
            }
        }
        match st.objects.get(&key).cloned() {
            Some(live) => {
                let mut merged = serde_json::to_value(&live)?;
                apply_merge(&mut merged, &desired);
                let next = to_object(merged)?;
                self.store(&mut st, key, Some(&live), next)
            }
            None => {
                let mut next = to_object(desired)?;
                next.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
                next.metadata.creation_timestamp = Some(now());
                self.store(&mut st, key, None, next)
            }
        }
    }

    async fn patch_merge(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> ApiResult<DynamicObject> {
        let key = self.key(gvk, namespace, name);
        let mut st = self.state();
        self.begin(&mut st, WriteKind::Patch, &key)?;
        let live = st.objects.get(&key).cloned().ok_or_else(|| ApiError::NotFound(describe(gvk, namespace, name)))?;
        let mut merged = serde_json::to_value(&live)?;
        let mut patch = patch.clone();
        if let Some(m) = patch.as_object_mut() {
            m.remove("status");
        }
        json_merge_patch(&mut merged, &patch);
        self.store(&mut st, key, Some(&live), to_object(merged)?)
    }

    async fn update_status(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        status: &Value,
    ) -> ApiResult<DynamicObject> {
        let key = self.key(gvk, namespace, name);
        let mut st = self.state();
        self.begin(&mut st, WriteKind::Status, &key)?;
        let live = st.objects.get(&key).cloned().ok_or_else(|| ApiError::NotFound(describe(gvk, namespace, name)))?;
        let mut merged = serde_json::to_value(&live)?;
        json_merge_patch(&mut merged, &json!({ "status": status }));
        self.store(&mut st, key, Some(&live), to_object(merged)?)
    }

    async fn delete(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        _propagation: Propagation,
    ) -> ApiResult<()> {
        let key = self.key(gvk, namespace, name);
        let mut st = self.state();
        self.begin(&mut st, WriteKind::Delete, &key)?;
        let Some(live) = st.objects.get(&key).cloned() else { return Ok(()) };
        let mut next = live.clone();
        if next.metadata.deletion_timestamp.is_none() {
            next.metadata.deletion_timestamp = Some(now());
        }
        self.store(&mut st, key, Some(&live), next).map(|_| ())
    }

    async fn is_namespaced(&self, gvk: &GroupVersionKind) -> ApiResult<bool> {
        Ok(self.namespaced(gvk))
    }
}

#[async_trait::async_trait]
impl WatchSource for MockApi {
    async fn watch(
        &self,
        gvk: &GroupVersionKind,
        selector: &LabelSelector,
    ) -> ApiResult<BoxStream<'static, ApiResult<WatchEvent>>> {
        let (tx, rx) = mpsc::unbounded();
        let initial = self.list(gvk, None, selector).await?;
        let _ = tx.unbounded_send(Ok(WatchEvent::Restarted(initial)));
        self.state().watchers.push(Subscriber { gvk: gvk_key(gvk), selector: selector.clone(), tx });
        Ok(rx.boxed())
    }
}
