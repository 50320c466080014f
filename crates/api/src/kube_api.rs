//! Client-backed implementation with a per-kind discovery cache.

use std::sync::RwLock;
use std::time::Instant;

use futures::StreamExt;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::discovery::{self, Scope};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::Client;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use tracing::{debug, info};

use pko_core::object::{gvk_key, gvk_of_dynamic};
use pko_core::{LabelSelector, FIELD_OWNER};

use crate::{describe, ApiError, ApiResult, ObjectApi, ObjectReader, Propagation, WatchEvent, WatchSource};

pub struct KubeApi {
    client: Client,
    resources: RwLock<FxHashMap<String, (ApiResource, bool)>>,
}

impl KubeApi {
    pub fn new(client: Client) -> Self {
        Self { client, resources: RwLock::new(FxHashMap::default()) }
    }

    pub async fn try_default() -> ApiResult<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn resolve(&self, gvk: &GroupVersionKind) -> ApiResult<(ApiResource, bool)> {
        let key = gvk_key(gvk);
        if let Some(hit) = self.resources.read().ok().and_then(|m| m.get(&key).cloned()) {
            return Ok(hit);
        }
        let t0 = Instant::now();
        let (ar, caps) = discovery::pinned_kind(&self.client, gvk).await.map_err(|e| match e {
            kube::Error::Discovery(_) => ApiError::NotFound(format!("kind not served: {}", key)),
            e => match ApiError::from(e) {
                ApiError::NotFound(_) => ApiError::NotFound(format!("kind not served: {}", key)),
                other => other,
            },
        })?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        debug!(gvk = %key, namespaced, took_ms = %t0.elapsed().as_millis(), "discovery resolved");
        if let Ok(mut m) = self.resources.write() {
            m.insert(key, (ar.clone(), namespaced));
        }
        Ok((ar, namespaced))
    }

    async fn api_for(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> ApiResult<Api<DynamicObject>> {
        let (ar, namespaced) = self.resolve(gvk).await?;
        Ok(match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            (true, None) => Api::all_with(self.client.clone(), &ar),
            (false, _) => Api::all_with(self.client.clone(), &ar),
        })
    }

    async fn api_for_object(&self, obj: &DynamicObject) -> ApiResult<(Api<DynamicObject>, String)> {
        let gvk = gvk_of_dynamic(obj).ok_or_else(|| ApiError::Validation("object has no apiVersion/kind".into()))?;
        let name = obj.metadata.name.clone().ok_or_else(|| ApiError::Validation("object has no name".into()))?;
        let (_, namespaced) = self.resolve(&gvk).await?;
        let ns = obj.metadata.namespace.as_deref();
        if namespaced && ns.is_none() {
            return Err(ApiError::Validation(format!("namespace required for {}", gvk_key(&gvk))));
        }
        Ok((self.api_for(&gvk, ns).await?, name))
    }
}

fn observe(verb: &'static str, t0: Instant) {
    counter!("pko_api_requests_total", 1u64, "verb" => verb);
    histogram!("pko_api_request_ms", t0.elapsed().as_secs_f64() * 1000.0, "verb" => verb);
}

#[async_trait::async_trait]
impl ObjectReader for KubeApi {
    async fn get(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> ApiResult<Option<DynamicObject>> {
        let t0 = Instant::now();
        let api = self.api_for(gvk, namespace).await?;
        let res = api.get_opt(name).await?;
        observe("get", t0);
        Ok(res)
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> ApiResult<Vec<DynamicObject>> {
        let t0 = Instant::now();
        let api = self.api_for(gvk, namespace).await?;
        let mut lp = ListParams::default();
        if !selector.is_empty() {
            lp = lp.labels(&selector.to_query());
        }
        let items = api.list(&lp).await?.items;
        observe("list", t0);
        Ok(items)
    }
}

#[async_trait::async_trait]
impl ObjectApi for KubeApi {
    async fn create(&self, obj: &DynamicObject) -> ApiResult<DynamicObject> {
        let t0 = Instant::now();
        let (api, name) = self.api_for_object(obj).await?;
        let created = api.create(&PostParams::default(), obj).await?;
        observe("create", t0);
        info!(name = %name, "created");
        Ok(created)
    }

    async fn update(&self, obj: &DynamicObject) -> ApiResult<DynamicObject> {
        let t0 = Instant::now();
        let (api, name) = self.api_for_object(obj).await?;
        let updated = api.replace(&name, &PostParams::default(), obj).await?;
        observe("update", t0);
        Ok(updated)
    }

    async fn apply(&self, obj: &DynamicObject) -> ApiResult<DynamicObject> {
        let t0 = Instant::now();
        let (api, name) = self.api_for_object(obj).await?;
        let mut body = serde_json::to_value(obj)?;
        if let Some(meta) = body.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.remove("managedFields");
            meta.remove("resourceVersion");
        }
        let pp = PatchParams::apply(FIELD_OWNER).force();
        let applied = api.patch(&name, &pp, &Patch::Apply(&body)).await?;
        observe("apply", t0);
        Ok(applied)
    }

    async fn patch_merge(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> ApiResult<DynamicObject> {
        let t0 = Instant::now();
        let api = self.api_for(gvk, namespace).await?;
        let patched = api.patch(name, &PatchParams::default(), &Patch::Merge(patch)).await?;
        observe("patch", t0);
        Ok(patched)
    }

    async fn update_status(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        status: &Value,
    ) -> ApiResult<DynamicObject> {
        let t0 = Instant::now();
        let api = self.api_for(gvk, namespace).await?;
        let patch = json!({ "status": status });
        let patched = api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        observe("update_status", t0);
        Ok(patched)
    }

    async fn delete(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        propagation: Propagation,
    ) -> ApiResult<()> {
        let t0 = Instant::now();
        let api = self.api_for(gvk, namespace).await?;
        let dp = match propagation {
            Propagation::Foreground => DeleteParams::foreground(),
            Propagation::Background => DeleteParams::background(),
            Propagation::Orphan => DeleteParams::orphan(),
        };
        match api.delete(name, &dp).await.map_err(ApiError::from) {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        observe("delete", t0);
        info!(object = %describe(gvk, namespace, name), "deleted");
        Ok(())
    }

    async fn is_namespaced(&self, gvk: &GroupVersionKind) -> ApiResult<bool> {
        Ok(self.resolve(gvk).await?.1)
    }
}

#[async_trait::async_trait]
impl WatchSource for KubeApi {
    async fn watch(
        &self,
        gvk: &GroupVersionKind,
        selector: &LabelSelector,
    ) -> ApiResult<futures::stream::BoxStream<'static, ApiResult<WatchEvent>>> {
        let api = self.api_for(gvk, None).await?;
        let mut cfg = watcher::Config::default();
        if !selector.is_empty() {
            cfg = cfg.labels(&selector.to_query());
        }
        info!(gvk = %gvk_key(gvk), "watcher started");
        let stream = watcher::watcher(api, cfg).default_backoff().map(|ev| match ev {
            Ok(Event::Applied(o)) => Ok(WatchEvent::Applied(o)),
            Ok(Event::Deleted(o)) => Ok(WatchEvent::Deleted(o)),
            Ok(Event::Restarted(list)) => Ok(WatchEvent::Restarted(list)),
            Err(e) => Err(ApiError::Internal(e.to_string())),
        });
        Ok(stream.boxed())
    }
}
