//! Dynamic cache: informers started on demand per GVK, refcounted by owner.
//!
//! `watch(owner, gvk)` starts an informer on first use and blocks until it
//! has synced; later owners attach to the running informer. `free(owner)`
//! drops the owner from every GVK and stops informers nobody watches any
//! more. Only objects carrying the cache label are seen.

#![forbid(unsafe_code)]

mod informer;
mod mock;
mod relay;

use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc;
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use metrics::gauge;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

use pko_api::{ApiError, ApiResult, ObjectReader, WatchSource};
use pko_core::meta::{CACHE_LABEL, CACHE_LABEL_VALUE};
use pko_core::object::gvk_key;
use pko_core::LabelSelector;
use pko_ownership::{OwnerIdentity, OwnerKey};

use informer::Informer;
use relay::Relay;

pub use mock::MockCache;
pub use relay::{RelayMode, Subscription};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("informer for {0} did not sync within {1:?}")]
    SyncTimeout(String, Duration),
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl CacheError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SyncTimeout(..) => true,
            Self::Api(e) => e.is_retryable(),
        }
    }
}

/// Cache reads plus owner-scoped watch management.
#[async_trait::async_trait]
pub trait ObjectWatcher: ObjectReader {
    /// Ensure objects of `gvk` are cached and remember `owner` as a watcher.
    async fn watch(&self, owner: &OwnerIdentity, gvk: &GroupVersionKind) -> Result<(), CacheError>;

    /// Release every watch held by `owner`.
    async fn free(&self, owner: &OwnerIdentity) -> Result<(), CacheError>;

    async fn owners_for_gvk(&self, gvk: &GroupVersionKind) -> Vec<OwnerIdentity>;
}

/// Selector every informer runs with.
pub fn cache_selector() -> LabelSelector {
    LabelSelector::from_labels([(CACHE_LABEL.to_string(), CACHE_LABEL_VALUE.to_string())].into_iter().collect())
}

pub struct DynamicCache {
    source: Arc<dyn WatchSource>,
    informers: Mutex<FxHashMap<String, Informer>>,
    relay: Relay,
    sync_timeout: Duration,
}

impl DynamicCache {
    pub fn new(source: Arc<dyn WatchSource>, sync_timeout: Duration) -> Self {
        Self { source, informers: Mutex::new(FxHashMap::default()), relay: Relay::default(), sync_timeout }
    }

    /// Stream of owners to reconcile after changes to cached objects.
    pub fn subscribe(&self, sub: Subscription) -> mpsc::UnboundedReceiver<OwnerKey> {
        self.relay.subscribe(sub)
    }

    fn sample(informers: &FxHashMap<String, Informer>) {
        gauge!("dynamic_cache_informers", informers.len() as f64);
    }
}

#[async_trait::async_trait]
impl ObjectWatcher for DynamicCache {
    async fn watch(&self, owner: &OwnerIdentity, gvk: &GroupVersionKind) -> Result<(), CacheError> {
        let key = gvk_key(gvk);
        let attached = {
            let informers = self.informers.lock().await;
            informers.get(&key).map(|inf| {
                inf.add_owner(owner);
                (inf.epoch.clone(), inf.id())
            })
        };
        let (mut epoch, waited_on) = match attached {
            Some(attached) => attached,
            None => {
                // Discovery and the initial request happen without holding the table lock.
                let stream = self.source.watch(gvk, &cache_selector()).await?;
                let fresh = Informer::spawn(gvk.clone(), stream, self.relay.clone());
                let mut informers = self.informers.lock().await;
                let attached = match informers.entry(key.clone()) {
                    Entry::Occupied(running) => {
                        // Lost a race with another first watch; `fresh` is dropped and stops.
                        running.get().add_owner(owner);
                        (running.get().epoch.clone(), running.get().id())
                    }
                    Entry::Vacant(slot) => {
                        info!(owner = %owner, gvk = %key, "adding new watcher");
                        fresh.add_owner(owner);
                        let epoch = fresh.epoch.clone();
                        let id = fresh.id();
                        slot.insert(fresh);
                        (epoch, id)
                    }
                };
                Self::sample(&informers);
                attached
            }
        };

        let synced = matches!(tokio::time::timeout(self.sync_timeout, epoch.wait_for(|e| *e > 0)).await, Ok(Ok(_)));
        if synced {
            return Ok(());
        }
        // Only the informer waited on is released, and only once nobody else is attached.
        let mut informers = self.informers.lock().await;
        if let Some(inf) = informers.get(&key).filter(|inf| inf.id() == waited_on) {
            if inf.remove_owner(owner) {
                warn!(gvk = %key, "informer did not sync; releasing it");
                informers.remove(&key);
                Self::sample(&informers);
            }
        }
        Err(CacheError::SyncTimeout(key, self.sync_timeout))
    }

    async fn free(&self, owner: &OwnerIdentity) -> Result<(), CacheError> {
        let mut informers = self.informers.lock().await;
        informers.retain(|key, inf| {
            let mut owners = inf.owners.lock().unwrap_or_else(|p| p.into_inner());
            if owners.remove(&owner.uid).is_some() && owners.is_empty() {
                info!(owner = %owner, gvk = %key, "releasing watcher");
                return false;
            }
            true
        });
        Self::sample(&informers);
        Ok(())
    }

    async fn owners_for_gvk(&self, gvk: &GroupVersionKind) -> Vec<OwnerIdentity> {
        let informers = self.informers.lock().await;
        informers.get(&gvk_key(gvk)).map(Informer::owners).unwrap_or_default()
    }
}

fn not_started(gvk: &GroupVersionKind) -> ApiError {
    ApiError::NotReady(format!("cache access before calling watch for {}", gvk_key(gvk)))
}

#[async_trait::async_trait]
impl ObjectReader for DynamicCache {
    async fn get(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> ApiResult<Option<DynamicObject>> {
        let informers = self.informers.lock().await;
        let inf = informers.get(&gvk_key(gvk)).ok_or_else(|| not_started(gvk))?;
        let snap = inf.snapshot.load();
        let key = (namespace.filter(|ns| !ns.is_empty()).map(str::to_string), name.to_string());
        Ok(snap.objects.get(&key).cloned())
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> ApiResult<Vec<DynamicObject>> {
        let informers = self.informers.lock().await;
        let inf = informers.get(&gvk_key(gvk)).ok_or_else(|| not_started(gvk))?;
        let snap = inf.snapshot.load();
        Ok(snap
            .objects
            .values()
            .filter(|o| namespace.is_none() || o.metadata.namespace.as_deref() == namespace)
            .filter(|o| selector.matches(&o.metadata.labels.clone().unwrap_or_default()))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use pko_api::{MockApi, ObjectApi};
    use pko_core::object::value_to_dynamic;
    use pko_ownership::{NativeStrategy, OwnerKind};
    use serde_json::json;

    fn owner(name: &str) -> OwnerIdentity {
        OwnerIdentity {
            api_version: "package-operator.run/v1alpha1".into(),
            kind: "ObjectSet".into(),
            name: name.into(),
            namespace: Some("ns".into()),
            uid: format!("uid-{}", name),
        }
    }

    fn cm(name: &str, cached: bool) -> DynamicObject {
        let labels = if cached { json!({ CACHE_LABEL: CACHE_LABEL_VALUE }) } else { json!({}) };
        value_to_dynamic(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {
                "name": name, "namespace": "ns", "labels": labels,
                "ownerReferences": [{
                    "apiVersion": "package-operator.run/v1alpha1", "kind": "ObjectSet",
                    "name": "rev1", "uid": "uid-rev1", "controller": true
                }]
            }
        }))
        .unwrap()
    }

    fn configmaps() -> GroupVersionKind {
        GroupVersionKind::gvk("", "v1", "ConfigMap")
    }

    #[tokio::test]
    async fn reads_before_watch_are_rejected() {
        let cache = DynamicCache::new(Arc::new(MockApi::new()), Duration::from_secs(1));
        let err = cache.get(&configmaps(), Some("ns"), "a").await.unwrap_err();
        assert!(matches!(err, ApiError::NotReady(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn watch_syncs_and_filters_by_cache_label() {
        let api = Arc::new(MockApi::new());
        api.insert(cm("cached", true));
        api.insert(cm("plain", false));
        let cache = DynamicCache::new(api.clone(), Duration::from_secs(5));
        cache.watch(&owner("rev1"), &configmaps()).await.unwrap();

        assert!(cache.get(&configmaps(), Some("ns"), "cached").await.unwrap().is_some());
        assert!(cache.get(&configmaps(), Some("ns"), "plain").await.unwrap().is_none());
        let all = cache.list(&configmaps(), Some("ns"), &LabelSelector::default()).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn informers_are_refcounted_by_owner() {
        let api = Arc::new(MockApi::new());
        let cache = DynamicCache::new(api, Duration::from_secs(5));
        cache.watch(&owner("rev1"), &configmaps()).await.unwrap();
        cache.watch(&owner("rev2"), &configmaps()).await.unwrap();
        assert_eq!(cache.owners_for_gvk(&configmaps()).await.len(), 2);

        cache.free(&owner("rev1")).await.unwrap();
        assert!(cache.get(&configmaps(), Some("ns"), "x").await.is_ok());

        cache.free(&owner("rev2")).await.unwrap();
        assert!(cache.owners_for_gvk(&configmaps()).await.is_empty());
        assert!(cache.get(&configmaps(), Some("ns"), "x").await.is_err());
    }

    #[tokio::test]
    async fn changes_are_relayed_to_controller() {
        let api = Arc::new(MockApi::new());
        let cache = DynamicCache::new(api.clone(), Duration::from_secs(5));
        let mut rx = cache.subscribe(Subscription {
            kind: OwnerKind { group: "package-operator.run".into(), kind: "ObjectSet".into(), namespaced: true },
            strategy: Arc::new(NativeStrategy),
            mode: RelayMode::Controller,
        });
        cache.watch(&owner("rev1"), &configmaps()).await.unwrap();
        api.create(&cm("new", true)).await.unwrap();

        let key = tokio::time::timeout(Duration::from_secs(5), rx.next()).await.unwrap().unwrap();
        assert_eq!(key, OwnerKey { namespace: Some("ns".into()), name: "rev1".into() });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.get(&configmaps(), Some("ns"), "new").await.unwrap().is_some());
    }

    /// Serves ConfigMaps from the mock; Secret watches stall in discovery
    /// and ServiceAccount watches connect but never list.
    struct Stalling(Arc<MockApi>);

    #[async_trait::async_trait]
    impl WatchSource for Stalling {
        async fn watch(
            &self,
            gvk: &GroupVersionKind,
            selector: &LabelSelector,
        ) -> ApiResult<futures::stream::BoxStream<'static, ApiResult<pko_api::WatchEvent>>> {
            match gvk.kind.as_str() {
                "Secret" => futures::future::pending().await,
                "ServiceAccount" => Ok(futures::stream::pending().boxed()),
                _ => self.0.watch(gvk, selector).await,
            }
        }
    }

    #[tokio::test]
    async fn slow_first_watch_does_not_block_other_kinds() {
        let api = Arc::new(MockApi::new());
        api.insert(cm("cached", true));
        let cache = Arc::new(DynamicCache::new(Arc::new(Stalling(api)), Duration::from_secs(30)));
        cache.watch(&owner("rev1"), &configmaps()).await.unwrap();

        let stalled = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.watch(&owner("rev1"), &GroupVersionKind::gvk("", "v1", "Secret")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let read = tokio::time::timeout(Duration::from_secs(1), cache.get(&configmaps(), Some("ns"), "cached")).await;
        assert!(read.expect("read not blocked by the stalled watch").unwrap().is_some());
        let other = tokio::time::timeout(Duration::from_secs(1), cache.watch(&owner("rev2"), &configmaps())).await;
        assert!(other.expect("attach not blocked by the stalled watch").is_ok());
        stalled.abort();
    }

    #[tokio::test]
    async fn sync_timeout_keeps_informers_other_owners_wait_on() {
        let api = Arc::new(MockApi::new());
        let cache = Arc::new(DynamicCache::new(Arc::new(Stalling(api)), Duration::from_millis(300)));
        let accounts = GroupVersionKind::gvk("", "v1", "ServiceAccount");

        let first = {
            let (cache, gvk) = (cache.clone(), accounts.clone());
            tokio::spawn(async move { cache.watch(&owner("rev1"), &gvk).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = {
            let (cache, gvk) = (cache.clone(), accounts.clone());
            tokio::spawn(async move { cache.watch(&owner("rev2"), &gvk).await })
        };

        assert!(matches!(first.await.unwrap(), Err(CacheError::SyncTimeout(..))));
        let owners = cache.owners_for_gvk(&accounts).await;
        assert_eq!(owners.iter().map(|o| o.name.as_str()).collect::<Vec<_>>(), vec!["rev2"]);

        assert!(matches!(second.await.unwrap(), Err(CacheError::SyncTimeout(..))));
        assert!(cache.owners_for_gvk(&accounts).await.is_empty());
        assert!(cache.get(&accounts, Some("ns"), "x").await.is_err());
    }
}
