//! Synchronous cache over [`MockApi`] for controller tests.

use std::sync::{Arc, Mutex};

use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use rustc_hash::FxHashMap;

use pko_api::{ApiResult, MockApi, ObjectReader};
use pko_core::meta::{CACHE_LABEL, CACHE_LABEL_VALUE};
use pko_core::object::gvk_key;
use pko_core::LabelSelector;
use pko_ownership::OwnerIdentity;

use crate::{not_started, CacheError, ObjectWatcher};

/// Reads straight through to the fake apiserver, applying the cache label
/// filter and the watch-before-read rule of [`crate::DynamicCache`].
#[derive(Clone)]
pub struct MockCache {
    api: Arc<MockApi>,
    watches: Arc<Mutex<FxHashMap<String, FxHashMap<String, OwnerIdentity>>>>,
}

impl MockCache {
    pub fn new(api: Arc<MockApi>) -> Self {
        Self { api, watches: Arc::default() }
    }

    /// GVK keys with at least one watching owner.
    pub fn watched(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<String, FxHashMap<String, OwnerIdentity>>> {
        self.watches.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn ensure_watched(&self, gvk: &GroupVersionKind) -> ApiResult<()> {
        if self.lock().contains_key(&gvk_key(gvk)) {
            Ok(())
        } else {
            Err(not_started(gvk))
        }
    }
}

fn is_cached(obj: &DynamicObject) -> bool {
    obj.metadata.labels.as_ref().and_then(|l| l.get(CACHE_LABEL)).map(String::as_str) == Some(CACHE_LABEL_VALUE)
}

#[async_trait::async_trait]
impl ObjectReader for MockCache {
    async fn get(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> ApiResult<Option<DynamicObject>> {
        self.ensure_watched(gvk)?;
        Ok(self.api.get(gvk, namespace, name).await?.filter(is_cached))
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> ApiResult<Vec<DynamicObject>> {
        self.ensure_watched(gvk)?;
        let mut items = self.api.list(gvk, namespace, selector).await?;
        items.retain(is_cached);
        Ok(items)
    }
}

#[async_trait::async_trait]
impl ObjectWatcher for MockCache {
    async fn watch(&self, owner: &OwnerIdentity, gvk: &GroupVersionKind) -> Result<(), CacheError> {
        self.lock().entry(gvk_key(gvk)).or_default().insert(owner.uid.clone(), owner.clone());
        Ok(())
    }

    async fn free(&self, owner: &OwnerIdentity) -> Result<(), CacheError> {
        let mut watches = self.lock();
        for owners in watches.values_mut() {
            owners.remove(&owner.uid);
        }
        watches.retain(|_, owners| !owners.is_empty());
        Ok(())
    }

    async fn owners_for_gvk(&self, gvk: &GroupVersionKind) -> Vec<OwnerIdentity> {
        self.lock().get(&gvk_key(gvk)).map(|o| o.values().cloned().collect()).unwrap_or_default()
    }
}
