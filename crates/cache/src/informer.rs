//! One informer: a watch stream folded into an immutable snapshot.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pko_api::{ApiResult, WatchEvent};
use pko_core::object::gvk_key;
use pko_ownership::OwnerIdentity;

use crate::relay::Relay;

pub(crate) type Key = (Option<String>, String);

fn key_of(obj: &DynamicObject) -> Key {
    (obj.metadata.namespace.clone().filter(|ns| !ns.is_empty()), obj.metadata.name.clone().unwrap_or_default())
}

/// Immutable view handed to readers.
#[derive(Debug, Default)]
pub(crate) struct Snapshot {
    pub objects: BTreeMap<Key, DynamicObject>,
}

enum Delta {
    Applied(DynamicObject),
    Deleted(DynamicObject),
}

/// Coalescing queue keyed by object with FIFO order. Holds at most one delta
/// per object, so it never needs to drop one.
#[derive(Default)]
struct Coalescer {
    map: FxHashMap<Key, Delta>,
    order: VecDeque<Key>,
    restart: Option<Vec<DynamicObject>>,
}

impl Coalescer {

    fn push(&mut self, ev: WatchEvent) {
        let d = match ev {
            WatchEvent::Applied(o) => Delta::Applied(o),
            WatchEvent::Deleted(o) => Delta::Deleted(o),
            WatchEvent::Restarted(list) => {
                // A relist supersedes everything queued before it.
                self.map.clear();
                self.order.clear();
                self.restart = Some(list);
                return;
            }
        };
        let key = match &d {
            Delta::Applied(o) | Delta::Deleted(o) => key_of(o),
        };
        if !self.map.contains_key(&key) {
            self.order.push_back(key.clone());
        }
        self.map.insert(key, d);
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn is_empty(&self) -> bool {
        self.restart.is_none() && self.order.is_empty()
    }

    fn drain(&mut self) -> (Option<Vec<DynamicObject>>, Vec<Delta>) {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&key) {
                out.push(d);
            }
        }
        (self.restart.take(), out)
    }
}

/// A running informer for one GVK.
pub(crate) struct Informer {
    pub owners: Arc<Mutex<FxHashMap<String, OwnerIdentity>>>,
    pub snapshot: Arc<ArcSwap<Snapshot>>,
    pub epoch: watch::Receiver<u64>,
    task: JoinHandle<()>,
}

impl Drop for Informer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Pending objects that force a flush before the next tick.
const FLUSH_AT: usize = 4096;
const FLUSH_EVERY: Duration = Duration::from_millis(8);

impl Informer {
    pub fn spawn(gvk: GroupVersionKind, stream: BoxStream<'static, ApiResult<WatchEvent>>, relay: Relay) -> Self {
        let snapshot = Arc::new(ArcSwap::from_pointee(Snapshot::default()));
        let owners = Arc::new(Mutex::new(FxHashMap::default()));
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let task = tokio::spawn(ingest(
            gvk,
            stream,
            Arc::clone(&snapshot),
            Arc::clone(&owners),
            epoch_tx,
            relay,
        ));
        Self { owners, snapshot, epoch: epoch_rx, task }
    }

    /// Identity of this informer, distinct from any informer it replaces.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.snapshot) as usize
    }

    pub fn add_owner(&self, owner: &OwnerIdentity) {
        self.owners.lock().unwrap_or_else(|p| p.into_inner()).insert(owner.uid.clone(), owner.clone());
    }

    /// Returns true when no owner is left.
    pub fn remove_owner(&self, owner: &OwnerIdentity) -> bool {
        let mut owners = self.owners.lock().unwrap_or_else(|p| p.into_inner());
        owners.remove(&owner.uid);
        owners.is_empty()
    }

    pub fn owners(&self) -> Vec<OwnerIdentity> {
        self.owners.lock().unwrap_or_else(|p| p.into_inner()).values().cloned().collect()
    }
}

async fn ingest(
    gvk: GroupVersionKind,
    mut stream: BoxStream<'static, ApiResult<WatchEvent>>,
    snapshot: Arc<ArcSwap<Snapshot>>,
    owners: Arc<Mutex<FxHashMap<String, OwnerIdentity>>>,
    epoch_tx: watch::Sender<u64>,
    relay: Relay,
) {
    let key = gvk_key(&gvk);
    let mut coalescer = Coalescer::default();
    let mut synced = false;
    let mut epoch = 0u64;
    let mut ticker = tokio::time::interval(FLUSH_EVERY);
    loop {
        tokio::select! {
            next = stream.next() => match next {
                Some(Ok(ev)) => {
                    if matches!(ev, WatchEvent::Restarted(_)) {
                        synced = true;
                    }
                    coalescer.push(ev);
                    if coalescer.len() < FLUSH_AT {
                        continue;
                    }
                    flush(&gvk, &mut coalescer, &snapshot, &owners, &relay);
                    if synced {
                        epoch = epoch.saturating_add(1);
                        let _ = epoch_tx.send(epoch);
                    }
                }
                Some(Err(e)) => warn!(gvk = %key, error = %e, "watch error"),
                None => {
                    debug!(gvk = %key, "watch stream closed; draining and exiting informer");
                    flush(&gvk, &mut coalescer, &snapshot, &owners, &relay);
                    break;
                }
            },
            _ = ticker.tick() => {
                if coalescer.is_empty() {
                    continue;
                }
                flush(&gvk, &mut coalescer, &snapshot, &owners, &relay);
                if synced {
                    epoch = epoch.saturating_add(1);
                    let _ = epoch_tx.send(epoch);
                }
            }
        }
    }
    info!(gvk = %key, "informer stopped");
}

fn flush(
    gvk: &GroupVersionKind,
    coalescer: &mut Coalescer,
    snapshot: &ArcSwap<Snapshot>,
    owners: &Mutex<FxHashMap<String, OwnerIdentity>>,
    relay: &Relay,
) {
    let (restart, batch) = coalescer.drain();
    let current = snapshot.load_full();
    let mut objects = current.objects.clone();
    let mut changes: Vec<(Option<DynamicObject>, Option<DynamicObject>)> = Vec::new();

    if let Some(list) = restart {
        let mut next: BTreeMap<Key, DynamicObject> = list.into_iter().map(|o| (key_of(&o), o)).collect();
        for (k, old) in &objects {
            if !next.contains_key(k) {
                changes.push((Some(old.clone()), None));
            }
        }
        for (k, new) in &next {
            changes.push((objects.get(k).cloned(), Some(new.clone())));
        }
        std::mem::swap(&mut objects, &mut next);
    }

    for d in batch {
        match d {
            Delta::Applied(o) => {
                let old = objects.insert(key_of(&o), o.clone());
                changes.push((old, Some(o)));
            }
            Delta::Deleted(o) => {
                let old = objects.remove(&key_of(&o));
                changes.push((old.or(Some(o)), None));
            }
        }
    }

    snapshot.store(Arc::new(Snapshot { objects }));
    let watching: Vec<OwnerIdentity> = owners.lock().unwrap_or_else(|p| p.into_inner()).values().cloned().collect();
    for (old, new) in &changes {
        relay.dispatch(gvk, old.as_ref(), new.as_ref(), &watching);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pko_core::object::value_to_dynamic;
    use serde_json::json;

    fn cm(name: &str, v: &str) -> DynamicObject {
        value_to_dynamic(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "ns"},
            "data": {"v": v}
        }))
        .unwrap()
    }

    #[test]
    fn coalescer_keeps_latest_per_object() {
        let mut c = Coalescer::default();
        c.push(WatchEvent::Applied(cm("a", "1")));
        c.push(WatchEvent::Applied(cm("b", "1")));
        c.push(WatchEvent::Applied(cm("a", "2")));
        let (restart, batch) = c.drain();
        assert!(restart.is_none());
        assert_eq!(batch.len(), 2);
        match &batch[0] {
            Delta::Applied(o) => assert_eq!(o.data["data"]["v"], "2"),
            Delta::Deleted(_) => panic!("expected applied"),
        }
        assert!(c.is_empty());
    }

    #[test]
    fn restart_supersedes_queued_deltas() {
        let mut c = Coalescer::default();
        c.push(WatchEvent::Applied(cm("a", "1")));
        c.push(WatchEvent::Restarted(vec![cm("b", "1")]));
        c.push(WatchEvent::Deleted(cm("b", "1")));
        let (restart, batch) = c.drain();
        assert_eq!(restart.map(|l| l.len()), Some(1));
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn large_bursts_keep_every_object() {
        let mut c = Coalescer::default();
        let names: Vec<String> = (0..FLUSH_AT + 10).map(|n| format!("cm-{n}")).collect();
        for name in &names {
            c.push(WatchEvent::Applied(cm(name, "1")));
        }
        c.push(WatchEvent::Deleted(cm("cm-0", "1")));
        assert_eq!(c.len(), names.len());

        let snapshot = ArcSwap::from_pointee(Snapshot::default());
        let owners = Mutex::new(FxHashMap::default());
        let relay = Relay::default();
        flush(&GroupVersionKind::gvk("", "v1", "ConfigMap"), &mut c, &snapshot, &owners, &relay);

        let objects = &snapshot.load().objects;
        assert_eq!(objects.len(), names.len() - 1);
        assert!(!objects.contains_key(&(Some("ns".to_string()), "cm-0".to_string())));
        assert!(objects.contains_key(&(Some("ns".to_string()), format!("cm-{}", FLUSH_AT + 9))));
        assert!(c.is_empty());
    }
}
