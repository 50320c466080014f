//! Maps cache events to reconcile requests for owners.

use std::sync::{Arc, Mutex};

use futures::channel::mpsc;
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use tracing::trace;

use pko_ownership::{OwnerIdentity, OwnerKey, OwnerKind, OwnerStrategy};

/// Which owners an event on a managed object is relayed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// The controlling owner only.
    Controller,
    /// Every owner, controlling or not.
    Owners,
    /// Every owner of `kind` that called `watch` for the event's GVK.
    Watchers,
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub kind: OwnerKind,
    pub strategy: Arc<dyn OwnerStrategy>,
    pub mode: RelayMode,
}

struct Subscriber {
    sub: Subscription,
    tx: mpsc::UnboundedSender<OwnerKey>,
}

/// Subscriber list shared by every informer.
#[derive(Clone, Default)]
pub(crate) struct Relay {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl Relay {
    pub fn subscribe(&self, sub: Subscription) -> mpsc::UnboundedReceiver<OwnerKey> {
        let (tx, rx) = mpsc::unbounded();
        self.subscribers.lock().unwrap_or_else(|p| p.into_inner()).push(Subscriber { sub, tx });
        rx
    }

    /// Old and new state of one object; either side may be absent.
    pub fn dispatch(
        &self,
        gvk: &GroupVersionKind,
        old: Option<&DynamicObject>,
        new: Option<&DynamicObject>,
        watching: &[OwnerIdentity],
    ) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        subs.retain(|s| !s.tx.is_closed());
        for s in subs.iter() {
            let mut keys = match s.sub.mode {
                RelayMode::Controller | RelayMode::Owners => {
                    let controller_only = s.sub.mode == RelayMode::Controller;
                    old.into_iter()
                        .chain(new)
                        .flat_map(|o| s.sub.strategy.owners_for_event(&s.sub.kind, &o.metadata, controller_only))
                        .collect::<Vec<_>>()
                }
                RelayMode::Watchers => watchers_of_kind(&s.sub.kind, watching),
            };
            keys.sort();
            keys.dedup();
            for key in keys {
                trace!(gvk = ?gvk.kind, owner = %key.name, "relaying cache event");
                let _ = s.tx.unbounded_send(key);
            }
        }
    }
}

fn watchers_of_kind(kind: &OwnerKind, watching: &[OwnerIdentity]) -> Vec<OwnerKey> {
    watching
        .iter()
        .filter(|o| o.group() == kind.group && o.kind == kind.kind)
        .map(|o| OwnerKey {
            namespace: if kind.namespaced { o.namespace.clone() } else { None },
            name: o.name.clone(),
        })
        .collect()
}
