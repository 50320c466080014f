//! ObjectSet controller: walks one revision through its phases, hands
//! objects over to successors and tears them down on archival. Also hosts
//! the ObjectSetPhase controller that serves delegated phases.

#![forbid(unsafe_code)]

mod objectset;
mod phase_controller;
mod remote;
mod revision;

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::error;

use pko_api::{ApiError, ObjectApi};
use pko_cache::{CacheError, ObjectWatcher};
use pko_ownership::OwnershipError;
use pko_phase::{PhaseError, PhaseReconciler};
use pko_probing::ProbeError;

pub use objectset::reconcile;
pub use phase_controller::{reconcile_phase, PhaseContext};
pub use remote::remote_phase_name;
pub use revision::next_revision;

/// Polling interval while something outside our control must happen first.
pub(crate) const WAIT_RETRY: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Phase(#[from] PhaseError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Ownership(#[from] OwnershipError),
    #[error("invalid availability probes: {0}")]
    Probe(#[from] ProbeError),
    #[error("{kind} {name:?} not found")]
    SliceMissing { kind: &'static str, name: String },
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Phase(e) => e.is_retryable(),
            Self::Api(e) => e.is_retryable(),
            Self::Cache(e) => e.is_retryable(),
            Self::SliceMissing { .. } => true,
            Self::Ownership(_) | Self::Probe(_) | Self::Serialization(_) => false,
        }
    }
}

/// Shared state of the ObjectSet controller.
pub struct Context {
    /// Client for the ObjectSets themselves, their slices and phases.
    pub api: Arc<dyn ObjectApi>,
    pub cache: Arc<dyn ObjectWatcher>,
    pub phases: PhaseReconciler,
}

impl Context {
    pub fn new(api: Arc<dyn ObjectApi>, cache: Arc<dyn ObjectWatcher>, phases: PhaseReconciler) -> Self {
        Self { api, cache, phases }
    }
}

pub fn error_policy<K: ResourceExt, C>(obj: Arc<K>, error: &Error, _ctx: Arc<C>) -> Action {
    error!(?error, name = %obj.name_any(), namespace = ?obj.namespace(), retryable = error.is_retryable(), "reconciliation failed");
    if error.is_retryable() {
        Action::requeue(WAIT_RETRY)
    } else {
        Action::requeue(Duration::from_secs(300))
    }
}

pub(crate) fn requeue_or_wait(after: Option<Duration>) -> Action {
    match after {
        Some(d) => Action::requeue(d),
        None => Action::await_change(),
    }
}
