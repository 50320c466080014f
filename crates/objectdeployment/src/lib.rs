//! ObjectDeployment controller: keeps a chain of ObjectSet revisions in
//! line with the deployment template, archives superseded revisions and
//! garbage collects the archive.

#![forbid(unsafe_code)]

mod archive;
mod deployment;
mod revisions;
mod status;

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::error;

use pko_api::{ApiError, ObjectApi};
use pko_ownership::OwnershipError;

pub use deployment::reconcile;
pub use revisions::{object_set_name, template_hash};
pub use status::derive_phase;

/// Polling interval while ObjectSets catch up with their own status.
pub(crate) const WAIT_RETRY: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Ownership(#[from] OwnershipError),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api(e) => e.is_retryable(),
            Self::Ownership(_) | Self::Serialization(_) => false,
        }
    }
}

pub struct Context {
    pub api: Arc<dyn ObjectApi>,
}

impl Context {
    pub fn new(api: Arc<dyn ObjectApi>) -> Self {
        Self { api }
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
