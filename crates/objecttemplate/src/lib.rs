//! ObjectTemplate controller: samples values from live objects, renders one
//! manifest from them and keeps that object in line as the sources change.

#![forbid(unsafe_code)]

mod render;
mod sources;
mod template;

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::Value;
use tracing::error;

use pko_api::{ApiError, ObjectApi};
use pko_cache::{CacheError, ObjectWatcher};
use pko_core::template::TemplateError;
use pko_ownership::OwnershipError;

pub use template::reconcile;

/// Default wait before looking for a missing required source again.
pub const RESOURCE_RETRY: Duration = Duration::from_secs(30);

/// Default wait before looking for a missing optional source again.
pub const OPTIONAL_RESOURCE_RETRY: Duration = Duration::from_secs(60);

pub(crate) const WAIT_RETRY: Duration = Duration::from_secs(5);

/// Problems with the sources of a template. These are reported on the
/// template and not retried until something changes.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source {0} not found")]
    Missing(String),
    #[error("source {object}: {reason}")]
    Invalid { object: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Ownership(#[from] OwnershipError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("template: {0}")]
    Template(#[from] TemplateError),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api(e) => e.is_retryable(),
            Self::Cache(e) => e.is_retryable(),
            Self::Source(SourceError::Missing(_)) => true,
            Self::Ownership(_) | Self::Source(_) | Self::Template(_) | Self::Serialization(_) => false,
        }
    }
}

pub struct Context {
    pub api: Arc<dyn ObjectApi>,
    pub cache: Arc<dyn ObjectWatcher>,
    /// Cluster facts exposed to templates as `environment`.
    pub environment: Value,
    /// Requeue delay while a required source is missing.
    pub resource_retry: Duration,
    /// Requeue delay while an optional source is missing. Sources that do
    /// not exist yet carry no cache label, so only this timer notices them.
    pub optional_resource_retry: Duration,
}

impl Context {
    pub fn new(api: Arc<dyn ObjectApi>, cache: Arc<dyn ObjectWatcher>) -> Self {
        Self {
            api,
            cache,
            environment: Value::Object(Default::default()),
            resource_retry: RESOURCE_RETRY,
            optional_resource_retry: OPTIONAL_RESOURCE_RETRY,
        }
    }

    pub fn with_resource_retry(mut self, retry: Duration) -> Self {
        self.resource_retry = retry;
        self
    }

    pub fn with_optional_resource_retry(mut self, retry: Duration) -> Self {
        self.optional_resource_retry = retry;
        self
    }

    pub fn with_environment(mut self, environment: Value) -> Self {
        self.environment = environment;
        self
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
