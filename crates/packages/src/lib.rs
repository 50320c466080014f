//! Package controller: pulls package images, renders their templates and
//! hands the result to an ObjectDeployment.

#![forbid(unsafe_code)]

pub mod chunking;
pub mod config;
mod controller;
pub mod deployer;
pub mod manifest;
pub mod presets;
pub mod puller;
pub mod render;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kube::runtime::controller::Action;
use kube::ResourceExt;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::error;

use pko_api::{ApiError, ObjectApi};
use pko_core::env;
use pko_ownership::OwnershipError;

pub use controller::{derive_phase, reconcile};
pub use puller::{extract_layers, Credentials, Files, ImagePuller, OciPuller, PullError, Registry, StaticPuller};
pub use render::Rendered;

pub(crate) const WAIT_RETRY: Duration = Duration::from_secs(5);

/// First and last delay between pull attempts of a failing package.
pub const BACKOFF_INITIAL: Duration = Duration::from_secs(10);
pub const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Problems with the content of a package image. These are reported on the
/// package and not retried until its spec changes.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("manifest: {0}")]
    Manifest(String),
    #[error("component: {0}")]
    Component(String),
    #[error("{0}")]
    Scope(String),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("template {path}: {reason}")]
    Template { path: String, reason: String },
    #[error("object in {path}: {reason}")]
    Object { path: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Ownership(#[from] OwnershipError),
    #[error(transparent)]
    Pull(#[from] PullError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("secret: {0}")]
    Secret(String),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("no free slice name for deployment {0}")]
    SliceCollision(String),
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api(e) => e.is_retryable(),
            Self::Pull(_) | Self::Secret(_) => true,
            Self::Ownership(_) | Self::Load(_) | Self::Serialization(_) | Self::SliceCollision(_) => false,
        }
    }
}

/// Per-package exponential backoff keyed by UID.
#[derive(Default)]
pub struct Backoff {
    entries: Mutex<FxHashMap<String, (Duration, Instant)>>,
}

impl Backoff {
    /// Delay before the next attempt after another failure.
    pub fn next(&self, uid: &str) -> Duration {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        // Entries untouched for twice the longest delay belong to packages that recovered or went away.
        entries.retain(|_, (_, at)| now.duration_since(*at) < BACKOFF_MAX * 2);
        let delay = match entries.get(uid) {
            Some((last, _)) => (*last * 2).min(BACKOFF_MAX),
            None => BACKOFF_INITIAL,
        };
        entries.insert(uid.to_string(), (delay, now));
        delay
    }

    pub fn forget(&self, uid: &str) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).remove(uid);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of the last unpack per package UID, keyed by spec hash.
#[derive(Default)]
pub(crate) struct UnpackStore {
    entries: Mutex<FxHashMap<String, (String, Result<Arc<Rendered>, String>)>>,
}

impl UnpackStore {
    pub(crate) fn get(&self, uid: &str, hash: &str) -> Option<Result<Arc<Rendered>, String>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(uid).filter(|(h, _)| h == hash).map(|(_, r)| r.clone())
    }

    pub(crate) fn put(&self, uid: &str, hash: &str, result: Result<Arc<Rendered>, String>) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).insert(uid.to_string(), (hash.to_string(), result));
    }

    pub(crate) fn forget(&self, uid: &str) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).remove(uid);
    }
}

pub struct Context {
    pub api: Arc<dyn ObjectApi>,
    pub puller: Arc<dyn ImagePuller>,
    pub registry: Registry,
    /// Salts the spec hash so every package unpacks again after a change.
    pub hash_modifier: Option<i32>,
    /// Where cluster-scoped packages read their secrets from.
    pub operator_namespace: String,
    /// Cluster facts exposed to templates as `environment`.
    pub environment: Value,
    pub backoff: Backoff,
    pub(crate) unpacked: UnpackStore,
}

impl Context {
    pub fn new(api: Arc<dyn ObjectApi>, puller: Arc<dyn ImagePuller>) -> Self {
        Self {
            api,
            puller,
            registry: Registry::default(),
            hash_modifier: None,
            operator_namespace: env::DEFAULT_NAMESPACE.to_string(),
            environment: Value::Object(Default::default()),
            backoff: Backoff::default(),
            unpacked: UnpackStore::default(),
        }
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_hash_modifier(mut self, modifier: Option<i32>) -> Self {
        self.hash_modifier = modifier;
        self
    }

    pub fn with_operator_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.operator_namespace = namespace.into();
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let backoff = Backoff::default();
        let delays: Vec<u64> = (0..7).map(|_| backoff.next("uid").as_secs()).collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 160, 300, 300]);
        assert_eq!(backoff.next("other"), BACKOFF_INITIAL);
        backoff.forget("uid");
        assert_eq!(backoff.next("uid"), BACKOFF_INITIAL);
        assert_eq!(backoff.len(), 2);
    }
}
