use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Args;

use pko_core::env;
use pko_packages::Registry;

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Namespace the operator runs in; cluster packages read their secrets from here
    #[arg(long = "namespace", env = env::NAMESPACE, default_value = env::DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// JSON object mapping registry hosts to mirrors, e.g. {"quay.io":"mirror.local"}
    #[arg(long = "registry-host-overrides", env = env::REGISTRY_HOST_OVERRIDES)]
    pub registry_host_overrides: Option<String>,

    /// File holding the registry host override JSON
    #[arg(long = "registry-host-overrides-file", conflicts_with = "registry_host_overrides")]
    pub registry_host_overrides_file: Option<PathBuf>,

    /// Registry prefixed to package images without a host
    #[arg(long = "image-registry", env = env::IMAGE_REGISTRY)]
    pub image_registry: Option<String>,

    /// Salts every package spec hash; changing it unpacks all packages again
    #[arg(long = "package-hash-modifier", env = "PKO_PACKAGE_HASH_MODIFIER")]
    pub package_hash_modifier: Option<i32>,

    #[arg(long = "cache-sync-timeout-secs", env = "PKO_CACHE_SYNC_TIMEOUT_SECS", default_value_t = 30)]
    pub cache_sync_timeout_secs: u64,

    /// Seconds before an ObjectTemplate looks for a missing required source again
    #[arg(
        long = "object-template-resource-retry-interval-secs",
        env = "PKO_OBJECT_TEMPLATE_RESOURCE_RETRY_INTERVAL_SECS",
        default_value_t = 30
    )]
    pub object_template_resource_retry_secs: u64,

    /// Seconds before an ObjectTemplate looks for a missing optional source again
    #[arg(
        long = "object-template-optional-resource-retry-interval-secs",
        env = "PKO_OBJECT_TEMPLATE_OPTIONAL_RESOURCE_RETRY_INTERVAL_SECS",
        default_value_t = 60
    )]
    pub object_template_optional_resource_retry_secs: u64,

    /// Reconciles running at once per controller
    #[arg(long = "concurrency", env = "PKO_CONCURRENCY", default_value_t = 10)]
    pub concurrency: u16,

    /// ObjectSetPhase class served by this process
    #[arg(long = "phase-class", env = "PKO_PHASE_CLASS", default_value = "default")]
    pub phase_class: String,

    /// Kubeconfig of the cluster ObjectSetPhases are applied to
    #[arg(long = "target-kubeconfig")]
    pub target_kubeconfig: Option<PathBuf>,

    /// Adopt objects regardless of their collision protection
    #[arg(long = "force-adoption", env = env::FORCE_ADOPTION)]
    pub force_adoption: bool,

    /// Prometheus exporter listen address, e.g. 0.0.0.0:8080
    #[arg(long = "metrics-addr", env = "PKO_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    #[arg(long = "image", env = env::IMAGE)]
    pub image: Option<String>,

    #[arg(long = "remote-phase-package-image", env = env::REMOTE_PHASE_PACKAGE_IMAGE)]
    pub remote_phase_package_image: Option<String>,

    #[arg(long = "test-stub-image", env = env::TEST_STUB_IMAGE)]
    pub test_stub_image: Option<String>,
}

impl RunArgs {
    pub fn cache_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_sync_timeout_secs)
    }

    pub fn object_template_resource_retry(&self) -> Duration {
        Duration::from_secs(self.object_template_resource_retry_secs)
    }

    pub fn object_template_optional_resource_retry(&self) -> Duration {
        Duration::from_secs(self.object_template_optional_resource_retry_secs)
    }

    /// Override table from the flag, the file, or nothing.
    pub fn registry_overrides(&self) -> Result<BTreeMap<String, String>> {
        let raw = match (&self.registry_host_overrides, &self.registry_host_overrides_file) {
            (Some(raw), _) => raw.clone(),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("reading registry host overrides from {}", path.display()))?,
            (None, None) => return Ok(BTreeMap::new()),
        };
        Registry::parse_overrides(&raw).context("parsing registry host overrides")
    }

    pub fn registry(&self) -> Result<Registry> {
        Ok(Registry::new(self.registry_overrides()?, self.image_registry.clone()))
    }
}
