//! Fetching package images and turning their layers into a file tree.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Mutex;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use oci_distribution::client::ClientConfig;
use oci_distribution::manifest::{IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE, IMAGE_LAYER_GZIP_MEDIA_TYPE, IMAGE_LAYER_MEDIA_TYPE};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use rustc_hash::FxHashMap;
use serde::Deserialize;

/// Package content keyed by path relative to the package root.
pub type Files = BTreeMap<String, Vec<u8>>;

/// Package files live below this directory inside the image.
const PACKAGE_DIR: &str = "package/";
const DOCKER_HUB: &str = "docker.io";

#[derive(Debug, thiserror::Error)]
pub enum PullError {
    #[error("invalid image reference {image:?}: {reason}")]
    Reference { image: String, reason: String },
    #[error("pulling {image}: {reason}")]
    Registry { image: String, reason: String },
    #[error("reading layers of {image}: {error}")]
    Layer { image: String, error: std::io::Error },
    #[error("image {0} not found")]
    NotFound(String),
    #[error("invalid docker config: {0}")]
    Credentials(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Credentials {
    #[default]
    Anonymous,
    Basic { username: String, password: String },
}

#[async_trait]
pub trait ImagePuller: Send + Sync {
    async fn pull(&self, image: &str, credentials: &Credentials) -> Result<Files, PullError>;
}

/// Registry prefix for unqualified images and the host override table.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    overrides: BTreeMap<String, String>,
    default_registry: Option<String>,
}

impl Registry {
    pub fn new(overrides: BTreeMap<String, String>, default_registry: Option<String>) -> Self {
        let default_registry = default_registry.map(|r| r.trim_end_matches('/').to_string()).filter(|r| !r.is_empty());
        Self { overrides, default_registry }
    }

    /// Parses `{"quay.io":"mirror.local"}`.
    pub fn parse_overrides(raw: &str) -> Result<BTreeMap<String, String>, serde_json::Error> {
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(raw)
    }

    /// The reference to actually pull for `image`.
    pub fn resolve(&self, image: &str) -> String {
        let image = match (split_host(image).0, &self.default_registry) {
            (None, Some(registry)) => format!("{}/{}", registry, image),
            _ => image.to_string(),
        };
        self.replace_host(&image)
    }

    /// Rewrites the registry host of `image` through the override table.
    pub fn replace_host(&self, image: &str) -> String {
        match split_host(image) {
            (Some(host), rest) => match self.overrides.get(host) {
                Some(mirror) => format!("{}/{}", mirror, rest),
                None => image.to_string(),
            },
            (None, _) => image.to_string(),
        }
    }
}

/// Splits a leading registry host off an image reference. The first path
/// segment counts as a host when it looks like one.
pub(crate) fn split_host(image: &str) -> (Option<&str>, &str) {
    match image.split_once('/') {
        Some((first, rest)) if first.contains('.') || first.contains(':') || first == "localhost" => (Some(first), rest),
        _ => (None, image),
    }
}

#[derive(Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: BTreeMap<String, DockerAuth>,
}

#[derive(Deserialize)]
struct DockerAuth {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// Registry key of a docker config entry: the host plus any path below `/v1/` or `/v2/`.
fn auth_key(entry: &str) -> String {
    let entry = entry.trim_start_matches("https://").trim_start_matches("http://");
    let (host, path) = entry.split_once('/').unwrap_or((entry, ""));
    let path = path.strip_prefix("v1/").or_else(|| path.strip_prefix("v2/")).unwrap_or(path);
    let path = path.trim_matches('/');
    let host = if host == "index.docker.io" { DOCKER_HUB } else { host };
    if path.is_empty() {
        host.to_string()
    } else {
        format!("{}/{}", host, path)
    }
}

/// Picks the credentials for `image` out of a `.dockerconfigjson` payload.
pub fn credentials_for(config: &[u8], image: &str) -> Result<Credentials, PullError> {
    let config: DockerConfig =
        serde_json::from_slice(config).map_err(|e| PullError::Credentials(e.to_string()))?;
    let host = split_host(image).0.unwrap_or(DOCKER_HUB);
    let Some(auth) = config.auths.iter().find(|(k, _)| auth_key(k) == host).map(|(_, v)| v) else {
        return Ok(Credentials::Anonymous);
    };
    if let (Some(username), Some(password)) = (&auth.username, &auth.password) {
        return Ok(Credentials::Basic { username: username.clone(), password: password.clone() });
    }
    let Some(encoded) = &auth.auth else { return Ok(Credentials::Anonymous) };
    let decoded = STANDARD.decode(encoded.trim()).map_err(|e| PullError::Credentials(e.to_string()))?;
    let decoded = String::from_utf8(decoded).map_err(|e| PullError::Credentials(e.to_string()))?;
    let (username, password) =
        decoded.split_once(':').ok_or_else(|| PullError::Credentials(format!("auth entry for {} has no ':'", host)))?;
    Ok(Credentials::Basic { username: username.into(), password: password.into() })
}

/// Unpacks image layers in order; later layers win. Only regular files below
/// `package/` are kept and hidden files are skipped.
pub fn extract_layers<'a>(image: &str, layers: impl IntoIterator<Item = &'a [u8]>) -> Result<Files, PullError> {
    let io = |error: std::io::Error| PullError::Layer { image: image.to_string(), error };
    let mut files = Files::new();
    for layer in layers {
        let reader: Box<dyn Read + 'a> =
            if layer.starts_with(&[0x1f, 0x8b]) { Box::new(GzDecoder::new(layer)) } else { Box::new(layer) };
        let mut archive = tar::Archive::new(reader);
        for entry in archive.entries().map_err(io)? {
            let mut entry = entry.map_err(io)?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let raw = entry.path().map_err(io)?.to_string_lossy().into_owned();
            let Some(path) = package_path(&raw) else { continue };
            let mut content = Vec::new();
            entry.read_to_end(&mut content).map_err(io)?;
            files.insert(path, content);
        }
    }
    Ok(files)
}

fn package_path(raw: &str) -> Option<String> {
    let path = raw.trim_start_matches("./").trim_start_matches('/').strip_prefix(PACKAGE_DIR)?;
    if path.is_empty() || path.split('/').any(|segment| segment.starts_with('.')) {
        return None;
    }
    Some(path.to_string())
}

/// Pulls from OCI registries.
pub struct OciPuller {
    client: Client,
}

impl Default for OciPuller {
    fn default() -> Self {
        Self { client: Client::new(ClientConfig::default()) }
    }
}

impl OciPuller {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ImagePuller for OciPuller {
    async fn pull(&self, image: &str, credentials: &Credentials) -> Result<Files, PullError> {
        let reference: Reference =
            image.parse().map_err(|e| PullError::Reference { image: image.to_string(), reason: format!("{}", e) })?;
        let auth = match credentials {
            Credentials::Anonymous => RegistryAuth::Anonymous,
            Credentials::Basic { username, password } => RegistryAuth::Basic(username.clone(), password.clone()),
        };
        let media_types = vec![IMAGE_LAYER_GZIP_MEDIA_TYPE, IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE, IMAGE_LAYER_MEDIA_TYPE];
        let data = self
            .client
            .pull(&reference, &auth, media_types)
            .await
            .map_err(|e| PullError::Registry { image: image.to_string(), reason: e.to_string() })?;
        extract_layers(image, data.layers.iter().map(|l| l.data.as_slice()))
    }
}

/// Serves images from memory.
#[derive(Default)]
pub struct StaticPuller {
    images: Mutex<FxHashMap<String, Files>>,
    pulls: Mutex<Vec<(String, Credentials)>>,
}

impl StaticPuller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, image: &str, files: Files) {
        self.images.lock().unwrap_or_else(|e| e.into_inner()).insert(image.to_string(), files);
    }

    /// Every pull so far with the credentials it carried.
    pub fn pulls(&self) -> Vec<(String, Credentials)> {
        self.pulls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ImagePuller for StaticPuller {
    async fn pull(&self, image: &str, credentials: &Credentials) -> Result<Files, PullError> {
        self.pulls.lock().unwrap_or_else(|e| e.into_inner()).push((image.to_string(), credentials.clone()));
        self.images
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(image)
            .cloned()
            .ok_or_else(|| PullError::NotFound(image.to_string()))
    }
}
