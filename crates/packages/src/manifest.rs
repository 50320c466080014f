//! The PackageManifest shipped in every package image and the file layout
//! around it.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use pko_core::apis::ObjectSetProbe;

use crate::puller::Files;
use crate::LoadError;

pub const MANIFEST_API_VERSION: &str = "manifests.package-operator.run/v1alpha1";
pub const MANIFEST_KIND: &str = "PackageManifest";
const MANIFEST_FILES: [&str; 2] = ["manifest.yaml", "manifest.yml"];
const COMPONENTS_DIR: &str = "components/";

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum Scope {
    Cluster,
    Namespaced,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ManifestMetadata {
    #[serde(default)]
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ManifestPhase {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub class: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ManifestImage {
    pub name: String,
    pub image: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestConfig {
    #[serde(default, rename = "openAPIV3Schema", skip_serializing_if = "Option::is_none")]
    pub open_api_v3_schema: Option<Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSpec {
    #[serde(default)]
    pub scopes: Vec<Scope>,
    #[serde(default)]
    pub phases: Vec<ManifestPhase>,
    #[serde(default)]
    pub availability_probes: Vec<ObjectSetProbe>,
    #[serde(default)]
    pub config: ManifestConfig,
    #[serde(default)]
    pub images: Vec<ManifestImage>,
    /// Present (even empty) when the image carries components.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ManifestMetadata,
    #[serde(default)]
    pub spec: ManifestSpec,
}

impl PackageManifest {
    pub fn parse(path: &str, raw: &[u8]) -> Result<Self, LoadError> {
        let manifest: Self =
            serde_yaml::from_slice(raw).map_err(|e| LoadError::Manifest(format!("{}: {}", path, e)))?;
        if manifest.api_version != MANIFEST_API_VERSION || manifest.kind != MANIFEST_KIND {
            return Err(LoadError::Manifest(format!(
                "{}: expected {} {}, got {} {}",
                path, MANIFEST_API_VERSION, MANIFEST_KIND, manifest.api_version, manifest.kind
            )));
        }
        let violations = manifest.violations();
        if !violations.is_empty() {
            return Err(LoadError::Manifest(format!("{}: {}", path, violations.join(", "))));
        }
        Ok(manifest)
    }

    fn violations(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.metadata.name.is_empty() {
            out.push("metadata.name: required".to_string());
        }
        if self.spec.scopes.is_empty() {
            out.push("spec.scopes: required".to_string());
        }
        let mut phases = BTreeSet::new();
        for (i, phase) in self.spec.phases.iter().enumerate() {
            if !phases.insert(phase.name.as_str()) {
                out.push(format!("spec.phases[{}].name: {:?} must be unique", i, phase.name));
            }
        }
        for (i, probe) in self.spec.availability_probes.iter().enumerate() {
            if probe.probes.is_empty() {
                out.push(format!("spec.availabilityProbes[{}].probes: required", i));
            }
        }
        let mut images = BTreeSet::new();
        for (i, image) in self.spec.images.iter().enumerate() {
            if image.name.is_empty() {
                out.push(format!("spec.images[{}].name: must be non empty", i));
            } else if !images.insert(image.name.as_str()) {
                out.push(format!("spec.images[{}].name: {:?} must be unique", i, image.name));
            }
            if image.image.is_empty() {
                out.push(format!("spec.images[{}].image: must be non empty", i));
            }
        }
        out
    }

    pub fn supports(&self, scope: Scope) -> bool {
        self.spec.scopes.contains(&scope)
    }

    pub fn has_components(&self) -> bool {
        self.spec.components.is_some()
    }
}

/// A manifest together with the files it applies to.
#[derive(Clone, Debug)]
pub struct PackageFiles {
    pub manifest: PackageManifest,
    pub files: Files,
}

fn find_manifest(files: &Files) -> Result<(&'static str, &[u8]), LoadError> {
    let found: Vec<_> = MANIFEST_FILES.iter().filter_map(|p| files.get(*p).map(|c| (*p, c.as_slice()))).collect();
    match found.as_slice() {
        [one] => Ok(*one),
        [] => Err(LoadError::Manifest("manifest.yaml not found".into())),
        _ => Err(LoadError::Manifest("both manifest.yaml and manifest.yml present".into())),
    }
}

/// Names of the components carried below `components/`.
pub fn component_names(files: &Files) -> BTreeSet<String> {
    files
        .keys()
        .filter_map(|p| p.strip_prefix(COMPONENTS_DIR))
        .filter_map(|rest| rest.split_once('/').map(|(name, _)| name.to_string()))
        .collect()
}

/// Loads the root package or, with `component` set, one of its components.
pub fn load(files: &Files, component: Option<&str>) -> Result<PackageFiles, LoadError> {
    let (path, raw) = find_manifest(files)?;
    let root = PackageManifest::parse(path, raw)?;
    let components = component_names(files);

    let Some(component) = component else {
        if !root.has_components() && !components.is_empty() {
            return Err(LoadError::Manifest("components/ found but the manifest does not enable components".into()));
        }
        let files = files.iter().filter(|(p, _)| !p.starts_with(COMPONENTS_DIR)).map(|(p, c)| (p.clone(), c.clone()));
        return Ok(PackageFiles { manifest: root, files: files.collect() });
    };

    if !root.has_components() {
        return Err(LoadError::Component(format!("component {:?} requested but the package has no components", component)));
    }
    if !components.contains(component) {
        return Err(LoadError::Component(format!("component {:?} not found", component)));
    }
    let prefix = format!("{}{}/", COMPONENTS_DIR, component);
    let own: Files = files
        .iter()
        .filter_map(|(p, c)| p.strip_prefix(&prefix).map(|rest| (rest.to_string(), c.clone())))
        .collect();
    let (path, raw) = find_manifest(&own)?;
    let manifest = PackageManifest::parse(&format!("{}{}", prefix, path), raw)?;
    if manifest.has_components() || own.keys().any(|p| p.starts_with(COMPONENTS_DIR)) {
        return Err(LoadError::Component(format!("component {:?} must not nest components", component)));
    }
    Ok(PackageFiles { manifest, files: own })
}

/// `images` as exposed to templates, after registry rewriting.
pub fn image_map(manifest: &PackageManifest, rewrite: impl Fn(&str) -> String) -> BTreeMap<String, String> {
    manifest.spec.images.iter().map(|i| (i.name.clone(), rewrite(&i.image))).collect()
}
