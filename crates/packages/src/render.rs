//! Rendering a loaded package into the ObjectSet template of its deployment.

use std::collections::{BTreeMap, BTreeSet};

use kube::core::ObjectMeta;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};

use pko_core::apis::{
    ConditionMapping, ObjectSetObject, ObjectSetProbe, ObjectSetTemplatePhase, ObjectSetTemplateSpec, PackageBody,
};
use pko_core::meta::{
    COLLISION_PROTECTION_ANNOTATION, CONDITION_MAP_ANNOTATION, PACKAGE_INSTANCE_LABEL, PACKAGE_LABEL, PHASE_ANNOTATION,
};
use pko_core::object::{gvk_of_value, split_api_version};
use pko_core::template;

use crate::manifest::{self, PackageManifest, Scope};
use crate::puller::{Files, Registry};
use crate::{config, presets, LoadError};

/// Files with this suffix are rendered and stored without it.
pub const TEMPLATE_SUFFIX: &str = ".j2";
/// Like [`TEMPLATE_SUFFIX`], but always rendered as a Go template.
pub const GO_TEMPLATE_SUFFIX: &str = ".gotmpl";
/// Phase holding the child Packages of a multi-component package.
pub const COMPONENTS_PHASE: &str = "components";

static DOCUMENT_SEPARATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^---$").expect("static regex"));

/// Everything rendering needs to know about the Package being unpacked.
pub struct RenderInput<'a> {
    pub files: &'a Files,
    pub package: &'a ObjectMeta,
    pub body: &'a PackageBody,
    pub scope: Scope,
    /// Kind to use for child Packages.
    pub package_kind: &'a str,
    /// Image actually pulled, after registry rewriting.
    pub image: &'a str,
    pub registry: &'a Registry,
    /// Decoded data of the Secrets listed in `.spec.secrets`, by reference name.
    pub secrets: &'a BTreeMap<String, BTreeMap<String, String>>,
    pub environment: &'a Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Rendered {
    pub manifest_name: String,
    /// Configuration after defaulting, as handed to the templates.
    pub config: Value,
    pub template: ObjectSetTemplateSpec,
}

pub fn render(input: &RenderInput<'_>) -> Result<Rendered, LoadError> {
    let loaded = manifest::load(input.files, input.body.component.as_deref())?;
    let manifest = &loaded.manifest;
    if !manifest.supports(input.scope) {
        return Err(LoadError::Scope(format!("package does not support the {:?} scope", input.scope)));
    }

    let mut config = input.body.config.clone().unwrap_or(Value::Object(Map::new()));
    if let Some(schema) = &manifest.spec.config.open_api_v3_schema {
        config::apply_defaults(schema, &mut config);
        let violations = config::validate(schema, &config);
        if !violations.is_empty() {
            return Err(LoadError::Config(violations.join(", ")));
        }
    }

    let images = manifest::image_map(manifest, |i| input.registry.replace_host(i));
    let context = json!({
        "package": {
            "metadata": {
                "name": input.package.name.clone().unwrap_or_default(),
                "namespace": input.package.namespace.clone().unwrap_or_default(),
                "labels": input.package.labels.clone().unwrap_or_default(),
                "annotations": input.package.annotations.clone().unwrap_or_default(),
            },
            "image": input.image,
            "secrets": input.secrets,
        },
        "config": config,
        "images": images,
        "environment": input.environment,
    });

    let files = render_templates(&loaded.files, &context)?;
    let mut objects = collect_objects(&files)?;
    let labels = BTreeMap::from([
        (PACKAGE_LABEL.to_string(), manifest.metadata.name.clone()),
        (PACKAGE_INSTANCE_LABEL.to_string(), input.package.name.clone().unwrap_or_default()),
    ]);
    for (_, obj) in objects.iter_mut() {
        add_labels(obj, &labels);
    }
    let mut template = assemble(manifest, objects)?;

    if input.body.component.is_none() && manifest.has_components() {
        let children: Vec<ObjectSetObject> = manifest::component_names(input.files)
            .into_iter()
            .map(|name| ObjectSetObject { object: child_package(input, &name, &labels), ..Default::default() })
            .collect();
        if !children.is_empty() {
            template.phases.push(ObjectSetTemplatePhase {
                name: COMPONENTS_PHASE.into(),
                objects: children,
                ..Default::default()
            });
            if let Some(probe) = presets::probe_for(pko_core::apis::GROUP, input.package_kind) {
                if !template.availability_probes.contains(&probe) {
                    template.availability_probes.push(probe);
                }
            }
        }
    }

    Ok(Rendered { manifest_name: manifest.metadata.name.clone(), config, template })
}

/// Renders every template file; the output replaces the file without suffix.
pub fn render_templates(files: &Files, context: &Value) -> Result<Files, LoadError> {
    let mut out = files.clone();
    for (path, content) in files {
        let (target, go) = match (path.strip_suffix(TEMPLATE_SUFFIX), path.strip_suffix(GO_TEMPLATE_SUFFIX)) {
            (Some(target), _) => (target, false),
            (None, Some(target)) => (target, true),
            (None, None) => continue,
        };
        let source = std::str::from_utf8(content)
            .map_err(|e| LoadError::Template { path: path.clone(), reason: e.to_string() })?;
        let rendered = if go { template::render_go(source, context) } else { template::render(source, context) }
            .map_err(|e| LoadError::Template { path: path.clone(), reason: e.to_string() })?;
        out.remove(path);
        out.insert(target.to_string(), rendered.into_bytes());
    }
    Ok(out)
}

fn is_object_file(path: &str) -> bool {
    let base = path.rsplit('/').next().unwrap_or(path);
    let yaml = base.ends_with(".yaml") || base.ends_with(".yml");
    yaml && !base.starts_with('_') && !(path == "manifest.yaml" || path == "manifest.yml")
}

/// Objects of all YAML files in path order, directories before their
/// siblings. Empty documents are skipped.
pub fn collect_objects(files: &Files) -> Result<Vec<(String, Value)>, LoadError> {
    let mut paths: Vec<&String> = files.keys().filter(|p| is_object_file(p)).collect();
    paths.sort_by_key(|p| p.replace('/', "\x00"));

    let mut objects = Vec::new();
    for path in paths {
        let content = std::str::from_utf8(&files[path])
            .map_err(|e| LoadError::Object { path: path.clone(), reason: e.to_string() })?;
        for (i, doc) in DOCUMENT_SEPARATOR.split(content).enumerate() {
            if doc.trim().is_empty() {
                continue;
            }
            let at = format!("{}#{}", path, i);
            let value: Value =
                serde_yaml::from_str(doc).map_err(|e| LoadError::Object { path: at.clone(), reason: e.to_string() })?;
            if value.is_null() {
                continue;
            }
            if !value.is_object() || gvk_of_value(&value).is_none() {
                return Err(LoadError::Object { path: at, reason: "not a Kubernetes object".into() });
            }
            objects.push((at, value));
        }
    }
    Ok(objects)
}

fn add_labels(obj: &mut Value, labels: &BTreeMap<String, String>) {
    let meta = &mut obj["metadata"];
    if !meta.is_object() {
        *meta = Value::Object(Map::new());
    }
    let current = &mut meta["labels"];
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Some(current) = current.as_object_mut() {
        for (k, v) in labels {
            current.insert(k.clone(), Value::String(v.clone()));
        }
    }
}

/// Removes `key` from the object's annotations and returns its value.
fn take_annotation(obj: &mut Value, key: &str) -> Option<String> {
    let meta = obj.get_mut("metadata")?.as_object_mut()?;
    let annotations = meta.get_mut("annotations")?.as_object_mut()?;
    let value = annotations.remove(key)?;
    if annotations.is_empty() {
        meta.remove("annotations");
    }
    value.as_str().map(str::to_string)
}

/// Parses `Source => prefix/Destination` lines.
pub fn parse_condition_map(raw: &str) -> Result<Vec<ConditionMapping>, String> {
    let mut out = Vec::new();
    for (n, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (source, destination) =
            line.split_once("=>").ok_or_else(|| format!("line {}: expected \"Source => Destination\"", n + 1))?;
        let (source, destination) = (source.trim(), destination.trim());
        if source.is_empty() || destination.is_empty() {
            return Err(format!("line {}: empty condition type", n + 1));
        }
        if !destination.contains('/') {
            return Err(format!("line {}: destination {:?} needs a prefix like \"my-prefix/\"", n + 1, destination));
        }
        out.push(ConditionMapping { source_type: source.into(), destination_type: destination.into() });
    }
    Ok(out)
}

/// Sorts objects into phases and picks the availability probes.
fn assemble(manifest: &PackageManifest, objects: Vec<(String, Value)>) -> Result<ObjectSetTemplateSpec, LoadError> {
    let declared = !manifest.spec.phases.is_empty();
    let order: Vec<(String, String)> = if declared {
        manifest.spec.phases.iter().map(|p| (p.name.clone(), p.class.clone())).collect()
    } else {
        presets::PHASES.iter().map(|p| (p.to_string(), String::new())).collect()
    };

    let mut by_phase: BTreeMap<String, Vec<ObjectSetObject>> = BTreeMap::new();
    let mut kinds = BTreeSet::new();
    for (path, mut obj) in objects {
        let bad = |reason: String| LoadError::Object { path: path.clone(), reason };
        let gvk = gvk_of_value(&obj).ok_or_else(|| bad("not a Kubernetes object".into()))?;
        let phase = match take_annotation(&mut obj, PHASE_ANNOTATION) {
            Some(phase) => phase,
            None if declared => return Err(bad(format!("missing {} annotation", PHASE_ANNOTATION))),
            None => presets::phase_for(&gvk.group, &gvk.kind).to_string(),
        };
        if !order.iter().any(|(name, _)| *name == phase) {
            return Err(bad(format!("phase {:?} is not declared", phase)));
        }
        let condition_mappings = match take_annotation(&mut obj, CONDITION_MAP_ANNOTATION) {
            Some(raw) => parse_condition_map(&raw).map_err(|e| bad(format!("{}: {}", CONDITION_MAP_ANNOTATION, e)))?,
            None => Vec::new(),
        };
        let collision_protection = match take_annotation(&mut obj, COLLISION_PROTECTION_ANNOTATION) {
            Some(raw) => raw.parse().map_err(bad)?,
            None => Default::default(),
        };
        let (group, _) = split_api_version(obj["apiVersion"].as_str().unwrap_or_default());
        kinds.insert((group.to_string(), gvk.kind.clone()));
        by_phase.entry(phase).or_default().push(ObjectSetObject { object: obj, collision_protection, condition_mappings });
    }

    let phases = order
        .into_iter()
        .filter_map(|(name, class)| {
            let objects = by_phase.remove(&name)?;
            Some(ObjectSetTemplatePhase { name, class, objects, ..Default::default() })
        })
        .collect();

    let availability_probes: Vec<ObjectSetProbe> = if manifest.spec.availability_probes.is_empty() {
        kinds.iter().filter_map(|(group, kind)| presets::probe_for(group, kind)).collect()
    } else {
        manifest.spec.availability_probes.clone()
    };

    Ok(ObjectSetTemplateSpec { phases, availability_probes, ..Default::default() })
}

/// Child Package installing one component of the image.
fn child_package(input: &RenderInput<'_>, component: &str, labels: &BTreeMap<String, String>) -> Value {
    let parent = input.package.name.clone().unwrap_or_default();
    let mut spec = json!({ "image": input.body.image, "component": component });
    if let Some(config) = input.body.config.as_ref().and_then(|c| c.get(component)) {
        spec["config"] = config.clone();
    }
    if let Some(secret) = &input.body.image_pull_secret {
        spec["imagePullSecret"] = json!(secret);
    }
    let mut metadata = json!({ "name": format!("{}-{}", parent, component), "labels": labels });
    if let Some(ns) = &input.package.namespace {
        metadata["namespace"] = json!(ns);
    }
    json!({
        "apiVersion": pko_core::apis::API_VERSION,
        "kind": input.package_kind,
        "metadata": metadata,
        "spec": spec,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pko_core::apis::CollisionProtection;

    const MANIFEST: &str = "apiVersion: manifests.package-operator.run/v1alpha1
kind: PackageManifest
metadata:
  name: demo
spec:
  scopes: [Namespaced]
  config:
    openAPIV3Schema:
      type: object
      properties:
        replicas:
          type: integer
          default: 1
";

    fn files(entries: &[(&str, &str)]) -> Files {
        entries.iter().map(|(p, c)| (p.to_string(), c.as_bytes().to_vec())).collect()
    }

    fn meta() -> ObjectMeta {
        ObjectMeta { name: Some("web".into()), namespace: Some("team".into()), ..Default::default() }
    }

    fn run(files: &Files, body: &PackageBody) -> Result<Rendered, LoadError> {
        let meta = meta();
        let registry = Registry::default();
        let secrets = BTreeMap::new();
        let environment = json!({ "kubernetes": { "version": "v1.29.0" } });
        render(&RenderInput {
            files,
            package: &meta,
            body,
            scope: Scope::Namespaced,
            package_kind: "Package",
            image: "quay.io/pko/demo:v1",
            registry: &registry,
            secrets: &secrets,
            environment: &environment,
        })
    }

    #[test]
    fn documents_are_split_and_ordered() {
        let tree = files(&[
            ("z.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: z\n"),
            ("a/b.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: b1\n---\n\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: b2\n"),
            ("a.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n"),
            ("_helpers.yaml", "not: an object"),
            ("README.md", "# docs"),
        ]);
        let names: Vec<String> = collect_objects(&tree)
            .unwrap()
            .into_iter()
            .map(|(_, o)| o["metadata"]["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["b1", "b2", "a", "z"]);
    }

    #[test]
    fn preset_phases_and_probes_apply() {
        let tree = files(&[
            ("manifest.yaml", MANIFEST),
            ("ns.yaml", "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: team\n"),
            (
                "deploy.yaml.j2",
                "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: {{ package.metadata.name }}\nspec:\n  replicas: {{ config.replicas }}\n",
            ),
        ]);
        let rendered = run(&tree, &PackageBody { image: "demo".into(), ..Default::default() }).unwrap();
        assert_eq!(rendered.manifest_name, "demo");
        assert_eq!(rendered.config, json!({ "replicas": 1 }));

        let phases: Vec<&str> = rendered.template.phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(phases, vec!["namespaces", "deploy"]);
        let deploy = &rendered.template.phases[1].objects[0].object;
        assert_eq!(deploy["metadata"]["name"], "web");
        assert_eq!(deploy["spec"]["replicas"], 1);
        assert_eq!(deploy["metadata"]["labels"][PACKAGE_LABEL], "demo");
        assert_eq!(deploy["metadata"]["labels"][PACKAGE_INSTANCE_LABEL], "web");

        assert_eq!(rendered.template.availability_probes.len(), 1);
        assert_eq!(rendered.template.availability_probes[0].selector.kind.as_ref().unwrap().kind, "Deployment");
    }

    #[test]
    fn go_templates_render() {
        let tree = files(&[
            ("manifest.yaml", MANIFEST),
            (
                "deploy.yaml.gotmpl",
                "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: {{ .package.metadata.name }}\nspec:\n  replicas: {{ index .config \"replicas\" | default 3 }}\n",
            ),
        ]);
        let body = PackageBody { config: Some(json!({ "replicas": 2 })), ..Default::default() };
        let rendered = run(&tree, &body).unwrap();
        let deploy = &rendered.template.phases[0].objects[0].object;
        assert_eq!(deploy["metadata"]["name"], "web");
        assert_eq!(deploy["spec"]["replicas"], 2);

        let broken = files(&[("manifest.yaml", MANIFEST), ("cm.yaml.gotmpl", "{{ .config.nope }}")]);
        assert!(matches!(run(&broken, &PackageBody::default()), Err(LoadError::Template { .. })));
    }

    #[test]
    fn declared_phases_need_annotations() {
        let manifest = format!("{}  phases:\n  - name: deploy\n", MANIFEST);
        let annotated = "apiVersion: v1
kind: ConfigMap
metadata:
  name: cm
  annotations:
    package-operator.run/phase: deploy
    package-operator.run/collision-protection: IfNoController
    package-operator.run/condition-map: |
      Available => my-prefix/Available
";
        let tree = files(&[("manifest.yaml", manifest.as_str()), ("cm.yaml", annotated)]);
        let rendered = run(&tree, &PackageBody::default()).unwrap();
        let obj = &rendered.template.phases[0].objects[0];
        assert!(obj.object["metadata"].get("annotations").is_none(), "annotations consumed");
        assert_eq!(obj.collision_protection, CollisionProtection::IfNoController);
        assert_eq!(obj.condition_mappings[0].destination_type, "my-prefix/Available");

        let bare = files(&[("manifest.yaml", manifest.as_str()), ("cm.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n")]);
        assert!(matches!(run(&bare, &PackageBody::default()), Err(LoadError::Object { .. })));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let tree = files(&[("manifest.yaml", MANIFEST)]);
        let body = PackageBody { config: Some(json!({ "replicas": "many" })), ..Default::default() };
        assert!(matches!(run(&tree, &body), Err(LoadError::Config(_))));
    }

    #[test]
    fn components_become_child_packages() {
        let root = "apiVersion: manifests.package-operator.run/v1alpha1
kind: PackageManifest
metadata:
  name: suite
spec:
  scopes: [Namespaced]
  components: {}
";
        let tree = files(&[
            ("manifest.yaml", root),
            ("components/api/manifest.yaml", MANIFEST),
            ("components/api/cm.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: api\n"),
        ]);
        let body = PackageBody { image: "demo".into(), config: Some(json!({ "api": { "replicas": 2 } })), ..Default::default() };
        let rendered = run(&tree, &body).unwrap();
        let last = rendered.template.phases.last().unwrap();
        assert_eq!(last.name, COMPONENTS_PHASE);
        let child = &last.objects[0].object;
        assert_eq!(child["metadata"]["name"], "web-api");
        assert_eq!(child["metadata"]["namespace"], "team");
        assert_eq!(child["spec"]["component"], "api");
        assert_eq!(child["spec"]["config"], json!({ "replicas": 2 }));

        let api = run(&tree, &PackageBody { component: Some("api".into()), ..Default::default() }).unwrap();
        assert_eq!(api.template.phases[0].objects[0].object["metadata"]["name"], "api");
    }

    #[test]
    fn condition_maps_need_prefixed_destinations() {
        assert_eq!(parse_condition_map("A => p/B\n\n C=>p/D ").unwrap().len(), 2);
        assert!(parse_condition_map("A -> B").is_err());
        assert!(parse_condition_map("A => B").is_err());
    }
}
