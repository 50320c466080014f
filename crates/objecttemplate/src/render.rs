//! Turning the template text into the object to write.

use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use serde_json::{json, Value};

use pko_core::meta::{CACHE_LABEL, CACHE_LABEL_VALUE};
use pko_core::object::{gvk_of_value, value_to_dynamic};
use pko_core::template::{self, TemplateError};

use crate::Error;

fn bad(msg: impl Into<String>) -> Error {
    Error::Template(TemplateError(msg.into()))
}

/// Renders `text` with the sampled values under `config` and the cluster
/// facts under `environment`, then parses the output as one object.
pub(crate) fn render_object(
    text: &str,
    values: &Value,
    environment: &Value,
) -> Result<(GroupVersionKind, DynamicObject), Error> {
    let rendered = template::render(text, &json!({ "config": values, "environment": environment }))?;
    let parsed: Value =
        serde_yaml::from_str(&rendered).map_err(|e| bad(format!("rendered template is not valid YAML: {}", e)))?;
    if !parsed.is_object() {
        return Err(bad("rendered template is not an object"));
    }
    let gvk = gvk_of_value(&parsed).ok_or_else(|| bad("rendered object has no apiVersion or kind"))?;
    if parsed["metadata"]["name"].as_str().map_or(true, str::is_empty) {
        return Err(bad("rendered object has no name"));
    }
    let mut obj = value_to_dynamic(parsed)?;
    obj.metadata.labels.get_or_insert_with(Default::default).insert(CACHE_LABEL.into(), CACHE_LABEL_VALUE.into());
    Ok((gvk, obj))
}

/// Puts `obj` into the namespace its owner allows.
pub(crate) fn place(obj: &mut DynamicObject, owner_ns: Option<&str>, namespaced: bool) -> Result<(), Error> {
    let requested = obj.metadata.namespace.clone().filter(|ns| !ns.is_empty());
    match (owner_ns, namespaced) {
        (Some(_), false) => return Err(bad("cluster-scoped objects need a ClusterObjectTemplate")),
        (Some(own), true) => match requested {
            Some(ns) if ns != own => return Err(bad(format!("must be within namespace {:?}", own))),
            _ => obj.metadata.namespace = Some(own.to_string()),
        },
        (None, true) if requested.is_none() => return Err(bad("rendered object needs a namespace")),
        (None, true) => {}
        (None, false) => obj.metadata.namespace = None,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {{ config.name }}\ndata:\n  region: {{ environment.region }}\n";

    #[test]
    fn renders_with_values_and_environment() {
        let (gvk, obj) = render_object(TEMPLATE, &json!({"name": "out"}), &json!({"region": "eu"})).unwrap();
        assert_eq!(gvk.kind, "ConfigMap");
        assert_eq!(obj.metadata.name.as_deref(), Some("out"));
        assert_eq!(obj.data["data"]["region"], "eu");
        assert_eq!(obj.metadata.labels.unwrap()[CACHE_LABEL], CACHE_LABEL_VALUE);
    }

    #[test]
    fn renders_go_style_templates() {
        let text = "apiVersion: v1\nkind: Secret\nmetadata:\n  name: {{ .config.name }}\ndata:\n  \
            password: {{ index .config \"password\" | default \"\" | b64dec | b64enc | quote }}\n";
        let (gvk, obj) = render_object(text, &json!({"name": "creds", "password": "aHVudGVyMg=="}), &json!({})).unwrap();
        assert_eq!(gvk.kind, "Secret");
        assert_eq!(obj.metadata.name.as_deref(), Some("creds"));
        assert_eq!(obj.data["data"]["password"], "aHVudGVyMg==");

        let (_, obj) = render_object(text, &json!({"name": "creds"}), &json!({})).unwrap();
        assert_eq!(obj.data["data"]["password"], "");
    }

    #[test]
    fn rejects_non_objects() {
        assert!(matches!(render_object("- a\n- b\n", &json!({}), &json!({})), Err(Error::Template(_))));
        assert!(matches!(render_object("kind: ConfigMap\n", &json!({}), &json!({})), Err(Error::Template(_))));
        assert!(matches!(render_object(TEMPLATE, &json!({}), &json!({})), Err(Error::Template(_))));
    }

    #[test]
    fn placement_follows_owner_scope() {
        let (_, mut obj) = render_object(TEMPLATE, &json!({"name": "out"}), &json!({"region": "eu"})).unwrap();
        place(&mut obj, Some("team"), true).unwrap();
        assert_eq!(obj.metadata.namespace.as_deref(), Some("team"));
        assert!(place(&mut obj, Some("other"), true).is_err());
        assert!(place(&mut obj, Some("team"), false).is_err());
        place(&mut obj, None, false).unwrap();
        assert_eq!(obj.metadata.namespace, None);
        assert!(place(&mut obj, None, true).is_err());
    }
}
