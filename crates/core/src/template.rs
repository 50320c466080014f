//! Template engine shared by ObjectTemplates and package rendering.
//!
//! Jinja syntax via minijinja with strict undefined handling, so a typo in a
//! template surfaces as an error instead of an empty string. Extra filters:
//! `b64enc`, `b64dec`, `to_json`, `to_yaml`. The `jsonpath(obj, path)`
//! function reads a value out of a nested structure.
//!
//! Templates in Go syntax are translated by [`crate::gotemplate`] and get the
//! Go helper functions (`index`, `default`, `printf`, `trimPrefix`, ...) with
//! their Go argument order.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use minijinja::value::{Rest, ValueKind};
use minijinja::{Environment, ErrorKind, UndefinedBehavior, Value};
use serde::Serialize;

use crate::gotemplate;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TemplateError(pub String);

impl From<minijinja::Error> for TemplateError {
    fn from(e: minijinja::Error) -> Self {
        match e.detail() {
            Some(detail) => Self(format!("{}: {}", e.kind(), detail)),
            None => Self(e.to_string()),
        }
    }
}

fn invalid(msg: impl std::fmt::Display) -> minijinja::Error {
    minijinja::Error::new(ErrorKind::InvalidOperation, msg.to_string())
}

fn b64enc(value: String) -> String {
    STANDARD.encode(value)
}

fn b64dec(value: String) -> Result<String, minijinja::Error> {
    let bytes = STANDARD.decode(value.trim()).map_err(invalid)?;
    String::from_utf8(bytes).map_err(invalid)
}

fn to_json(value: Value) -> Result<String, minijinja::Error> {
    serde_json::to_string(&value).map_err(invalid)
}

fn to_yaml(value: Value) -> Result<String, minijinja::Error> {
    let out = serde_yaml::to_string(&value).map_err(invalid)?;
    Ok(out.trim_end().to_string())
}

fn jsonpath(value: Value, path: String) -> Result<Value, minijinja::Error> {
    let root = serde_json::to_value(&value).map_err(invalid)?;
    match crate::jsonpath::get(&root, &path) {
        Some(found) => Ok(Value::from_serialize(found)),
        None => Ok(Value::UNDEFINED),
    }
}

/// Key/value pairs a Go `range` walks: sorted keys for maps, indices for lists.
fn entries(value: &Value) -> Result<Vec<(Value, Value)>, minijinja::Error> {
    match value.kind() {
        ValueKind::Undefined | ValueKind::None => Ok(Vec::new()),
        ValueKind::Map => {
            let mut keys: Vec<Value> = value.try_iter()?.collect();
            keys.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
            keys.into_iter()
                .map(|key| {
                    let item = value.get_item(&key)?;
                    Ok((key, item))
                })
                .collect()
        }
        ValueKind::Seq | ValueKind::Iterable => {
            Ok(value.try_iter()?.enumerate().map(|(i, item)| (Value::from(i), item)).collect())
        }
        _ => Err(invalid(format!("range can't iterate over {}", value))),
    }
}

fn range_values(value: Value) -> Result<Value, minijinja::Error> {
    Ok(Value::from(entries(&value)?.into_iter().map(|(_, v)| v).collect::<Vec<_>>()))
}

fn range_pairs(value: Value) -> Result<Value, minijinja::Error> {
    Ok(Value::from(entries(&value)?.into_iter().map(|(k, v)| Value::from(vec![k, v])).collect::<Vec<_>>()))
}

/// Missing map keys yield none, like indexing a Go map.
fn index(value: Value, keys: Rest<Value>) -> Result<Value, minijinja::Error> {
    let mut current = value;
    for key in keys.iter() {
        current = match current.kind() {
            ValueKind::Map => {
                let item = current.get_item(key)?;
                if item.is_undefined() {
                    Value::from(())
                } else {
                    item
                }
            }
            ValueKind::Seq => {
                let item = current.get_item(key)?;
                if item.is_undefined() {
                    return Err(invalid(format!("index out of range: {}", key)));
                }
                item
            }
            kind => return Err(invalid(format!("can't index item of type {:?}", kind))),
        };
    }
    Ok(current)
}

fn default(fallback: Value, value: Value) -> Value {
    if !value.is_undefined() && value.is_true() {
        value
    } else {
        fallback
    }
}

fn empty(value: Value) -> bool {
    !value.is_true()
}

fn printf(format: String, args: Rest<Value>) -> Result<String, minijinja::Error> {
    let mut out = String::with_capacity(format.len());
    let mut args = args.iter();
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some(verb @ ('s' | 'v' | 'd' | 'q')) => match args.next() {
                Some(arg) if verb == 'q' => out.push_str(&format!("{:?}", arg.to_string())),
                Some(arg) => out.push_str(&arg.to_string()),
                None => out.push_str(&format!("%!{}(MISSING)", verb)),
            },
            Some(other) => return Err(invalid(format!("unsupported printf verb %{}", other))),
            None => out.push_str("%!(NOVERB)"),
        }
    }
    Ok(out)
}

fn quote(value: Value) -> String {
    format!("{:?}", value.to_string())
}

fn indent(width: usize, text: String) -> String {
    let pad = " ".repeat(width);
    text.split('\n').map(|line| format!("{}{}", pad, line)).collect::<Vec<_>>().join("\n")
}

fn nindent(width: usize, text: String) -> String {
    format!("\n{}", indent(width, text))
}

/// A fresh environment with every helper registered.
pub fn environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    env.add_filter("b64enc", b64enc);
    env.add_filter("b64dec", b64dec);
    env.add_filter("to_json", to_json);
    env.add_filter("to_yaml", to_yaml);
    env.add_function("jsonpath", jsonpath);

    env.add_function("__go_values", range_values);
    env.add_function("__go_pairs", range_pairs);
    env.add_function("index", index);
    env.add_function("default", default);
    env.add_function("empty", empty);
    env.add_function("printf", printf);
    env.add_function("quote", quote);
    env.add_function("indent", indent);
    env.add_function("nindent", nindent);
    env.add_function("b64enc", b64enc);
    env.add_function("b64dec", b64dec);
    for name in ["toJson", "toJSON"] {
        env.add_function(name, to_json);
    }
    for name in ["toYaml", "toYAML"] {
        env.add_function(name, to_yaml);
    }
    env.add_function("toString", |v: Value| v.to_string());
    env.add_function("upper", |s: String| s.to_uppercase());
    env.add_function("lower", |s: String| s.to_lowercase());
    env.add_function("trim", |s: String| s.trim().to_string());
    env.add_function("trimPrefix", |prefix: String, s: String| {
        s.strip_prefix(prefix.as_str()).unwrap_or(&s).to_string()
    });
    env.add_function("trimSuffix", |suffix: String, s: String| {
        s.strip_suffix(suffix.as_str()).unwrap_or(&s).to_string()
    });
    env.add_function("replace", |old: String, new: String, s: String| s.replace(&old, &new));
    env.add_function("contains", |needle: String, s: String| s.contains(&needle));
    env.add_function("hasPrefix", |prefix: String, s: String| s.starts_with(&prefix));
    env.add_function("hasSuffix", |suffix: String, s: String| s.ends_with(&suffix));
    env
}

/// Render `source` against `context` in a one-off environment. Sources in Go
/// template syntax are translated first.
pub fn render<C: Serialize>(source: &str, context: &C) -> Result<String, TemplateError> {
    if gotemplate::is_go_template(source) {
        return render_go(source, context);
    }
    Ok(environment().render_str(source, context)?)
}

/// Render `source` as a Go template with `context` as its data.
pub fn render_go<C: Serialize>(source: &str, context: &C) -> Result<String, TemplateError> {
    let translated = gotemplate::translate(source)?;
    let data = BTreeMap::from([(gotemplate::ROOT, Value::from_serialize(context))]);
    Ok(environment().render_str(&translated, data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn config_values_and_filters() {
        let ctx = json!({"config": {"name": "web", "secret": "aGVsbG8="}});
        assert_eq!(render("{{ config.name | upper }}", &ctx).unwrap(), "WEB");
        assert_eq!(render("{{ config.secret | b64dec }}", &ctx).unwrap(), "hello");
        assert_eq!(render("{{ 'hello' | b64enc }}", &ctx).unwrap(), "aGVsbG8=");
    }

    #[test]
    fn structured_output() {
        let ctx = json!({"config": {"labels": {"app": "web"}}});
        assert_eq!(render("{{ config.labels | to_json }}", &ctx).unwrap(), r#"{"app":"web"}"#);
        assert_eq!(render("{{ config.labels | to_yaml }}", &ctx).unwrap(), "app: web");
    }

    #[test]
    fn jsonpath_lookup() {
        let ctx = json!({"obj": {"metadata": {"labels": {"app.kubernetes.io/name": "web"}}}});
        let out = render("{{ jsonpath(obj, \".metadata.labels['app.kubernetes.io/name']\") }}", &ctx).unwrap();
        assert_eq!(out, "web");
    }

    #[test]
    fn undefined_values_fail() {
        let err = render("{{ config.missing.deeper }}", &json!({"config": {}})).unwrap_err();
        assert!(!err.0.is_empty());
    }

    #[test]
    fn bad_base64_fails() {
        assert!(render("{{ 'not base64!' | b64dec }}", &json!({})).is_err());
    }

    #[test]
    fn go_password_lookup() {
        let src = r#"{{ index .config "password" | default "" | b64dec }}"#;
        assert_eq!(render(src, &json!({"config": {"password": "aGVsbG8="}})).unwrap(), "hello");
        assert_eq!(render(src, &json!({"config": {}})).unwrap(), "");
        assert_eq!(render(r#"{{ index .config "user" | default "admin" }}"#, &json!({"config": {}})).unwrap(), "admin");
    }

    #[test]
    fn go_blocks_and_helpers() {
        let ctx = json!({"config": {
            "name": "web",
            "ports": [80, 443],
            "labels": {"b": "2", "a": "1"},
            "tls": true,
        }});
        let src = "{{ .config.name | upper }}\n\
            {{- range .config.ports }} {{ . }}{{ end }}\n\
            {{ range $k, $v := .config.labels }}{{ $k }}={{ $v }};{{ end }}\n\
            {{ if .config.tls }}tls{{ else }}plain{{ end }}\n\
            {{ with .config.name }}{{ printf \"%s-%d\" . 1 }}{{ end }}\n\
            {{ range .config.ports }}{{ $.config.name }}{{ end }}";
        assert_eq!(render(src, &ctx).unwrap(), "WEB 80 443\na=1;b=2;\ntls\nweb-1\nwebweb");
    }

    #[test]
    fn go_string_functions() {
        let ctx = json!({"image": "quay.io/pko/app:v1", "n": 3});
        assert_eq!(render(r#"{{ .image | trimPrefix "quay.io/" | trimSuffix ":v1" }}"#, &ctx).unwrap(), "pko/app");
        assert_eq!(render(r#"{{ if and (gt .n 2) (hasPrefix "quay" .image) }}big{{ end }}"#, &ctx).unwrap(), "big");
        assert_eq!(render(r#"{{ .n | toString | quote }}"#, &ctx).unwrap(), "\"3\"");
        assert_eq!(render_go(r#"a:{{ "x: 1" | nindent 2 }}"#, &ctx).unwrap(), "a:\n  x: 1");
    }

    #[test]
    fn go_missing_fields_fail() {
        assert!(render("{{ .config.missing }}", &json!({"config": {}})).is_err());
        assert!(render("{{ .config.name", &json!({"config": {}})).is_err());
    }
}
