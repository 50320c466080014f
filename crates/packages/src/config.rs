//! Package configuration against the manifest's OpenAPI v3 schema: defaults
//! are filled in, then the result is checked.

use serde_json::{Map, Value};

/// Fills `defaults` of the schema into `config`, recursing into object properties.
pub fn apply_defaults(schema: &Value, config: &mut Value) {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else { return };
    if config.is_null() {
        *config = Value::Object(Map::new());
    }
    let Some(obj) = config.as_object_mut() else { return };
    for (key, prop) in properties {
        match obj.get_mut(key) {
            Some(value) => apply_defaults(prop, value),
            None => {
                if let Some(default) = prop.get("default") {
                    let mut value = default.clone();
                    apply_defaults(prop, &mut value);
                    obj.insert(key.clone(), value);
                } else if prop.get("properties").is_some() && has_nested_default(prop) {
                    let mut value = Value::Object(Map::new());
                    apply_defaults(prop, &mut value);
                    obj.insert(key.clone(), value);
                }
            }
        }
    }
}

fn has_nested_default(schema: &Value) -> bool {
    schema.get("properties").and_then(Value::as_object).map_or(false, |props| {
        props.values().any(|p| p.get("default").is_some() || has_nested_default(p))
    })
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "integer" => value.as_f64().map_or(false, |n| n.fract() == 0.0),
        "number" => value.is_number(),
        _ => true,
    }
}

/// Returns one message per violation, each prefixed with its field path.
pub fn validate(schema: &Value, config: &Value) -> Vec<String> {
    let mut out = Vec::new();
    check(schema, config, "config", &mut out);
    out
}

fn check(schema: &Value, value: &Value, path: &str, out: &mut Vec<String>) {
    if value.is_null() && schema.get("nullable").and_then(Value::as_bool) == Some(true) {
        return;
    }
    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !type_matches(expected, value) {
            out.push(format!("{}: expected {}", path, expected));
            return;
        }
    }
    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            out.push(format!("{}: not one of the allowed values", path));
        }
    }
    if let Some(items) = value.as_array() {
        if let Some(item_schema) = schema.get("items") {
            for (i, item) in items.iter().enumerate() {
                check(item_schema, item, &format!("{}[{}]", path, i), out);
            }
        }
        return;
    }
    let Some(obj) = value.as_object() else { return };
    for required in schema.get("required").and_then(Value::as_array).into_iter().flatten() {
        if let Some(name) = required.as_str() {
            if !obj.contains_key(name) {
                out.push(format!("{}.{}: required", path, name));
            }
        }
    }
    let properties = schema.get("properties").and_then(Value::as_object);
    let additional = schema.get("additionalProperties");
    let preserve = schema.get("x-kubernetes-preserve-unknown-fields").and_then(Value::as_bool) == Some(true);
    for (key, child) in obj {
        let child_path = format!("{}.{}", path, key);
        match (properties.and_then(|p| p.get(key)), additional) {
            (Some(prop), _) => check(prop, child, &child_path, out),
            (None, Some(extra @ Value::Object(_))) => check(extra, child, &child_path, out),
            (None, Some(Value::Bool(true))) => {}
            (None, _) if properties.is_some() && !preserve => out.push(format!("{}: unknown field", child_path)),
            (None, _) => {}
        }
    }
}
