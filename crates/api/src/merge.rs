//! Merge semantics used by the in-memory API.

use serde_json::Value;

/// RFC 7386 merge patch: objects merge recursively, `null` removes a key,
/// everything else replaces.
pub fn json_merge_patch(target: &mut Value, patch: &Value) {
    let Some(patch_obj) = patch.as_object() else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    if let Some(t) = target.as_object_mut() {
        for (k, v) in patch_obj {
            if v.is_null() {
                t.remove(k);
            } else {
                json_merge_patch(t.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    }
}

/// Merge patch that turns `from` into `to`: removed keys become `null`,
/// changed non-object values are replaced wholesale.
pub fn merge_patch_diff(from: &Value, to: &Value) -> Value {
    match (from.as_object(), to.as_object()) {
        (Some(f), Some(t)) => {
            let mut patch = serde_json::Map::new();
            for k in f.keys().filter(|k| !t.contains_key(*k)) {
                patch.insert(k.clone(), Value::Null);
            }
            for (k, v) in t {
                match f.get(k) {
                    Some(old) if old == v => {}
                    Some(old) if old.is_object() && v.is_object() => {
                        patch.insert(k.clone(), merge_patch_diff(old, v));
                    }
                    _ => {
                        patch.insert(k.clone(), v.clone());
                    }
                }
            }
            Value::Object(patch)
        }
        _ => to.clone(),
    }
}

/// Approximation of server-side apply with a single forcing manager:
/// desired fields overwrite live ones, maps merge, lists replace. Fields the
/// desired object does not mention are kept.
pub fn apply_merge(live: &mut Value, desired: &Value) {
    match (live.as_object_mut(), desired.as_object()) {
        (Some(l), Some(d)) => {
            for (k, v) in d {
                match l.get_mut(k) {
                    Some(existing) if existing.is_object() && v.is_object() => apply_merge(existing, v),
                    _ => {
                        l.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        _ => *live = desired.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_patch_removes_nulls() {
        let mut v = json!({"a": 1, "b": {"c": 2, "d": 3}});
        json_merge_patch(&mut v, &json!({"a": null, "b": {"c": 5}}));
        assert_eq!(v, json!({"b": {"c": 5, "d": 3}}));
    }

    #[test]
    fn diff_nulls_removed_keys() {
        let from = json!({"conditions": [1], "controllerOf": [{"name": "a"}], "nested": {"x": 1, "y": 2}});
        let to = json!({"conditions": [1, 2], "nested": {"x": 1}});
        let patch = merge_patch_diff(&from, &to);
        assert_eq!(patch, json!({"controllerOf": null, "conditions": [1, 2], "nested": {"y": null}}));
        let mut applied = from.clone();
        json_merge_patch(&mut applied, &patch);
        assert_eq!(applied, to);
    }

    #[test]
    fn apply_keeps_unmentioned_fields_and_replaces_lists() {
        let mut live = json!({"metadata": {"labels": {"x": "1"}}, "spec": {"ports": [1, 2], "keep": true}});
        apply_merge(&mut live, &json!({"metadata": {"labels": {"y": "2"}}, "spec": {"ports": [3]}}));
        assert_eq!(live["metadata"]["labels"], json!({"x": "1", "y": "2"}));
        assert_eq!(live["spec"]["ports"], json!([3]));
        assert_eq!(live["spec"]["keep"], json!(true));
    }
}
