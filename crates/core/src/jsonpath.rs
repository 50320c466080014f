//! Minimal JSON path grammar shared by probes and object templates.
//!
//! Accepted forms: `.spec.foo`, `spec.items[0].name`, `{.data.key}` and
//! bracket-quoted keys for names containing dots: `.metadata.labels['app.kubernetes.io/name']`.

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid json path {path:?}: {reason}")]
pub struct PathError {
    pub path: String,
    pub reason: &'static str,
}

fn err(path: &str, reason: &'static str) -> PathError {
    PathError { path: path.to_string(), reason }
}

/// Strip the relaxed-JSONPath wrappers (`{...}` and a leading `.`).
fn trim_path(jp: &str) -> &str {
    let s = jp.trim();
    let s = s.strip_prefix('{').and_then(|x| x.strip_suffix('}')).unwrap_or(s);
    s.strip_prefix('$').unwrap_or(s)
}

pub fn parse(jp: &str) -> Result<Vec<Segment>, PathError> {
    let s = trim_path(jp);
    if s.contains('?') || s.contains('*') || s.contains("..") {
        return Err(err(jp, "filters, wildcards and recursive descent are not supported"));
    }
    let s = s.strip_prefix('.').unwrap_or(s);
    if s.is_empty() {
        return Err(err(jp, "empty path"));
    }
    let bytes = s.as_bytes();
    let mut out = Vec::new();
    let mut i = 0usize;
    let mut key = String::new();
    while i < bytes.len() {
        match bytes[i] {
            b'.' => {
                if key.is_empty() && out.is_empty() {
                    return Err(err(jp, "empty segment"));
                }
                if !key.is_empty() {
                    out.push(Segment::Key(std::mem::take(&mut key)));
                }
                i += 1;
                if i >= bytes.len() {
                    return Err(err(jp, "trailing dot"));
                }
            }
            b'[' => {
                if !key.is_empty() {
                    out.push(Segment::Key(std::mem::take(&mut key)));
                }
                let end = s[i..].find(']').map(|e| e + i).ok_or_else(|| err(jp, "unclosed bracket"))?;
                let inner = &s[i + 1..end];
                let quoted = inner
                    .strip_prefix('\'')
                    .and_then(|x| x.strip_suffix('\''))
                    .or_else(|| inner.strip_prefix('"').and_then(|x| x.strip_suffix('"')));
                match quoted {
                    Some(k) if !k.is_empty() => out.push(Segment::Key(k.to_string())),
                    Some(_) => return Err(err(jp, "empty quoted key")),
                    None => {
                        let idx: usize = inner.parse().map_err(|_| err(jp, "index must be a non-negative integer"))?;
                        out.push(Segment::Index(idx));
                    }
                }
                i = end + 1;
            }
            b']' => return Err(err(jp, "unbalanced bracket")),
            _ => {
                // Multi-byte characters are copied through verbatim.
                let ch_len = s[i..].chars().next().map(|c| c.len_utf8()).unwrap_or(1);
                key.push_str(&s[i..i + ch_len]);
                i += ch_len;
            }
        }
    }
    if !key.is_empty() {
        out.push(Segment::Key(key));
    }
    if out.is_empty() {
        return Err(err(jp, "empty path"));
    }
    Ok(out)
}

/// Canonical dotted rendering without the leading dot, or None when invalid.
pub fn normalize_json_path(jp: &str) -> Option<String> {
    let segs = parse(jp).ok()?;
    let mut out = String::new();
    for seg in segs {
        match seg {
            Segment::Key(k) if k.contains('.') => out.push_str(&format!("['{}']", k)),
            Segment::Key(k) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(&k);
            }
            Segment::Index(i) => out.push_str(&format!("[{}]", i)),
        }
    }
    Some(out)
}

pub fn get_segments<'a>(root: &'a Value, segs: &[Segment]) -> Option<&'a Value> {
    let mut cur = root;
    for seg in segs {
        cur = match (seg, cur) {
            (Segment::Key(k), Value::Object(map)) => map.get(k)?,
            (Segment::Index(i), Value::Array(arr)) => arr.get(*i)?,
            _ => return None,
        };
    }
    Some(cur)
}

/// Resolve `path` against `root`; invalid paths resolve to nothing.
pub fn get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let segs = parse(path).ok()?;
    get_segments(root, &segs)
}

/// Write `value` at `path`, creating intermediate objects. Array indices must already exist.
pub fn set(root: &mut Value, path: &str, value: Value) -> Result<(), PathError> {
    let segs = parse(path)?;
    let mut cur = root;
    let last = segs.len() - 1;
    for (n, seg) in segs.iter().enumerate() {
        match seg {
            Segment::Key(k) => {
                if !cur.is_object() {
                    *cur = Value::Object(Map::new());
                }
                let map = cur.as_object_mut().ok_or_else(|| err(path, "not an object"))?;
                if n == last {
                    map.insert(k.clone(), value);
                    return Ok(());
                }
                cur = map.entry(k.clone()).or_insert_with(|| Value::Object(Map::new()));
            }
            Segment::Index(i) => {
                let arr = cur.as_array_mut().ok_or_else(|| err(path, "not an array"))?;
                let slot = arr.get_mut(*i).ok_or_else(|| err(path, "index out of range"))?;
                if n == last {
                    *slot = value;
                    return Ok(());
                }
                cur = slot;
            }
        }
    }
    Ok(())
}

/// Deep equality that treats `1`, `1.0` and `1u64` as the same number.
pub fn semantic_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(l), Some(r)) => l == r,
            _ => match (x.as_u64(), y.as_u64()) {
                (Some(l), Some(r)) => l == r,
                _ => match (x.as_f64(), y.as_f64()) {
                    (Some(l), Some(r)) => l == r,
                    _ => false,
                },
            },
        },
        (Value::Array(x), Value::Array(y)) => x.len() == y.len() && x.iter().zip(y).all(|(l, r)| semantic_eq(l, r)),
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len() && x.iter().all(|(k, l)| y.get(k).map(|r| semantic_eq(l, r)).unwrap_or(false))
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_json_path_accepts_simple_paths() {
        assert_eq!(normalize_json_path(".spec.foo"), Some("spec.foo".to_string()));
        assert_eq!(normalize_json_path("spec.dnsNames[0]"), Some("spec.dnsNames[0]".to_string()));
        assert_eq!(normalize_json_path("{.data.key}"), Some("data.key".to_string()));
        assert!(normalize_json_path("").is_none());
        assert!(normalize_json_path("spec.*").is_none());
        assert!(normalize_json_path("spec..foo").is_none());
        assert!(normalize_json_path("spec.").is_none());
    }

    #[test]
    fn get_resolves_keys_indices_and_quoted_keys() {
        let v = json!({
            "spec": { "items": [{"name": "a"}, {"name": "b"}] },
            "metadata": { "labels": { "app.kubernetes.io/name": "demo" } }
        });
        assert_eq!(get(&v, ".spec.items[1].name"), Some(&json!("b")));
        assert_eq!(get(&v, "metadata.labels['app.kubernetes.io/name']"), Some(&json!("demo")));
        assert_eq!(get(&v, ".spec.items[5]"), None);
        assert_eq!(get(&v, ".spec.items.name"), None);
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let mut v = json!({});
        set(&mut v, ".database.host", json!("db")).unwrap();
        set(&mut v, ".database.port", json!(5432)).unwrap();
        assert_eq!(v, json!({"database": {"host": "db", "port": 5432}}));
        assert!(set(&mut v, ".database.host[0]", json!(1)).is_err());
    }

    #[test]
    fn semantic_eq_ignores_numeric_representation() {
        assert!(semantic_eq(&json!(3), &json!(3.0)));
        assert!(semantic_eq(&json!({"a": [1, 2]}), &json!({"a": [1.0, 2]})));
        assert!(!semantic_eq(&json!("3"), &json!(3)));
        assert!(!semantic_eq(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
    }
}
