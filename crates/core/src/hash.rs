//! Stable template hashing.
//!
//! The digest is taken over a canonical JSON rendering (object keys sorted,
//! arrays in declared order, numbers printed as parsed) so the same template
//! hashes identically no matter how it was serialized.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Alphabet without vowels and look-alike characters, safe for object names.
const SAFE_ALPHANUMS: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

pub fn canonical_json(v: &Value) -> String {
    let mut out = String::new();
    write_canonical(v, &mut out);
    out
}

fn write_canonical(v: &Value, out: &mut String) {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (n, k) in keys.into_iter().enumerate() {
                if n > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                if let Some(child) = map.get(k) {
                    write_canonical(child, out);
                }
            }
            out.push('}');
        }
        Value::Array(arr) => {
            out.push('[');
            for (n, child) in arr.iter().enumerate() {
                if n > 0 {
                    out.push(',');
                }
                write_canonical(child, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Map every byte of `s` onto the safe alphabet.
pub fn safe_encode(s: &str) -> String {
    s.bytes().map(|b| SAFE_ALPHANUMS[b as usize % SAFE_ALPHANUMS.len()] as char).collect()
}

/// Hash a serializable value together with an optional salt (collision counter or hash modifier).
pub fn compute_hash<T: Serialize>(obj: &T, salt: Option<i32>) -> Result<String, serde_json::Error> {
    let v = serde_json::to_value(obj)?;
    Ok(compute_hash_value(&v, salt))
}

pub fn compute_hash_value(v: &Value, salt: Option<i32>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(v).as_bytes());
    if let Some(s) = salt {
        hasher.update((s as u32).to_le_bytes());
    }
    let digest = hasher.finalize();
    let short = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    safe_encode(&short.to_string())
}
