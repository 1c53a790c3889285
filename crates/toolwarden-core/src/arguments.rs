//! Tool-argument handling: sensitive-field redaction, canonical JSON
//! serialization, and fingerprinting.
//!
//! Arguments arrive as untyped JSON. Before anything is persisted or hashed,
//! field names matching a sensitive pattern are replaced with `"[REDACTED]"`,
//! and the tree is serialized canonically: object keys sorted
//! lexicographically at every level, no extraneous whitespace. The canonical
//! form is the input to both `argument_pattern` rule matching and the
//! anomaly detector's argument fingerprints, so it must be byte-stable.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Replacement literal for redacted fields.
pub const REDACTED: &str = "[REDACTED]";

/// Field-name patterns that are always redacted (case-insensitive substring).
static SENSITIVE_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(password|passwd|secret|token|api[_-]?key|access[_-]?key|private[_-]?key|credential|auth|bearer|jwt)",
    )
    .expect("sensitive-field pattern is valid")
});

/// Returns true if a field name should be redacted.
pub fn is_sensitive_field(name: &str) -> bool {
    SENSITIVE_FIELD.is_match(name)
}

/// Recursively redact sensitive fields from an argument tree.
///
/// Nulls are preserved even under a sensitive name so the shape of the
/// arguments stays inspectable. Arrays and nested objects are recursed.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, val) in map {
                if val.is_null() {
                    out.insert(key.clone(), Value::Null);
                } else if is_sensitive_field(key) {
                    out.insert(key.clone(), Value::String(REDACTED.to_string()));
                } else {
                    out.insert(key.clone(), redact(val));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

/// Serialize a JSON value canonically: keys sorted at every level, compact.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            out.push_str(&serde_json::to_string(s).expect("string serialization cannot fail"))
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(
                    &serde_json::to_string(key).expect("string serialization cannot fail"),
                );
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

/// SHA-256 hex fingerprint of the canonical serialization of a value.
pub fn fingerprint(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    hex::encode(hasher.finalize())
}
