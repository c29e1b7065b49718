//! Content hashing for entity identity
//!
//! Two processes must agree that they built "the same" trial, so the byte
//! encoding below is fixed and independent of map iteration order:
//!
//! | Value   | Encoding                                      |
//! |---------|-----------------------------------------------|
//! | null    | no bytes (a positional null keeps its `@`)    |
//! | bool    | `b` + 1 byte                                  |
//! | integer | `i` + i64 little endian (`u` + u64 if > i64)  |
//! | float   | `f` + IEEE-754 bits, little endian            |
//! | string  | `s` + u64 length + UTF-8 bytes                |
//! | array   | `[` + u64 length + elements + `]`             |
//! | object  | `{` + (key, value) pairs sorted by key + `}`  |
//!
//! Keyword arguments are sorted by key and prefixed with `=` so they can
//! never collide with positional values.

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::Fields;

/// Incremental SHA-256 hasher over JSON values.
///
/// ```rust
/// use track_store::experiment::ContentHasher;
/// use serde_json::json;
///
/// let mut hasher = ContentHasher::new();
/// hasher.arg(&json!("resnet")).kwarg("lr", &json!(0.01));
/// let digest = hasher.finish();
/// assert_eq!(digest.len(), 64);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ContentHasher {
    hasher: Sha256,
}

impl ContentHasher {
    /// Create an empty hasher
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one positional value. A `null` still occupies its position.
    pub fn arg(&mut self, value: &Value) -> &mut Self {
        self.hasher.update(b"@");
        feed(&mut self.hasher, value);
        self
    }

    /// Feed one keyword value; `null` values (and their key) are ignored.
    pub fn kwarg(&mut self, key: &str, value: &Value) -> &mut Self {
        if !value.is_null() {
            self.hasher.update(b"=");
            feed_str(&mut self.hasher, key);
            feed(&mut self.hasher, value);
        }
        self
    }

    /// Hex encoded digest
    #[must_use]
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Hash ordered positional values and keyword pairs.
///
/// Used for trial content hashes (`name, version, **parameters`) and for
/// trial group uids (`name, project_id`).
#[must_use]
pub fn compute_hash(args: &[Value], kwargs: &Fields) -> String {
    let mut hasher = ContentHasher::new();
    for value in args {
        hasher.arg(value);
    }
    // BTreeMap iteration is already sorted by key
    for (key, value) in kwargs {
        hasher.kwarg(key, value);
    }
    hasher.finish()
}

fn feed_str(hasher: &mut Sha256, s: &str) {
    hasher.update(b"s");
    hasher.update((s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

fn feed(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => {}
        Value::Bool(b) => {
            hasher.update(b"b");
            hasher.update([u8::from(*b)]);
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                hasher.update(b"i");
                hasher.update(i.to_le_bytes());
            } else if let Some(u) = n.as_u64() {
                hasher.update(b"u");
                hasher.update(u.to_le_bytes());
            } else {
                hasher.update(b"f");
                hasher.update(n.as_f64().unwrap_or(f64::NAN).to_bits().to_le_bytes());
            }
        }
        Value::String(s) => feed_str(hasher, s),
        Value::Array(items) => {
            let items: Vec<&Value> = items.iter().filter(|v| !v.is_null()).collect();
            hasher.update(b"[");
            hasher.update((items.len() as u64).to_le_bytes());
            for item in items {
                feed(hasher, item);
            }
            hasher.update(b"]");
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> =
                map.iter().filter(|(_, v)| !v.is_null()).collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            hasher.update(b"{");
            for (key, item) in entries {
                feed_str(hasher, key);
                feed(hasher, item);
            }
            hasher.update(b"}");
        }
    }
}
