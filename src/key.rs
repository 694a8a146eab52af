//! Query keys and their canonical hashes.
//!
//! A key is any JSON value, usually an array such as `["user", 1]`. Its hash is the
//! key serialized with object members sorted by name, so member order never affects
//! identity while array order does.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Logical identity of a cached read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Value);

impl QueryKey {
    pub fn new(value: impl Into<Value>) -> Self {
        Self(value.into())
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Canonical hash of this key.
    pub fn hash(&self) -> QueryHash {
        hash_key(self)
    }

    /// True when every member present in `filter` recursively matches this key.
    pub fn matches(&self, filter: &QueryKey) -> bool {
        partial_match_key(&self.0, &filter.0)
    }
}

impl From<Value> for QueryKey {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(parts: Vec<Value>) -> Self {
        Self(Value::Array(parts))
    }
}

impl From<&str> for QueryKey {
    fn from(part: &str) -> Self {
        Self(Value::Array(vec![Value::String(part.to_string())]))
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hash())
    }
}

/// Canonical string form of a [`QueryKey`], used for map lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryHash(String);

impl QueryHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for QueryHash {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for QueryHash {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for QueryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Custom key hashing, settable per query.
pub type KeyHashFn = Arc<dyn Fn(&QueryKey) -> QueryHash + Send + Sync>;

/// Hash a key, sorting object members at every depth.
pub fn hash_key(key: &QueryKey) -> QueryHash {
    let mut out = String::new();
    write_canonical(&key.0, &mut out);
    QueryHash(out)
}

/// Hash with the query's own hash function when one is configured.
pub fn hash_key_with(key: &QueryKey, hash_fn: Option<&KeyHashFn>) -> QueryHash {
    match hash_fn {
        Some(f) => f(key),
        None => hash_key(key),
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (name, member)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical(member, out);
            }
            out.push('}');
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
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Partial structural match: `b` is a prefix/subset of `a`.
///
/// Arrays match element-wise over the indices present in `b`; objects match over the
/// members present in `b`; scalars must be equal.
pub fn partial_match_key(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Array(a), Value::Array(b)) => b
            .iter()
            .enumerate()
            .all(|(i, bv)| a.get(i).is_some_and(|av| partial_match_key(av, bv))),
        (Value::Object(a), Value::Object(b)) => b
            .iter()
            .all(|(k, bv)| a.get(k).is_some_and(|av| partial_match_key(av, bv))),
        (Value::Array(_), Value::Object(_)) | (Value::Object(_), Value::Array(_)) => false,
        (a, b) => a == b,
    }
}
