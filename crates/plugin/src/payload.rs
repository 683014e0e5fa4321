//! Typed key/value payloads exchanged between host and worker.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Default upper bound for an encoded payload: 256 KiB.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 256 * 1024;

/// A single payload value.
///
/// Only primitive data and nested bundles. Nothing in a payload is ever
/// evaluated; the receiving side reads it as data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// Boolean flag.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit float.
    Double(f64),
    /// UTF-8 string.
    String(String),
    /// List of strings.
    StringArray(Vec<String>),
    /// List of integers.
    IntArray(Vec<i64>),
    /// Nested bundle.
    Bundle(Payload),
}

impl Value {
    /// Short name of the variant, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Double(_) => "double",
            Self::String(_) => "string",
            Self::StringArray(_) => "string_array",
            Self::IntArray(_) => "int_array",
            Self::Bundle(_) => "bundle",
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Self::StringArray(v)
    }
}

impl From<Vec<i64>> for Value {
    fn from(v: Vec<i64>) -> Self {
        Self::IntArray(v)
    }
}

impl From<Payload> for Value {
    fn from(v: Payload) -> Self {
        Self::Bundle(v)
    }
}

/// Ordered map of string keys to [`Value`]s.
///
/// ```
/// use enclave_plugin::Payload;
///
/// let payload = Payload::new().with("op", "x").with("count", 3);
/// assert_eq!(payload.get_str("op"), Some("x"));
/// assert_eq!(payload.get_i64("count"), Some(3));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(BTreeMap<String, Value>);

impl Payload {
    /// Empty payload.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert a value, returning the previous one under `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Remove a value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Raw value lookup.
    #[inline]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// String value under `key`, if present and a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key)? {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer value under `key`.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Float value under `key`. Integers widen.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.0.get(key)? {
            Value::Double(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Boolean value under `key`.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key)? {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// String list under `key`.
    pub fn get_strings(&self, key: &str) -> Option<&[String]> {
        match self.0.get(key)? {
            Value::StringArray(v) => Some(v),
            _ => None,
        }
    }

    /// Nested bundle under `key`.
    pub fn get_bundle(&self, key: &str) -> Option<&Payload> {
        match self.0.get(key)? {
            Value::Bundle(v) => Some(v),
            _ => None,
        }
    }

    /// Whether `key` is present.
    #[inline]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of top-level entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the payload has no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Size of the payload in its serialised form.
    ///
    /// This is what [`PayloadLimits`] is checked against.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map_or(usize::MAX, |bytes| bytes.len())
    }
}

impl FromIterator<(String, Value)> for Payload {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Payload {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Size bound applied to payloads crossing the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadLimits {
    /// Maximum encoded size in bytes.
    pub max_bytes: usize,
}

impl Default for PayloadLimits {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

impl PayloadLimits {
    /// Check a payload, returning its encoded size when it fits.
    pub fn check(&self, payload: &Payload) -> Result<usize, PayloadTooLarge> {
        let actual = payload.encoded_len();
        if actual > self.max_bytes {
            return Err(PayloadTooLarge {
                limit: self.max_bytes,
                actual,
            });
        }
        Ok(actual)
    }
}

/// A payload exceeded [`PayloadLimits::max_bytes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("payload is {actual} bytes, limit is {limit}")]
pub struct PayloadTooLarge {
    /// Configured limit.
    pub limit: usize,
    /// Encoded size of the rejected payload.
    pub actual: usize,
}
