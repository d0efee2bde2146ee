//! Ordered dynamic dictionaries
//!
//! `Dict` is the untyped structured value used throughout the store: an
//! insertion-ordered mapping from string keys to [`Value`] variants. Key
//! prefixes carry meaning: keys starting with `_` are *computed* (never
//! persisted), keys starting with `.` are *hidden* (persisted, but omitted
//! from public serializations).
//!
//! JSON is the canonical wire format. Timestamps serialize as `@<millis>`
//! strings, paths as absolute slash strings, bytes as base64. Insertion
//! order is preserved in both directions.

use std::fmt;

use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::path::StoragePath;

/// A single dynamically-typed value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Time(DateTime<Utc>),
    Bytes(Vec<u8>),
    Path(StoragePath),
    Array(Vec<Value>),
    Dict(Dict),
}

impl Value {
    /// Short name of the variant, for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Time(_) => "timestamp",
            Value::Bytes(_) => "bytes",
            Value::Path(_) => "path",
            Value::Array(_) => "array",
            Value::Dict(_) => "dict",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Boolean value, coercing the strings `"true"` and `"false"`
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Str(s) if s == "true" => Some(true),
            Value::Str(s) if s == "false" => Some(false),
            _ => None,
        }
    }

    /// Integer value, coercing whole floats and numeric strings
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Timestamp value, coercing epoch-milli integers and both the
    /// `@<millis>` and ISO-8601 string forms
    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Time(t) => Some(*t),
            Value::Int(ms) => Utc.timestamp_millis_opt(*ms).single(),
            Value::Str(s) => parse_time(s),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<StoragePath> {
        match self {
            Value::Path(p) => Some(p.clone()),
            Value::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    if let Some(ms) = s.strip_prefix('@') {
        return ms
            .parse::<i64>()
            .ok()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}
impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}
impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Time(v)
    }
}
impl From<StoragePath> for Value {
    fn from(v: StoragePath) -> Self {
        Value::Path(v)
    }
}
impl From<Dict> for Value {
    fn from(v: Dict) -> Self {
        Value::Dict(v)
    }
}
impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

/// An insertion-ordered string-keyed dictionary
///
/// Lookups are linear; dicts in the store are small and the order is part
/// of the contract (serializations must reproduce it).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dict {
    entries: Vec<(String, Value)>,
    sealed: bool,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    /// True for keys omitted from every serialization (`_` prefix)
    pub fn is_computed_key(key: &str) -> bool {
        key.starts_with('_')
    }

    /// True for keys persisted but hidden from public output (`.` prefix)
    pub fn is_hidden_key(key: &str) -> bool {
        key.starts_with('.')
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Set a key, replacing any existing value in place
    ///
    /// # Panics
    ///
    /// Panics if the dict has been sealed. Sealing marks a dict as part of
    /// the immutable configuration surface; mutating one is a kernel bug.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        assert!(!self.sealed, "attempt to modify sealed dict");
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
        self
    }

    /// Fallible variant of [`set`](Self::set) for callers handling
    /// externally-supplied dicts
    pub fn try_set(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<(), SealedError> {
        if self.sealed {
            return Err(SealedError);
        }
        self.set(key, value);
        Ok(())
    }

    /// Remove a key, returning its previous value
    ///
    /// # Panics
    ///
    /// Panics if the dict has been sealed.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        assert!(!self.sealed, "attempt to modify sealed dict");
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    /// Seal this dict and every nested dict against further mutation
    pub fn seal(&mut self) {
        self.sealed = true;
        for (_, value) in &mut self.entries {
            seal_value(value);
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// An unsealed copy of this dict
    ///
    /// Nested values are copied along; their seal state is reset as well,
    /// so a sealed template can be copied and then modified freely.
    pub fn copy(&self) -> Dict {
        let mut entries = self.entries.clone();
        for (_, value) in &mut entries {
            unseal_value(value);
        }
        Dict {
            entries,
            sealed: false,
        }
    }

    // Typed getters with defaults

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get_str(key).unwrap_or(default)
    }

    pub fn int_or(&self, key: &str, default: i64) -> i64 {
        self.get(key).and_then(Value::as_int).unwrap_or(default)
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn float_or(&self, key: &str, default: f64) -> f64 {
        self.get(key).and_then(Value::as_float).unwrap_or(default)
    }

    pub fn time(&self, key: &str) -> Option<DateTime<Utc>> {
        self.get(key).and_then(|v| v.as_time())
    }

    pub fn path(&self, key: &str) -> Option<StoragePath> {
        self.get(key).and_then(Value::as_path)
    }

    pub fn dict(&self, key: &str) -> Option<&Dict> {
        self.get(key).and_then(Value::as_dict)
    }

    pub fn array(&self, key: &str) -> Option<&[Value]> {
        self.get(key).and_then(Value::as_array)
    }

    /// String items of an array value, skipping non-strings
    pub fn str_array(&self, key: &str) -> Vec<&str> {
        self.array(key)
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    // JSON conversion

    /// Serialize for persistence: computed (`_`) keys omitted
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Serialize for external clients: computed and hidden keys omitted
    pub fn to_public_json(&self) -> String {
        serde_json::to_string(&PublicView(self)).unwrap_or_else(|_| "{}".to_string())
    }

    /// Public serialization as a `serde_json::Value` tree
    pub fn to_public_value(&self) -> serde_json::Value {
        serde_json::to_value(PublicView(self)).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Dict> {
        serde_json::from_str(text)
    }
}

fn seal_value(value: &mut Value) {
    match value {
        Value::Dict(d) => d.seal(),
        Value::Array(a) => a.iter_mut().for_each(seal_value),
        _ => {}
    }
}

fn unseal_value(value: &mut Value) {
    match value {
        Value::Dict(d) => {
            d.sealed = false;
            d.entries.iter_mut().for_each(|(_, v)| unseal_value(v));
        }
        Value::Array(a) => a.iter_mut().for_each(unseal_value),
        _ => {}
    }
}

/// Error returned by [`Dict::try_set`] on a sealed dict
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("dict is sealed")]
pub struct SealedError;

impl fmt::Display for Dict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_json())
    }
}

// Serialization: persistence scope by default, `_` keys skipped.

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Time(t) => serializer.collect_str(&format_args!("@{}", t.timestamp_millis())),
            Value::Bytes(b) => {
                serializer.collect_str(&base64::engine::general_purpose::STANDARD.encode(b))
            }
            Value::Path(p) => serializer.collect_str(p),
            Value::Array(a) => {
                let mut seq = serializer.serialize_seq(Some(a.len()))?;
                for item in a {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Dict(d) => d.serialize(serializer),
        }
    }
}

impl Serialize for Dict {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let visible: Vec<_> = self
            .entries
            .iter()
            .filter(|(k, _)| !Dict::is_computed_key(k))
            .collect();
        let mut map = serializer.serialize_map(Some(visible.len()))?;
        for (key, value) in visible {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Serialization wrapper omitting hidden (`.`) keys as well, recursively
pub struct PublicView<'a>(pub &'a Dict);

struct PublicValue<'a>(&'a Value);

impl Serialize for PublicView<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let visible: Vec<_> = self
            .0
            .entries
            .iter()
            .filter(|(k, _)| !Dict::is_computed_key(k) && !Dict::is_hidden_key(k))
            .collect();
        let mut map = serializer.serialize_map(Some(visible.len()))?;
        for (key, value) in visible {
            map.serialize_entry(key, &PublicValue(value))?;
        }
        map.end()
    }
}

impl Serialize for PublicValue<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            Value::Dict(d) => PublicView(d).serialize(serializer),
            Value::Array(a) => {
                let mut seq = serializer.serialize_seq(Some(a.len()))?;
                for item in a {
                    seq.serialize_element(&PublicValue(item))?;
                }
                seq.end()
            }
            other => other.serialize(serializer),
        }
    }
}

// Deserialization visits entries in document order, so insertion order in
// the source text survives the round trip without an intermediate tree.

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("any JSON value")
            }

            fn visit_unit<E>(self) -> Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_bool<E>(self, v: bool) -> Result<Value, E> {
                Ok(Value::Bool(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Value, E> {
                Ok(Value::Int(v))
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Value, E> {
                i64::try_from(v)
                    .map(Value::Int)
                    .map_err(|_| E::custom("integer out of range"))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Value, E> {
                Ok(Value::Float(v))
            }

            fn visit_str<E>(self, v: &str) -> Result<Value, E> {
                // `@<millis>` strings round-trip back into timestamps
                if v.len() > 1 && v.starts_with('@') && v[1..].bytes().all(|b| b.is_ascii_digit()) {
                    if let Some(t) = parse_time(v) {
                        return Ok(Value::Time(t));
                    }
                }
                Ok(Value::Str(v.to_string()))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(Value::Array(items))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Value, A::Error> {
                let mut dict = Dict::new();
                while let Some((key, value)) = access.next_entry::<String, Value>()? {
                    dict.set(key, value);
                }
                Ok(Value::Dict(dict))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

impl<'de> Deserialize<'de> for Dict {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Dict(d) => Ok(d),
            other => Err(serde::de::Error::custom(format!(
                "expected object, found {}",
                other.type_name()
            ))),
        }
    }
}
