//! Property maps attached to service registrations and component configurations.
//!
//! Keys are case-insensitive: a map never holds two keys that differ only in case,
//! and lookups ignore case unless the caller asks for an exact match. The original
//! spelling of each key is preserved for display and exact-match lookups.

use std::collections::BTreeMap;
use std::fmt;

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

/// Interface names a service is published under.
pub const OBJECTCLASS: &str = "objectclass";
/// Registry-assigned, monotonically increasing service id.
pub const SERVICE_ID: &str = "service.id";
/// Scope of a registration: `singleton`, `bundle` or `prototype`.
pub const SERVICE_SCOPE: &str = "service.scope";
/// Signed ranking used to order candidates; defaults to 0.
pub const SERVICE_RANKING: &str = "service.ranking";
/// Id of the bundle that published the service.
pub const SERVICE_BUNDLE_ID: &str = "service.bundleid";
/// Name of the component that published the service.
pub const COMPONENT_NAME: &str = "component.name";
/// Runtime id of the component configuration that published the service.
pub const COMPONENT_ID: &str = "component.id";

/// Dynamically typed property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Char(char),
    Str(String),
    List(Vec<PropertyValue>),
    Map(PropertyMap),
}

impl PropertyValue {
    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view of the value; `None` for non-integral values or `u64` overflow.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(v) => Some(*v),
            PropertyValue::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[PropertyValue]> {
        match self {
            PropertyValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Collects the string elements of a list value (or a single string).
    pub fn string_list(&self) -> Vec<String> {
        match self {
            PropertyValue::Str(s) => vec![s.clone()],
            PropertyValue::List(items) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Null => f.write_str("null"),
            PropertyValue::Bool(v) => write!(f, "{v}"),
            PropertyValue::Int(v) => write!(f, "{v}"),
            PropertyValue::UInt(v) => write!(f, "{v}"),
            PropertyValue::Float(v) => write!(f, "{v}"),
            PropertyValue::Char(v) => write!(f, "{v}"),
            PropertyValue::Str(v) => f.write_str(v),
            PropertyValue::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            PropertyValue::Map(map) => write!(f, "{map}"),
        }
    }
}

macro_rules! impl_from_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for PropertyValue {
            fn from(v: $ty) -> Self {
                PropertyValue::$variant(v.into())
            }
        })*
    };
}

impl_from_value! {
    bool => Bool,
    i8 => Int,
    i16 => Int,
    i32 => Int,
    i64 => Int,
    u8 => UInt,
    u16 => UInt,
    u32 => UInt,
    u64 => UInt,
    f32 => Float,
    f64 => Float,
    char => Char,
    String => Str,
    PropertyMap => Map,
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Str(v.to_owned())
    }
}

impl From<usize> for PropertyValue {
    fn from(v: usize) -> Self {
        PropertyValue::UInt(v as u64)
    }
}

impl<T: Into<PropertyValue>> From<Vec<T>> for PropertyValue {
    fn from(v: Vec<T>) -> Self {
        PropertyValue::List(v.into_iter().map(Into::into).collect())
    }
}

impl From<serde_json::Value> for PropertyValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => PropertyValue::Null,
            serde_json::Value::Bool(b) => PropertyValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    PropertyValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    PropertyValue::UInt(u)
                } else {
                    PropertyValue::Float(n.as_f64().unwrap_or_default())
                }
            }
            serde_json::Value::String(s) => PropertyValue::Str(s),
            serde_json::Value::Array(items) => {
                PropertyValue::List(items.into_iter().map(PropertyValue::from).collect())
            }
            serde_json::Value::Object(obj) => PropertyValue::Map(
                obj.into_iter()
                    .map(|(k, v)| (k, PropertyValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl Serialize for PropertyValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PropertyValue::Null => serializer.serialize_unit(),
            PropertyValue::Bool(v) => serializer.serialize_bool(*v),
            PropertyValue::Int(v) => serializer.serialize_i64(*v),
            PropertyValue::UInt(v) => serializer.serialize_u64(*v),
            PropertyValue::Float(v) => serializer.serialize_f64(*v),
            PropertyValue::Char(v) => serializer.serialize_char(*v),
            PropertyValue::Str(v) => serializer.serialize_str(v),
            PropertyValue::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            PropertyValue::Map(map) => map.serialize(serializer),
        }
    }
}

/// Case-insensitive, key-ordered property map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyMap {
    // lowercased key -> (original key, value)
    entries: BTreeMap<String, (String, PropertyValue)>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, replacing any entry whose key differs only in case.
    /// Returns the replaced value.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Option<PropertyValue> {
        let key = key.into();
        self.entries
            .insert(key.to_ascii_lowercase(), (key, value.into()))
            .map(|(_, old)| old)
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Case-insensitive lookup.
    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(|(_, value)| value)
    }

    /// Lookup that only succeeds when the stored key has exactly this spelling.
    pub fn get_exact(&self, key: &str) -> Option<&PropertyValue> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .filter(|(original, _)| original == key)
            .map(|(_, value)| value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_ascii_lowercase())
    }

    pub fn remove(&mut self, key: &str) -> Option<PropertyValue> {
        self.entries
            .remove(&key.to_ascii_lowercase())
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates `(original key, value)` pairs ordered by lowercased key.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.entries.values().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(|(k, _)| k.as_str())
    }

    /// Copies every entry of `other` into `self`, overriding existing keys.
    pub fn extend_from(&mut self, other: &PropertyMap) {
        for (k, v) in other.iter() {
            self.insert(k, v.clone());
        }
    }
}

impl<K: Into<String>, V: Into<PropertyValue>> FromIterator<(K, V)> for PropertyMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = PropertyMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl fmt::Display for PropertyMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{k}={v}")?;
        }
        f.write_str("}")
    }
}

impl Serialize for PropertyMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (k, v) in self.iter() {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> serde::Deserialize<'de> for PropertyMap {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Map::<String, serde_json::Value>::deserialize(deserializer)?;
        Ok(raw
            .into_iter()
            .map(|(k, v)| (k, PropertyValue::from(v)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_case_insensitive_and_unique() {
        let mut map = PropertyMap::new();
        map.insert("Color", "red");
        let old = map.insert("COLOR", "blue");

        assert_eq!(old, Some(PropertyValue::from("red")));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("color"), Some(&PropertyValue::from("blue")));
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["COLOR"]);
    }

    #[test]
    fn exact_lookup_respects_spelling() {
        let map = PropertyMap::new().with("service.Ranking", 3);
        assert!(map.get_exact("service.ranking").is_none());
        assert_eq!(map.get_exact("service.Ranking"), Some(&PropertyValue::Int(3)));
    }

    #[test]
    fn json_values_convert() {
        let json = serde_json::json!({
            "name": "printer",
            "ports": [1, 2],
            "ratio": 0.5,
            "nested": { "enabled": true }
        });
        let map = match PropertyValue::from(json) {
            PropertyValue::Map(m) => m,
            other => panic!("expected map, got {other:?}"),
        };
        assert_eq!(map.get("NAME").and_then(|v| v.as_str()), Some("printer"));
        assert_eq!(
            map.get("ports"),
            Some(&PropertyValue::List(vec![
                PropertyValue::Int(1),
                PropertyValue::Int(2)
            ]))
        );
        assert_eq!(map.get("ratio"), Some(&PropertyValue::Float(0.5)));
        assert!(matches!(map.get("nested"), Some(PropertyValue::Map(_))));
    }

    #[test]
    fn string_list_reads_lists_and_scalars() {
        assert_eq!(PropertyValue::from("a").string_list(), vec!["a"]);
        assert_eq!(
            PropertyValue::from(vec!["a", "b"]).string_list(),
            vec!["a", "b"]
        );
        assert!(PropertyValue::Int(1).string_list().is_empty());
    }
}
