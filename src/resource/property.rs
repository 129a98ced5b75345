//! Dynamically-typed property values.
//!
//! Resource inputs and outputs are ordered maps of [`PropertyValue`]s. Two
//! variants only exist during planning: [`PropertyValue::Unknown`] for values
//! that will be computed later, and [`PropertyValue::Output`] for a reference
//! to another resource's output.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::urn::Urn;

/// Key of a property within a map.
pub type PropertyKey = String;

/// Reference to an output of another resource.
///
/// With no `property` the reference resolves to the resource's provider ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputRef {
    /// Referenced resource.
    pub urn: Urn,
    /// Referenced output property.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property: Option<PropertyKey>,
}

impl OutputRef {
    /// Creates a reference to a named output.
    #[must_use]
    pub fn new(urn: Urn, property: impl Into<PropertyKey>) -> Self {
        Self {
            urn,
            property: Some(property.into()),
        }
    }

    /// Creates a reference to the resource's ID.
    #[must_use]
    pub const fn id_of(urn: Urn) -> Self {
        Self {
            urn,
            property: None,
        }
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.property {
            Some(property) => write!(f, "{}.{}", self.urn, property),
            None => write!(f, "{}.id", self.urn),
        }
    }
}

/// A dynamically-typed property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    /// Explicit null; equivalent to an absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Number.
    Number(f64),
    /// String.
    String(String),
    /// Ordered list.
    Array(Vec<PropertyValue>),
    /// Nested map.
    Object(PropertyMap),
    /// Value that is computed during apply.
    Unknown,
    /// Reference to another resource's output.
    Output(OutputRef),
}

impl PropertyValue {
    /// Returns the type name used in diagnostics.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Unknown => "unknown",
            Self::Output(_) => "output",
        }
    }

    /// Returns true for an explicit null.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns true if the value is not known until apply.
    #[must_use]
    pub const fn is_computed(&self) -> bool {
        matches!(self, Self::Unknown | Self::Output(_))
    }

    /// Returns the string value, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the boolean value, if this is a bool.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the number, if this is a number.
    #[must_use]
    pub const fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the elements, if this is an array.
    #[must_use]
    pub fn as_array(&self) -> Option<&[Self]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the nested map, if this is an object.
    #[must_use]
    pub const fn as_object(&self) -> Option<&PropertyMap> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Returns true if this value or anything nested in it is computed.
    #[must_use]
    pub fn contains_computed(&self) -> bool {
        match self {
            Self::Unknown | Self::Output(_) => true,
            Self::Array(items) => items.iter().any(Self::contains_computed),
            Self::Object(map) => map.values().any(Self::contains_computed),
            _ => false,
        }
    }

    /// Collects every output reference nested in this value.
    pub fn collect_refs<'a>(&'a self, out: &mut Vec<&'a OutputRef>) {
        match self {
            Self::Output(reference) => out.push(reference),
            Self::Array(items) => items.iter().for_each(|v| v.collect_refs(out)),
            Self::Object(map) => map.values().for_each(|v| v.collect_refs(out)),
            _ => {}
        }
    }

    /// Returns true if the value references the given resource.
    #[must_use]
    pub fn references(&self, urn: &Urn) -> bool {
        let mut refs = Vec::new();
        self.collect_refs(&mut refs);
        refs.iter().any(|r| &r.urn == urn)
    }

    /// Replaces output references using `lookup`.
    ///
    /// References the lookup cannot satisfy stay in place.
    #[must_use]
    pub fn resolve<F>(&self, lookup: &F) -> Self
    where
        F: Fn(&OutputRef) -> Option<Self>,
    {
        match self {
            Self::Output(reference) => lookup(reference).unwrap_or_else(|| self.clone()),
            Self::Array(items) => Self::Array(items.iter().map(|v| v.resolve(lookup)).collect()),
            Self::Object(map) => Self::Object(map.resolve(lookup)),
            other => other.clone(),
        }
    }

    /// Converts a plain JSON value.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or_default()),
            serde_json::Value::String(s) => Self::String(s.clone()),
            serde_json::Value::Array(items) => {
                Self::Array(items.iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<Self>> for PropertyValue {
    fn from(value: Vec<Self>) -> Self {
        Self::Array(value)
    }
}

impl From<PropertyMap> for PropertyValue {
    fn from(value: PropertyMap) -> Self {
        Self::Object(value)
    }
}

impl From<OutputRef> for PropertyValue {
    fn from(value: OutputRef) -> Self {
        Self::Output(value)
    }
}

/// Ordered map from property keys to values.
///
/// Iteration follows insertion order. Equality ignores order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyMap(IndexMap<PropertyKey, PropertyValue>);

impl PropertyMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self(IndexMap::new())
    }

    /// Gets a value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.0.get(key)
    }

    /// Gets a value by key, treating null as absent.
    #[must_use]
    pub fn get_set(&self, key: &str) -> Option<&PropertyValue> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    /// Inserts a value, returning the previous one.
    pub fn insert(&mut self, key: impl Into<PropertyKey>, value: impl Into<PropertyValue>) -> Option<PropertyValue> {
        self.0.insert(key.into(), value.into())
    }

    /// Removes a value, preserving the order of the rest.
    pub fn remove(&mut self, key: &str) -> Option<PropertyValue> {
        self.0.shift_remove(key)
    }

    /// Returns true if the key is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Iterates over keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &PropertyKey> {
        self.0.keys()
    }

    /// Iterates over values in order.
    pub fn values(&self) -> impl Iterator<Item = &PropertyValue> {
        self.0.values()
    }

    /// Iterates over entries in order.
    pub fn iter(&self) -> impl Iterator<Item = (&PropertyKey, &PropertyValue)> {
        self.0.iter()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the map has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Collects every output reference in the map.
    #[must_use]
    pub fn output_refs(&self) -> Vec<&OutputRef> {
        let mut refs = Vec::new();
        for value in self.0.values() {
            value.collect_refs(&mut refs);
        }
        refs
    }

    /// Top-level keys whose values reference the given resource.
    #[must_use]
    pub fn keys_referencing(&self, urn: &Urn) -> Vec<PropertyKey> {
        self.0
            .iter()
            .filter(|(_, v)| v.references(urn))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Replaces output references in every value using `lookup`.
    #[must_use]
    pub fn resolve<F>(&self, lookup: &F) -> Self
    where
        F: Fn(&OutputRef) -> Option<PropertyValue>,
    {
        Self(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.resolve(lookup)))
                .collect(),
        )
    }

    /// Returns the first key whose value is still computed after resolution.
    #[must_use]
    pub fn first_computed(&self) -> Option<(&PropertyKey, &PropertyValue)> {
        self.0.iter().find(|(_, v)| v.contains_computed())
    }
}

impl FromIterator<(PropertyKey, PropertyValue)> for PropertyMap {
    fn from_iter<T: IntoIterator<Item = (PropertyKey, PropertyValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a PropertyMap {
    type Item = (&'a PropertyKey, &'a PropertyValue);
    type IntoIter = indexmap::map::Iter<'a, PropertyKey, PropertyValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::TypeToken;

    fn urn(name: &str) -> Urn {
        Urn::new("dev", None, &TypeToken::new("test:index:Thing"), name)
    }

    #[test]
    fn test_map_preserves_insertion_order() {
        let mut map = PropertyMap::new();
        map.insert("zeta", "z");
        map.insert("alpha", "a");
        map.insert("mid", 1.0);

        let keys: Vec<&str> = map.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);

        map.remove("zeta");
        let keys: Vec<&str> = map.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["alpha", "mid"]);
    }

    #[test]
    fn test_nested_references_are_found() {
        let target = urn("bucket");
        let mut inner = PropertyMap::new();
        inner.insert("arn", OutputRef::new(target.clone(), "arn"));

        let mut map = PropertyMap::new();
        map.insert("plain", "value");
        map.insert("policy", PropertyValue::Array(vec![PropertyValue::Object(inner)]));

        assert_eq!(map.keys_referencing(&target), vec![String::from("policy")]);
        assert_eq!(map.output_refs().len(), 1);
        assert!(map.keys_referencing(&urn("other")).is_empty());
    }

    #[test]
    fn test_resolve_leaves_unmatched_references() {
        let known = urn("known");
        let pending = urn("pending");
        let mut map = PropertyMap::new();
        map.insert("a", OutputRef::new(known.clone(), "arn"));
        map.insert("b", OutputRef::id_of(pending));

        let resolved = map.resolve(&|r: &OutputRef| {
            (r.urn == known).then(|| PropertyValue::from("arn:aws:iam::1:role/x"))
        });

        assert_eq!(resolved.get("a").and_then(PropertyValue::as_str), Some("arn:aws:iam::1:role/x"));
        assert!(resolved.get("b").is_some_and(PropertyValue::is_computed));
        assert_eq!(resolved.first_computed().map(|(k, _)| k.as_str()), Some("b"));
    }

    #[test]
    fn test_serde_tagging() {
        let value = PropertyValue::Array(vec![PropertyValue::Null, PropertyValue::from("x")]);
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(
            json,
            r#"{"kind":"array","value":[{"kind":"null"},{"kind":"string","value":"x"}]}"#
        );
        let back: PropertyValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_from_json() {
        let json = serde_json::json!({"a": [1, true, null], "b": {"c": "d"}});
        let value = PropertyValue::from_json(&json);
        let map = value.as_object().unwrap();
        assert_eq!(map.get("a").and_then(PropertyValue::as_array).map(<[_]>::len), Some(3));
        assert_eq!(
            map.get("b").and_then(PropertyValue::as_object).and_then(|m| m.get("c")),
            Some(&PropertyValue::from("d"))
        );
    }
}
