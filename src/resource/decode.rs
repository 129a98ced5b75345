//! Schema-driven decoding of property maps into typed records.
//!
//! Decoding never stops at the first problem: every missing, unrecognized
//! and wrongly-typed field is collected into one [`DecodeError`]. Nested
//! fields are reported with dotted paths (`policies[0].policyName`).
//! Computed values (unknowns and output references) satisfy any field type
//! since their shape is only known at apply time.

use indexmap::IndexMap;
use tracing::debug;

use crate::error::{DecodeError, FieldError, ResourceDecodeError};

use super::model::Resource;
use super::property::{PropertyKey, PropertyMap, PropertyValue};
use super::schema::{FieldSchema, FieldType, PropertyMutability, Schema, SchemaRegistry};
use super::urn::TypeToken;

/// A value that matched its declared field type.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    /// Boolean.
    Bool(bool),
    /// Number.
    Number(f64),
    /// String.
    String(String),
    /// Ordered elements.
    Array(Vec<TypedValue>),
    /// Unordered elements.
    Set(Vec<TypedValue>),
    /// String-keyed values.
    Map(IndexMap<PropertyKey, TypedValue>),
    /// Nested record.
    Object(IndexMap<PropertyKey, TypedValue>),
    /// Field declared as `any`; kept as-is.
    Any(PropertyValue),
    /// Not known until apply.
    Computed(PropertyValue),
}

impl TypedValue {
    /// Returns the string, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the boolean, if this is a bool.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the elements of an array or set.
    #[must_use]
    pub fn items(&self) -> &[Self] {
        match self {
            Self::Array(items) | Self::Set(items) => items,
            _ => &[],
        }
    }

    /// Returns the fields of an object or entries of a map.
    #[must_use]
    pub const fn fields(&self) -> Option<&IndexMap<PropertyKey, Self>> {
        match self {
            Self::Object(fields) | Self::Map(fields) => Some(fields),
            _ => None,
        }
    }

    /// Returns true if the value is computed.
    #[must_use]
    pub const fn is_computed(&self) -> bool {
        matches!(self, Self::Computed(_))
    }

    /// Converts back into an untyped value.
    #[must_use]
    pub fn to_property_value(&self) -> PropertyValue {
        match self {
            Self::Bool(b) => PropertyValue::Bool(*b),
            Self::Number(n) => PropertyValue::Number(*n),
            Self::String(s) => PropertyValue::String(s.clone()),
            Self::Array(items) | Self::Set(items) => {
                PropertyValue::Array(items.iter().map(Self::to_property_value).collect())
            }
            Self::Map(fields) | Self::Object(fields) => PropertyValue::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_property_value()))
                    .collect(),
            ),
            Self::Any(value) | Self::Computed(value) => value.clone(),
        }
    }
}

/// A property map that passed schema decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    /// Decoded type.
    pub type_token: TypeToken,
    /// Present fields in schema order.
    pub fields: IndexMap<PropertyKey, TypedValue>,
}

impl DecodedRecord {
    /// Gets a field.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TypedValue> {
        self.fields.get(name)
    }

    /// Gets a string field.
    #[must_use]
    pub fn string(&self, name: &str) -> Option<String> {
        self.get(name).and_then(TypedValue::as_str).map(ToString::to_string)
    }

    /// Gets the string elements of a list field, skipping computed ones.
    #[must_use]
    pub fn strings(&self, name: &str) -> Vec<String> {
        self.get(name)
            .map(|v| {
                v.items()
                    .iter()
                    .filter_map(TypedValue::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Decodes a property map against a schema.
///
/// # Errors
///
/// Returns every field failure found.
pub fn decode(schema: &Schema, properties: &PropertyMap) -> Result<DecodedRecord, DecodeError> {
    let mut error = DecodeError::new(schema.type_token.clone());
    let fields = decode_fields(&schema.type_token, &schema.fields, properties, "", &mut error);

    if error.is_empty() {
        Ok(DecodedRecord {
            type_token: schema.type_token.clone(),
            fields,
        })
    } else {
        Err(error)
    }
}

fn field_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn decode_fields(
    type_token: &TypeToken,
    fields: &[FieldSchema],
    properties: &PropertyMap,
    prefix: &str,
    error: &mut DecodeError,
) -> IndexMap<PropertyKey, TypedValue> {
    let mut decoded = IndexMap::new();

    for field in fields {
        let path = field_path(prefix, &field.name);
        match properties.get_set(&field.name) {
            None => {
                let required =
                    !field.optional && field.mutability != PropertyMutability::OutputOnly;
                if required {
                    error.add_failure(FieldError::Missing {
                        type_token: type_token.clone(),
                        field: path,
                    });
                }
            }
            Some(value) => {
                if let Some(typed) = decode_value(type_token, &field.ty, value, &path, error) {
                    decoded.insert(field.name.clone(), typed);
                }
            }
        }
    }

    for key in properties.keys() {
        if !fields.iter().any(|f| &f.name == key) {
            error.add_failure(FieldError::Unrecognized {
                type_token: type_token.clone(),
                field: field_path(prefix, key),
            });
        }
    }

    decoded
}

fn decode_elements(
    type_token: &TypeToken,
    element: &FieldType,
    items: &[PropertyValue],
    path: &str,
    error: &mut DecodeError,
) -> Vec<TypedValue> {
    items
        .iter()
        .enumerate()
        .filter_map(|(i, item)| decode_value(type_token, element, item, &format!("{path}[{i}]"), error))
        .collect()
}

fn decode_value(
    type_token: &TypeToken,
    ty: &FieldType,
    value: &PropertyValue,
    path: &str,
    error: &mut DecodeError,
) -> Option<TypedValue> {
    if value.is_computed() {
        return Some(TypedValue::Computed(value.clone()));
    }

    match (ty, value) {
        (FieldType::Any, v) => Some(TypedValue::Any(v.clone())),
        (FieldType::Bool, PropertyValue::Bool(b)) => Some(TypedValue::Bool(*b)),
        (FieldType::Number, PropertyValue::Number(n)) => Some(TypedValue::Number(*n)),
        (FieldType::String, PropertyValue::String(s)) => Some(TypedValue::String(s.clone())),
        (FieldType::Array(element), PropertyValue::Array(items)) => Some(TypedValue::Array(
            decode_elements(type_token, element, items, path, error),
        )),
        (FieldType::Set(element), PropertyValue::Array(items)) => Some(TypedValue::Set(
            decode_elements(type_token, element, items, path, error),
        )),
        (FieldType::Map(element), PropertyValue::Object(map)) => {
            let entries = map
                .iter()
                .filter_map(|(k, v)| {
                    decode_value(type_token, element, v, &field_path(path, k), error)
                        .map(|typed| (k.clone(), typed))
                })
                .collect();
            Some(TypedValue::Map(entries))
        }
        (FieldType::Object(fields), PropertyValue::Object(map)) => Some(TypedValue::Object(
            decode_fields(type_token, fields, map, path, error),
        )),
        (expected, actual) => {
            error.add_failure(FieldError::WrongType {
                type_token: type_token.clone(),
                field: path.to_string(),
                expected: expected.name(),
                actual: actual.type_name().to_string(),
            });
            None
        }
    }
}

/// Decodes resources against the schemas in a registry.
#[derive(Debug, Clone, Copy)]
pub struct Decoder<'a> {
    registry: &'a SchemaRegistry,
}

impl<'a> Decoder<'a> {
    /// Creates a decoder over a registry.
    #[must_use]
    pub const fn new(registry: &'a SchemaRegistry) -> Self {
        Self { registry }
    }

    /// Decodes a property map for a type.
    ///
    /// Returns `Ok(None)` when the type has no registered schema.
    ///
    /// # Errors
    ///
    /// Returns every field failure found.
    pub fn decode(
        &self,
        type_token: &TypeToken,
        properties: &PropertyMap,
    ) -> Result<Option<DecodedRecord>, DecodeError> {
        match self.registry.schema(type_token) {
            Some(schema) => decode(schema, properties).map(Some),
            None => {
                debug!("No schema registered for {}, skipping decode", type_token);
                Ok(None)
            }
        }
    }

    /// Decodes the inputs of every resource, collecting the failures.
    #[must_use]
    pub fn check_all<'r>(&self, resources: impl IntoIterator<Item = &'r Resource>) -> Vec<ResourceDecodeError> {
        resources
            .into_iter()
            .filter_map(|resource| {
                self.decode(&resource.type_token, &resource.inputs)
                    .err()
                    .map(|error| ResourceDecodeError {
                        urn: resource.urn.clone(),
                        error,
                    })
            })
            .collect()
    }
}
