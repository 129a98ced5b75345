//! Resource type schemas and the registry that holds them.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::property::PropertyKey;
use super::urn::TypeToken;

/// How a change to a field is applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyMutability {
    /// Any change forces replacement.
    Replaces,
    /// Changes are applied in place.
    #[default]
    Updatable,
    /// Computed by the provider; never compared.
    OutputOnly,
    /// May be set once in place; later changes force replacement.
    ImmutableOnceSet,
}

/// Expected shape of a field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    /// Anything.
    Any,
    /// Boolean.
    Bool,
    /// Number.
    Number,
    /// String.
    String,
    /// Ordered list of elements.
    Array(Box<FieldType>),
    /// Unordered collection of distinct elements.
    Set(Box<FieldType>),
    /// String-keyed map with uniform values.
    Map(Box<FieldType>),
    /// Nested record with its own fields.
    Object(Vec<FieldSchema>),
}

impl FieldType {
    /// Array of the given element type.
    #[must_use]
    pub fn array(element: Self) -> Self {
        Self::Array(Box::new(element))
    }

    /// Set of the given element type.
    #[must_use]
    pub fn set(element: Self) -> Self {
        Self::Set(Box::new(element))
    }

    /// Map with the given value type.
    #[must_use]
    pub fn map(value: Self) -> Self {
        Self::Map(Box::new(value))
    }

    /// Type name used in diagnostics.
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::Any => String::from("any"),
            Self::Bool => String::from("bool"),
            Self::Number => String::from("number"),
            Self::String => String::from("string"),
            Self::Array(element) => format!("array<{}>", element.name()),
            Self::Set(element) => format!("set<{}>", element.name()),
            Self::Map(value) => format!("map<{}>", value.name()),
            Self::Object(_) => String::from("object"),
        }
    }
}

/// Declaration of one field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSchema {
    /// Field name.
    pub name: PropertyKey,
    /// Expected shape.
    pub ty: FieldType,
    /// Whether the field may be absent.
    pub optional: bool,
    /// How changes are applied.
    pub mutability: PropertyMutability,
}

impl FieldSchema {
    /// A required, updatable field.
    #[must_use]
    pub fn required(name: impl Into<PropertyKey>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            optional: false,
            mutability: PropertyMutability::Updatable,
        }
    }

    /// An optional, updatable field.
    #[must_use]
    pub fn optional(name: impl Into<PropertyKey>, ty: FieldType) -> Self {
        Self {
            optional: true,
            ..Self::required(name, ty)
        }
    }

    /// A provider-computed field.
    #[must_use]
    pub fn output(name: impl Into<PropertyKey>, ty: FieldType) -> Self {
        Self {
            optional: true,
            mutability: PropertyMutability::OutputOnly,
            ..Self::required(name, ty)
        }
    }

    /// Marks changes to the field as replace-triggering.
    #[must_use]
    pub fn replaces(mut self) -> Self {
        self.mutability = PropertyMutability::Replaces;
        self
    }

    /// Marks the field as settable once.
    #[must_use]
    pub fn immutable_once_set(mut self) -> Self {
        self.mutability = PropertyMutability::ImmutableOnceSet;
        self
    }
}

/// Schema for one resource type.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    /// Type the schema describes.
    pub type_token: TypeToken,
    /// Declared fields, in declaration order.
    pub fields: Vec<FieldSchema>,
}

impl Schema {
    /// Creates a schema.
    #[must_use]
    pub const fn new(type_token: TypeToken, fields: Vec<FieldSchema>) -> Self {
        Self { type_token, fields }
    }

    /// Looks up a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Mutability of a field; undeclared fields are updatable.
    #[must_use]
    pub fn mutability(&self, name: &str) -> PropertyMutability {
        self.field(name).map_or(PropertyMutability::Updatable, |f| f.mutability)
    }
}

/// Per-type behavior declared by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    /// Old instances must be deleted before a replacement is created.
    #[serde(default)]
    pub delete_before_replace: bool,
}

/// Schemas and provider capabilities, keyed by type.
///
/// Built once and passed by reference to the decoder, classifier and planner.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: IndexMap<TypeToken, Schema>,
    capabilities: IndexMap<TypeToken, ProviderCapabilities>,
}

impl SchemaRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a schema, replacing any previous one for the type.
    pub fn register(&mut self, schema: Schema) {
        self.schemas.insert(schema.type_token.clone(), schema);
    }

    /// Declares capabilities for a type.
    pub fn set_capabilities(&mut self, type_token: TypeToken, capabilities: ProviderCapabilities) {
        self.capabilities.insert(type_token, capabilities);
    }

    /// Returns the schema for a type.
    #[must_use]
    pub fn schema(&self, type_token: &TypeToken) -> Option<&Schema> {
        self.schemas.get(type_token)
    }

    /// Returns capabilities for a type, defaulting to create-before-delete.
    #[must_use]
    pub fn capabilities(&self, type_token: &TypeToken) -> ProviderCapabilities {
        self.capabilities.get(type_token).copied().unwrap_or_default()
    }

    /// Mutability of a field; anything unknown is updatable.
    #[must_use]
    pub fn mutability(&self, type_token: &TypeToken, key: &str) -> PropertyMutability {
        self.schema(type_token)
            .map_or(PropertyMutability::Updatable, |s| s.mutability(key))
    }

    /// Declared type of a field.
    #[must_use]
    pub fn field_type(&self, type_token: &TypeToken, key: &str) -> Option<&FieldType> {
        self.schema(type_token).and_then(|s| s.field(key)).map(|f| &f.ty)
    }

    /// Registered types in registration order.
    pub fn types(&self) -> impl Iterator<Item = &TypeToken> {
        self.schemas.keys()
    }

    /// Number of registered schemas.
    #[must_use]
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    /// Returns true if no schemas are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_defaults() {
        let bucket = TypeToken::new("aws:s3/bucket:Bucket");
        let mut registry = SchemaRegistry::new();
        registry.register(Schema::new(
            bucket.clone(),
            vec![
                FieldSchema::required("bucket", FieldType::String).replaces(),
                FieldSchema::optional("tags", FieldType::map(FieldType::String)),
            ],
        ));

        assert_eq!(registry.mutability(&bucket, "bucket"), PropertyMutability::Replaces);
        assert_eq!(registry.mutability(&bucket, "tags"), PropertyMutability::Updatable);
        assert_eq!(registry.mutability(&bucket, "undeclared"), PropertyMutability::Updatable);
        assert!(!registry.capabilities(&bucket).delete_before_replace);

        let unknown = TypeToken::new("acme:index:Thing");
        assert_eq!(registry.mutability(&unknown, "x"), PropertyMutability::Updatable);
    }

    #[test]
    fn test_field_type_names() {
        assert_eq!(FieldType::array(FieldType::String).name(), "array<string>");
        assert_eq!(FieldType::set(FieldType::Number).name(), "set<number>");
        assert_eq!(FieldType::Object(Vec::new()).name(), "object");
    }
}
