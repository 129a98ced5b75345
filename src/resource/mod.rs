//! Resource model: identity, property values, schemas and decoding.

mod decode;
mod model;
mod property;
mod schema;
mod urn;

pub use decode::{decode, DecodedRecord, Decoder, TypedValue};
pub use model::{Resource, ResourceRegistration};
pub use property::{OutputRef, PropertyKey, PropertyMap, PropertyValue};
pub use schema::{
    FieldSchema, FieldType, PropertyMutability, ProviderCapabilities, Schema, SchemaRegistry,
};
pub use urn::{TypeToken, Urn};
