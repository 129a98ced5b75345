//! AWS Identity and Access Management resources.

use crate::error::DecodeError;
use crate::resource::{
    decode, FieldSchema, FieldType, PropertyMap, PropertyValue, Schema, TypeToken, TypedValue,
};

/// Type token of an IAM role.
pub const ROLE_TYPE: &str = "aws:iam/role:Role";

fn inline_policy_fields() -> Vec<FieldSchema> {
    vec![
        FieldSchema::required("policyDocument", FieldType::Any),
        FieldSchema::required("policyName", FieldType::String),
    ]
}

/// Schema of an IAM role.
///
/// `path` and `roleName` cannot change in place. Attached managed policies
/// are compared as a set.
#[must_use]
pub fn role_schema() -> Schema {
    Schema::new(
        TypeToken::new(ROLE_TYPE),
        vec![
            FieldSchema::required("assumeRolePolicyDocument", FieldType::Any),
            FieldSchema::optional("path", FieldType::String).replaces(),
            FieldSchema::optional("roleName", FieldType::String).replaces(),
            FieldSchema::optional("managedPolicyARNs", FieldType::set(FieldType::String)),
            FieldSchema::optional(
                "policies",
                FieldType::array(FieldType::Object(inline_policy_fields())),
            ),
            FieldSchema::output("arn", FieldType::String),
        ],
    )
}

/// A policy document embedded in a role.
#[derive(Debug, Clone, PartialEq)]
pub struct InlinePolicy {
    /// The policy document.
    pub policy_document: PropertyValue,
    /// Name of the policy; `None` while not yet known.
    pub policy_name: Option<String>,
}

/// Typed view of an IAM role's properties.
///
/// Produced by [`roles`](super::roles) when a manifest is validated.
///
/// Fields whose values are not yet known are `None` (or skipped, for lists).
#[derive(Debug, Clone, PartialEq)]
pub struct Role {
    /// Trust policy.
    pub assume_role_policy_document: PropertyValue,
    /// Role path.
    pub path: Option<String>,
    /// Explicit role name.
    pub role_name: Option<String>,
    /// Attached managed policy ARNs.
    pub managed_policy_arns: Vec<String>,
    /// Inline policies.
    pub policies: Vec<InlinePolicy>,
    /// Role ARN, once created.
    pub arn: Option<String>,
}

impl Role {
    /// Decodes a role from its properties.
    ///
    /// # Errors
    ///
    /// Returns every field failure found.
    pub fn decode(properties: &PropertyMap) -> Result<Self, DecodeError> {
        let record = decode(&role_schema(), properties)?;

        let policies = record
            .get("policies")
            .map(|value| {
                value
                    .items()
                    .iter()
                    .filter_map(TypedValue::fields)
                    .map(|fields| InlinePolicy {
                        policy_document: fields
                            .get("policyDocument")
                            .map_or(PropertyValue::Null, TypedValue::to_property_value),
                        policy_name: fields
                            .get("policyName")
                            .and_then(TypedValue::as_str)
                            .map(ToString::to_string),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            assume_role_policy_document: record
                .get("assumeRolePolicyDocument")
                .map_or(PropertyValue::Null, TypedValue::to_property_value),
            path: record.string("path"),
            role_name: record.string("roleName"),
            managed_policy_arns: record.strings("managedPolicyARNs"),
            policies,
            arn: record.string("arn"),
        })
    }
}
