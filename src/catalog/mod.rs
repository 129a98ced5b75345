//! Built-in resource schemas.

mod iam;

pub use iam::{role_schema, InlinePolicy, Role, ROLE_TYPE};

use tracing::debug;

use crate::resource::{Resource, SchemaRegistry, Urn};

/// Registry pre-loaded with every built-in schema.
#[must_use]
pub fn standard_registry() -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    registry.register(role_schema());
    registry
}

/// Typed views of every role among `resources`.
///
/// Roles whose properties do not decode are skipped; the decoder reports
/// those separately.
#[must_use]
pub fn roles<'r>(resources: impl IntoIterator<Item = &'r Resource>) -> Vec<(Urn, Role)> {
    resources
        .into_iter()
        .filter(|resource| resource.type_token.as_str() == ROLE_TYPE)
        .filter_map(|resource| match Role::decode(&resource.inputs) {
            Ok(role) => Some((resource.urn.clone(), role)),
            Err(e) => {
                debug!("Skipping role {}: {}", resource.urn, e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{PropertyMap, PropertyMutability, PropertyValue, TypeToken};

    #[test]
    fn test_standard_registry_has_role() {
        let registry = standard_registry();
        let role = TypeToken::new(ROLE_TYPE);
        assert!(registry.schema(&role).is_some());
        assert_eq!(registry.mutability(&role, "path"), PropertyMutability::Replaces);
        assert_eq!(registry.mutability(&role, "arn"), PropertyMutability::OutputOnly);
    }

    #[test]
    fn test_roles_decodes_only_valid_roles() {
        let role_urn = |name: &str| Urn::new("dev", None, &TypeToken::new(ROLE_TYPE), name);
        let mut inputs = PropertyMap::new();
        inputs.insert("assumeRolePolicyDocument", PropertyValue::from_json(&serde_json::json!({})));
        inputs.insert("path", "/service/");
        let valid = Resource::new(role_urn("app"), inputs);
        let broken = Resource::new(role_urn("broken"), PropertyMap::new());
        let other = Resource::new(
            Urn::new("dev", None, &TypeToken::new("test:index:Thing"), "thing"),
            PropertyMap::new(),
        );

        let roles = roles([&valid, &broken, &other]);
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].0, role_urn("app"));
        assert_eq!(roles[0].1.path.as_deref(), Some("/service/"));
    }
}
