//! Resource identity.
//!
//! A URN has the shape `urn:converge:{stack}::{type-chain}::{name}`. The
//! type chain is the parent's type chain joined to the resource's own type
//! with `$`, so two resources can share a name under different parents.

use serde::{Deserialize, Serialize};
use std::fmt;

const URN_PREFIX: &str = "urn:converge:";
const SEPARATOR: &str = "::";
const TYPE_DELIMITER: char = '$';

/// Resource type token such as `aws:iam/role:Role`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeToken(String);

impl TypeToken {
    /// Creates a type token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the token string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the package segment (before the first `:`).
    #[must_use]
    pub fn package(&self) -> &str {
        self.0.split(':').next().unwrap_or_default()
    }

    /// Checks the token can be embedded in a URN.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.0.is_empty() {
            return Err(String::from("type token is empty"));
        }
        if self.0.contains(SEPARATOR) || self.0.contains(TYPE_DELIMITER) {
            return Err(format!(
                "type token '{}' must not contain '{SEPARATOR}' or '{TYPE_DELIMITER}'",
                self.0
            ));
        }
        Ok(())
    }
}

impl fmt::Display for TypeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TypeToken {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Unique, stable identifier of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Urn(String);

impl Urn {
    /// Builds the URN for a resource.
    #[must_use]
    pub fn new(stack: &str, parent: Option<&Self>, type_token: &TypeToken, name: &str) -> Self {
        let type_chain = match parent {
            Some(parent) => format!("{}{TYPE_DELIMITER}{type_token}", parent.type_chain()),
            None => type_token.to_string(),
        };
        Self(format!("{URN_PREFIX}{stack}{SEPARATOR}{type_chain}{SEPARATOR}{name}"))
    }

    /// Parses a URN string, checking its shape.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.strip_prefix(URN_PREFIX)?;
        let mut parts = rest.splitn(3, SEPARATOR);
        let stack = parts.next()?;
        let chain = parts.next()?;
        let name = parts.next()?;
        if stack.is_empty() || chain.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self(value.to_string()))
    }

    fn segments(&self) -> (&str, &str, &str) {
        let rest = self.0.strip_prefix(URN_PREFIX).unwrap_or(&self.0);
        let mut parts = rest.splitn(3, SEPARATOR);
        let stack = parts.next().unwrap_or_default();
        let chain = parts.next().unwrap_or_default();
        let name = parts.next().unwrap_or_default();
        (stack, chain, name)
    }

    /// Returns the stack segment.
    #[must_use]
    pub fn stack(&self) -> &str {
        self.segments().0
    }

    /// Returns the full type chain including parent types.
    #[must_use]
    pub fn type_chain(&self) -> &str {
        self.segments().1
    }

    /// Returns the resource's own type.
    #[must_use]
    pub fn type_token(&self) -> TypeToken {
        let chain = self.type_chain();
        TypeToken::new(chain.rsplit(TYPE_DELIMITER).next().unwrap_or(chain))
    }

    /// Returns the logical name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.segments().2
    }

    /// Returns the URN string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urn_segments() {
        let role = TypeToken::new("aws:iam/role:Role");
        let urn = Urn::new("prod", None, &role, "deployer");

        assert_eq!(urn.as_str(), "urn:converge:prod::aws:iam/role:Role::deployer");
        assert_eq!(urn.stack(), "prod");
        assert_eq!(urn.type_token(), role);
        assert_eq!(urn.name(), "deployer");
    }

    #[test]
    fn test_parent_type_chain() {
        let component = TypeToken::new("acme:index:Service");
        let role = TypeToken::new("aws:iam/role:Role");
        let parent = Urn::new("dev", None, &component, "api");
        let child = Urn::new("dev", Some(&parent), &role, "api-role");

        assert_eq!(child.type_chain(), "acme:index:Service$aws:iam/role:Role");
        assert_eq!(child.type_token(), role);
        assert_ne!(child, Urn::new("dev", None, &role, "api-role"));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Urn::parse("urn:converge:dev::a:b:C::name").is_some());
        assert!(Urn::parse("urn:other:dev::a:b:C::name").is_none());
        assert!(Urn::parse("urn:converge:dev::a:b:C").is_none());
    }

    #[test]
    fn test_type_token_validation() {
        assert!(TypeToken::new("aws:s3/bucket:Bucket").validate().is_ok());
        assert!(TypeToken::new("").validate().is_err());
        assert!(TypeToken::new("a$b").validate().is_err());
        assert_eq!(TypeToken::new("aws:s3/bucket:Bucket").package(), "aws");
    }
}
