//! Configuration validation.
//!
//! Every problem is collected before reporting, so one run shows all of
//! them.

use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

use crate::encoding::Marshalers;
use crate::error::{ConfigError, Result};
use crate::resource::{SchemaRegistry, TypeToken};

use super::types::{EngineConfig, ProjectConfig, ProviderConfig, StateBackend, StateConfig};

/// Validator for engine configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator {
    /// Types with a known schema; providers for other types get a warning.
    known_types: HashSet<TypeToken>,
    /// Encodings allowed for a local snapshot path.
    marshalers: Marshalers,
}

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a validator that knows the types in `registry`.
    #[must_use]
    pub fn new(registry: &SchemaRegistry) -> Self {
        Self {
            known_types: registry.types().cloned().collect(),
            marshalers: Marshalers::standard(),
        }
    }

    /// Validates an engine configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] carrying every error found.
    pub fn validate(&self, config: &EngineConfig) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        self.validate_state(&config.state, &mut result);
        Self::validate_limits(config, &mut result);
        self.validate_providers(&config.providers, &mut result);

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            Err(ConfigError::Invalid {
                errors: result.errors.iter().map(ToString::to_string).collect(),
            }
            .into())
        }
    }

    /// Validates project configuration.
    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.stack.is_empty() {
            result.error("project.stack", "Stack name cannot be empty");
        } else if !is_valid_name(&project.stack) {
            result.error(
                "project.stack",
                format!(
                    "Stack name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.stack
                ),
            );
        }
    }

    /// Validates snapshot backend configuration.
    fn validate_state(&self, state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error("state.bucket", "S3 bucket name is required when using S3 backend");
                }
                if state.path.is_some() {
                    result.warnings.push(String::from("state.path is ignored by the S3 backend"));
                }
            }
            StateBackend::Local => {
                if let Some(path) = &state.path
                    && self.marshalers.for_path(Path::new(path)).is_none()
                {
                    let known: Vec<&str> = self.marshalers.extensions().collect();
                    result.error(
                        "state.path",
                        format!("Unsupported snapshot extension in '{path}'. Expected one of: {}", known.join(", ")),
                    );
                }
            }
        }
    }

    /// Validates apply and analyzer limits.
    fn validate_limits(config: &EngineConfig, result: &mut ValidationResult) {
        if config.apply.concurrency == 0 {
            result.error("apply.concurrency", "Concurrency must be at least 1");
        }
        if config.apply.concurrency > 64 {
            result.warnings.push(format!(
                "apply.concurrency: {} concurrent steps is unusual",
                config.apply.concurrency
            ));
        }
        if config.apply.timeout_secs == Some(0) {
            result.error("apply.timeout_secs", "Apply timeout must be at least 1 second");
        }
        if config.analyzers.timeout_secs == 0 {
            result.error("analyzers.timeout_secs", "Analyzer timeout must be at least 1 second");
        }
        if !config.analyzers.enforce {
            result
                .warnings
                .push(String::from("analyzers.enforce is off: failures will only be reported"));
        }
    }

    /// Validates provider capability entries.
    fn validate_providers(&self, providers: &[ProviderConfig], result: &mut ValidationResult) {
        let mut seen = HashSet::new();

        for (i, provider) in providers.iter().enumerate() {
            let field = format!("providers[{i}].type");
            let token = TypeToken::new(provider.type_token.as_str());

            if let Err(message) = token.validate() {
                result.error(field, message);
                continue;
            }
            if !seen.insert(token.clone()) {
                result.error(field, format!("Duplicate provider entry for {token}"));
                continue;
            }
            if !self.known_types.contains(&token) {
                result.warnings.push(format!("{field}: no schema registered for {token}"));
            }
        }
    }
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::standard_registry;
    use crate::config::ProviderConfig;
    use crate::error::ConvergeError;

    fn validator() -> ConfigValidator {
        ConfigValidator::new(&standard_registry())
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("web"));
        assert!(is_valid_name("my-stack-123"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Web")); // uppercase
        assert!(!is_valid_name("1web")); // starts with number
        assert!(!is_valid_name("web_app")); // underscore
        assert!(!is_valid_name("web-")); // ends with hyphen
        assert!(!is_valid_name("web--app")); // consecutive hyphens
    }

    #[test]
    fn test_defaults_are_valid() {
        let result = validator().validate(&EngineConfig::new("web")).unwrap();
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 0);
    }

    #[test]
    fn test_all_errors_are_reported() {
        let mut config = EngineConfig::new("Web");
        config.state.backend = StateBackend::S3;
        config.apply.concurrency = 0;
        config.providers = vec![
            ProviderConfig {
                type_token: String::from("aws:iam/role:Role"),
                delete_before_replace: true,
            },
            ProviderConfig {
                type_token: String::from("aws:iam/role:Role"),
                delete_before_replace: false,
            },
        ];

        let err = validator().validate(&config).unwrap_err();
        let ConvergeError::Config(ConfigError::Invalid { errors }) = err else {
            panic!("expected aggregated validation error");
        };
        assert_eq!(errors.len(), 4);
        assert!(errors[0].starts_with("project.name"));
        assert!(errors[1].starts_with("state.bucket"));
        assert!(errors[2].starts_with("apply.concurrency"));
        assert!(errors[3].starts_with("providers[1].type"));
    }

    #[test]
    fn test_unknown_provider_type_warns() {
        let mut config = EngineConfig::new("web");
        config.providers.push(ProviderConfig {
            type_token: String::from("aws:s3/bucket:Bucket"),
            delete_before_replace: false,
        });
        let result = validator().validate(&config).unwrap();
        assert_eq!(result.warning_count(), 1);
    }

    #[test]
    fn test_local_path_extension_checked() {
        let mut config = EngineConfig::new("web");
        config.state.path = Some(String::from("state.toml"));
        assert!(validator().validate(&config).is_err());

        config.state.path = Some(String::from("state.yml"));
        assert!(validator().validate(&config).is_ok());
    }
}
