//! Configuration parser for loading engine configuration.
//!
//! Configuration comes from a YAML or JSON file, then environment variable
//! overrides, with `.env` loaded first when present.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::encoding::{Encoding, Marshalers};
use crate::error::{ConfigError, Result};

use super::types::EngineConfig;

/// Configuration parser for loading engine configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving `.env`.
    base_path: Option<PathBuf>,
    /// Encodings by file extension.
    marshalers: Marshalers,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base path for resolving `.env`.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a file, choosing the encoding by extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, has an unknown extension,
    /// or cannot be parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<EngineConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }
            .into());
        }

        let encoding = self.marshalers.for_path(path).ok_or_else(|| ConfigError::UnsupportedFormat {
            path: path.to_path_buf(),
        })?;

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::parse(format!("Failed to read file: {e}"), path.display().to_string()))?;

        self.parse(&content, encoding, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<EngineConfig> {
        self.parse(content, Encoding::Yaml, source)
    }

    fn parse(&self, content: &str, encoding: Encoding, source: Option<&Path>) -> Result<EngineConfig> {
        debug!("Parsing {:?} configuration", encoding);

        let config: EngineConfig = encoding.decode(content).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
            location: source.map(|p| p.display().to_string()),
        })?;

        debug!("Successfully parsed configuration for project: {}", config.project.name);
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Recognized variables: `CONVERGE_STACK`, `CONVERGE_STATE_BUCKET`,
    /// `CONVERGE_STATE_PREFIX` and `CONVERGE_STATE_PATH`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<EngineConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config, |name| std::env::var(name).ok());
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(config: &mut EngineConfig, var: impl Fn(&str) -> Option<String>) {
        if let Some(stack) = var("CONVERGE_STACK") {
            debug!("Overriding project.stack from environment");
            config.project.stack = stack;
        }

        if let Some(bucket) = var("CONVERGE_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }

        if let Some(prefix) = var("CONVERGE_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }

        if let Some(path) = var("CONVERGE_STATE_PATH") {
            debug!("Overriding state.path from environment");
            config.state.path = Some(path);
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ConfigError::parse(format!("Failed to load .env file: {e}"), env_path.display().to_string())
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["converge.yaml", "converge.yml", "converge.json"];

/// Finds the configuration file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DecodePolicy, StateBackend};
    use crate::error::ConvergeError;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
project:
  name: web
";
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        assert_eq!(config.project.name, "web");
        assert_eq!(config.project.stack, "dev");
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r"
project:
  name: web
  stack: prod

state:
  backend: s3
  bucket: converge-state
  prefix: web/prod

apply:
  concurrency: 8
  timeout_secs: 600

analyzers:
  timeout_secs: 5
  enforce: false

decode:
  on_error: exclude_resource

providers:
  - type: aws:iam/role:Role
    deleteBeforeReplace: true
";
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        assert_eq!(config.project.stack, "prod");
        assert_eq!(config.state.backend, StateBackend::S3);
        assert_eq!(config.apply.concurrency, 8);
        assert!(!config.analyzers.enforce);
        assert_eq!(config.decode.on_error, DecodePolicy::ExcludeResource);
        assert!(config.providers[0].delete_before_replace);
    }

    #[test]
    fn test_load_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("converge.json");
        std::fs::write(&path, r#"{"project": {"name": "web", "stack": "qa"}}"#).unwrap();

        let config = ConfigParser::new().load_file(&path).unwrap();
        assert_eq!(config.project.stack, "qa");
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("converge.toml");
        std::fs::write(&path, "").unwrap();

        let err = ConfigParser::new().load_file(&path).unwrap_err();
        assert!(matches!(err, ConvergeError::Config(ConfigError::UnsupportedFormat { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ConfigParser::new().parse_yaml("project:\n  name: web\n", None).unwrap();
        ConfigParser::apply_env_overrides(&mut config, |name| match name {
            "CONVERGE_STACK" => Some(String::from("staging")),
            "CONVERGE_STATE_PATH" => Some(String::from("state.yaml")),
            _ => None,
        });
        assert_eq!(config.project.stack, "staging");
        assert_eq!(config.state.path.as_deref(), Some("state.yaml"));
        assert!(config.state.bucket.is_none());
    }

    #[test]
    fn test_find_config_in_parent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("converge.yaml"), "project:\n  name: web\n").unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, dir.path().join("converge.yaml"));
    }
}
