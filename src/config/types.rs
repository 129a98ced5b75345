//! Engine configuration types.
//!
//! These structs map to `converge.yaml`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::resource::{ProviderCapabilities, SchemaRegistry, TypeToken};

/// The root engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// Snapshot backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Apply settings.
    #[serde(default)]
    pub apply: ApplyConfig,
    /// Analyzer settings.
    #[serde(default)]
    pub analyzers: AnalyzersConfig,
    /// Decode settings.
    #[serde(default)]
    pub decode: DecodeConfig,
    /// Per-type provider capabilities.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Project name.
    pub name: String,
    /// Stack name; the URN namespace.
    #[serde(default = "default_stack")]
    pub stack: String,
}

/// Snapshot backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// Local snapshot file (local backend).
    #[serde(default)]
    pub path: Option<String>,
    /// S3 bucket name (s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix.
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region, defaulting to the AWS environment.
    #[serde(default)]
    pub region: Option<String>,
}

/// Snapshot backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file storage.
    #[default]
    Local,
    /// AWS S3 storage.
    S3,
}

/// Apply settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplyConfig {
    /// Maximum steps in flight.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Stop scheduling after this many seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            timeout_secs: None,
        }
    }
}

impl ApplyConfig {
    /// Timeout as a duration.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Analyzer settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalyzersConfig {
    /// Time allowed per analyzer call.
    #[serde(default = "default_analyzer_timeout")]
    pub timeout_secs: u64,
    /// Whether failures abort the run.
    #[serde(default = "default_true")]
    pub enforce: bool,
}

impl Default for AnalyzersConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_analyzer_timeout(),
            enforce: true,
        }
    }
}

impl AnalyzersConfig {
    /// Timeout as a duration.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// What to do with resources that fail decoding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DecodePolicy {
    /// Abort planning with every decode failure.
    #[default]
    AbortRun,
    /// Leave failing resources untouched and plan the rest.
    ExcludeResource,
}

/// Decode settings.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecodeConfig {
    /// Failure policy.
    #[serde(default)]
    pub on_error: DecodePolicy,
}

/// Capabilities of the provider behind one resource type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Resource type token.
    #[serde(rename = "type")]
    pub type_token: String,
    /// The old instance must be deleted before its replacement is created.
    #[serde(default)]
    pub delete_before_replace: bool,
}

impl EngineConfig {
    /// Creates a configuration with defaults for everything but the name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            project: ProjectConfig {
                name: name.into(),
                stack: default_stack(),
            },
            state: StateConfig::default(),
            apply: ApplyConfig::default(),
            analyzers: AnalyzersConfig::default(),
            decode: DecodeConfig::default(),
            providers: Vec::new(),
        }
    }

    /// Applies the configured provider capabilities to a registry.
    pub fn apply_capabilities(&self, registry: &mut SchemaRegistry) {
        for provider in &self.providers {
            registry.set_capabilities(
                TypeToken::new(provider.type_token.as_str()),
                ProviderCapabilities {
                    delete_before_replace: provider.delete_before_replace,
                },
            );
        }
    }
}

fn default_stack() -> String {
    String::from("dev")
}

const fn default_concurrency() -> usize {
    4
}

const fn default_analyzer_timeout() -> u64 {
    30
}

const fn default_true() -> bool {
    true
}
