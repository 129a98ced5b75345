//! File encodings selected by extension.
//!
//! Snapshots, manifests and configuration files share one table of
//! marshalers: `.json` maps to JSON, `.yaml` and `.yml` to YAML.

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

use crate::error::MarshalError;

/// A supported text encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// JSON, pretty-printed on output.
    Json,
    /// YAML.
    Yaml,
}

impl Encoding {
    /// Serializes a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented.
    pub fn encode<T: Serialize>(self, value: &T) -> Result<String, MarshalError> {
        match self {
            Self::Json => Ok(serde_json::to_string_pretty(value)?),
            Self::Yaml => Ok(serde_yaml::to_string(value)?),
        }
    }

    /// Deserializes a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the content does not parse into `T`.
    pub fn decode<T: DeserializeOwned>(self, content: &str) -> Result<T, MarshalError> {
        match self {
            Self::Json => Ok(serde_json::from_str(content)?),
            Self::Yaml => Ok(serde_yaml::from_str(content)?),
        }
    }

    /// Canonical file extension, with the dot.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Json => ".json",
            Self::Yaml => ".yaml",
        }
    }
}

/// Table of encodings keyed by file extension.
#[derive(Debug, Clone)]
pub struct Marshalers {
    by_extension: IndexMap<String, Encoding>,
}

impl Default for Marshalers {
    fn default() -> Self {
        Self::standard()
    }
}

impl Marshalers {
    /// The built-in table.
    #[must_use]
    pub fn standard() -> Self {
        let mut marshalers = Self {
            by_extension: IndexMap::new(),
        };
        marshalers.register(".json", Encoding::Json);
        marshalers.register(".yaml", Encoding::Yaml);
        marshalers.register(".yml", Encoding::Yaml);
        marshalers
    }

    /// Adds or overrides an extension mapping.
    pub fn register(&mut self, extension: &str, encoding: Encoding) {
        let extension = if extension.starts_with('.') {
            extension.to_ascii_lowercase()
        } else {
            format!(".{}", extension.to_ascii_lowercase())
        };
        self.by_extension.insert(extension, encoding);
    }

    /// Encoding for a path, chosen by its extension.
    #[must_use]
    pub fn for_path(&self, path: &Path) -> Option<Encoding> {
        let extension = path.extension()?.to_str()?;
        self.by_extension
            .get(&format!(".{}", extension.to_ascii_lowercase()))
            .copied()
    }

    /// Registered extensions in registration order.
    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.by_extension.keys().map(String::as_str)
    }
}
