//! Engine configuration.
//!
//! - Parsing `converge.yaml` (or `.yml`/`.json`) with environment overrides
//! - Validation of configuration values, reporting every problem at once

mod parser;
mod types;
mod validator;

pub use parser::{find_config_file, ConfigParser, DEFAULT_CONFIG_FILES};
pub use types::{
    AnalyzersConfig, ApplyConfig, DecodeConfig, DecodePolicy, EngineConfig, ProjectConfig, ProviderConfig,
    StateBackend, StateConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
