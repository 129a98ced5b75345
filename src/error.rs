//! Error types for the Converge deployment engine.
//!
//! Planning diagnostics (decode, graph, analyzer) are aggregates: every
//! problem found in a run is collected and reported together instead of
//! stopping at the first one. Apply-time provider errors are reported per
//! step by the executor.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

use crate::analyzer::{AnalyzeFailure, AnalyzeResourceFailure};
use crate::resource::{TypeToken, Urn};

/// The main error type for the Converge deployment engine.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Snapshot storage errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// One or more desired resources failed schema decoding.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeFailures),

    /// The desired or prior resource graph is malformed.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Analyzers reported policy violations.
    #[error("Analysis failed: {0}")]
    Analyze(#[from] AnalyzeError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Provider errors raised outside of step execution.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration or manifest file was not found.
    #[error("File not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed; carries every problem found.
    #[error("Configuration validation failed with {} error(s): {}", .errors.len(), .errors.join("; "))]
    Invalid {
        /// Rendered `field: message` entries.
        errors: Vec<String>,
    },

    /// No marshaler is registered for the file extension.
    #[error("Unsupported file format: {path}")]
    UnsupportedFormat {
        /// The offending path.
        path: PathBuf,
    },
}

/// Snapshot storage errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// Snapshot file not found.
    #[error("Snapshot not found: {path}")]
    NotFound {
        /// Path to the missing snapshot.
        path: PathBuf,
    },

    /// Snapshot is corrupted.
    #[error("Snapshot is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Local storage failure (directory creation, write, rename).
    #[error("Snapshot storage error: {message}")]
    Storage {
        /// Description of the failure.
        message: String,
    },

    /// Lock acquisition failed.
    #[error("Failed to acquire snapshot lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// Lock is held by another process.
    #[error("Snapshot is locked by another process (holder: {holder}, operation: {operation}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// Operation the holder is running.
        operation: String,
        /// When the lock was acquired.
        since: String,
    },

    /// S3 backend error.
    #[error("S3 snapshot backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("Snapshot serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// Snapshot format version mismatch.
    #[error("Snapshot version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected snapshot version.
        expected: String,
        /// Found snapshot version.
        found: String,
    },

    /// No marshaler is registered for the snapshot file extension.
    #[error("Unsupported snapshot format: {path}")]
    UnsupportedFormat {
        /// The offending path.
        path: PathBuf,
    },
}

/// Encoding or decoding failure in one of the registered marshalers.
#[derive(Debug, Error)]
pub enum MarshalError {
    /// JSON failure.
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML failure.
    #[error("YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// A problem decoding a single field of a property map.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    /// A required field is absent (or null).
    #[error("Missing required field '{field}' on '{type_token}'")]
    Missing {
        /// Resource type being decoded.
        type_token: TypeToken,
        /// Field path.
        field: String,
    },

    /// A field is present that the schema does not declare.
    #[error("Unrecognized field '{field}' on '{type_token}'")]
    Unrecognized {
        /// Resource type being decoded.
        type_token: TypeToken,
        /// Field path.
        field: String,
    },

    /// A field has the wrong shape.
    #[error("Field '{field}' on '{type_token}' must be a '{expected}'; got '{actual}' instead")]
    WrongType {
        /// Resource type being decoded.
        type_token: TypeToken,
        /// Field path.
        field: String,
        /// Expected type name.
        expected: String,
        /// Actual type name.
        actual: String,
    },
}

impl FieldError {
    /// Returns the path of the field with a problem.
    #[must_use]
    pub fn field(&self) -> &str {
        match self {
            Self::Missing { field, .. }
            | Self::Unrecognized { field, .. }
            | Self::WrongType { field, .. } => field,
        }
    }

    /// Returns the full diagnostic for the field.
    #[must_use]
    pub fn reason(&self) -> String {
        self.to_string()
    }

    /// Returns true for a missing-field failure.
    #[must_use]
    pub const fn is_missing(&self) -> bool {
        matches!(self, Self::Missing { .. })
    }
}

/// Aggregate of every field failure found while decoding one property map.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", render_field_failures(.failures))]
pub struct DecodeError {
    /// Resource type being decoded.
    pub type_token: TypeToken,
    /// Every failure, in schema order followed by unrecognized fields.
    pub failures: Vec<FieldError>,
}

impl DecodeError {
    /// Creates an empty aggregate for a resource type.
    #[must_use]
    pub const fn new(type_token: TypeToken) -> Self {
        Self {
            type_token,
            failures: Vec::new(),
        }
    }

    /// Registers a new failure.
    pub fn add_failure(&mut self, failure: FieldError) {
        self.failures.push(failure);
    }

    /// Returns the full set of failures.
    #[must_use]
    pub fn failures(&self) -> &[FieldError] {
        &self.failures
    }

    /// Returns true if no failures were recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

fn render_field_failures(failures: &[FieldError]) -> String {
    let mut out = format!("{} fields failed to decode:", failures.len());
    for failure in failures {
        out.push_str(&format!("\n\t{}: {}", failure.field(), failure.reason()));
    }
    out
}

/// A decode failure attributed to one resource.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{urn}: {error}")]
pub struct ResourceDecodeError {
    /// Resource that failed to decode.
    pub urn: Urn,
    /// The aggregated field failures.
    pub error: DecodeError,
}

/// Run-level aggregate of decode failures across all desired resources.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} resource(s) failed to decode: {}", .errors.len(), join_display(.errors))]
pub struct DecodeFailures {
    /// Per-resource failures in declaration order.
    pub errors: Vec<ResourceDecodeError>,
}

impl DecodeFailures {
    /// Total number of field failures across all resources.
    #[must_use]
    pub fn field_failure_count(&self) -> usize {
        self.errors.iter().map(|e| e.error.failures.len()).sum()
    }
}

/// One structural problem in a resource graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphIssue {
    /// The dependency edges contain a cycle.
    #[error("Dependency cycle: {}", render_cycle(.urns))]
    Cycle {
        /// Participating resources, in dependency direction.
        urns: Vec<Urn>,
    },

    /// A resource depends on a URN that is not in the graph.
    #[error("{urn} depends on unknown resource {dependency}")]
    DanglingDependency {
        /// The dependent resource.
        urn: Urn,
        /// The missing dependency.
        dependency: Urn,
    },

    /// Two resources share a URN.
    #[error("Duplicate resource: {urn}")]
    DuplicateUrn {
        /// The repeated URN.
        urn: Urn,
    },

    /// A registration cannot produce a valid URN.
    #[error("Invalid registration '{name}': {reason}")]
    InvalidRegistration {
        /// Logical name of the registration.
        name: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A manifest entry refers to a name that is not declared.
    #[error("'{from}' refers to unknown resource '{name}'")]
    UnknownReference {
        /// The referring entry.
        from: String,
        /// The unresolved name.
        name: String,
    },
}

/// Aggregate of graph problems; fatal to a planning run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} graph issue(s): {}", .issues.len(), join_display(.issues))]
pub struct GraphError {
    /// Every issue found.
    pub issues: Vec<GraphIssue>,
}

impl GraphError {
    /// Wraps a single issue.
    #[must_use]
    pub fn single(issue: GraphIssue) -> Self {
        Self {
            issues: vec![issue],
        }
    }

    /// Returns the first cycle issue, if any.
    #[must_use]
    pub fn cycle(&self) -> Option<&[Urn]> {
        self.issues.iter().find_map(|issue| match issue {
            GraphIssue::Cycle { urns } => Some(urns.as_slice()),
            _ => None,
        })
    }
}

fn render_cycle(urns: &[Urn]) -> String {
    let mut parts: Vec<String> = urns.iter().map(ToString::to_string).collect();
    if let Some(first) = urns.first() {
        parts.push(first.to_string());
    }
    parts.join(" -> ")
}

fn join_display<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Policy violations reported by analyzers, all collected before aborting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
#[error("{} analyzer failure(s)", .failures.len() + .resource_failures.len())]
pub struct AnalyzeError {
    /// Graph-wide failures.
    pub failures: Vec<AnalyzeFailure>,
    /// Resource-scoped failures.
    pub resource_failures: Vec<AnalyzeResourceFailure>,
}

impl AnalyzeError {
    /// Total number of failures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.failures.len() + self.resource_failures.len()
    }

    /// Returns true if nothing was reported.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty() && self.resource_failures.is_empty()
    }
}

/// Failure raised by an analyzer implementation itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct AnalyzerError {
    /// Description of the failure.
    pub message: String,
}

impl AnalyzerError {
    /// Creates an analyzer error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The plan differs from the one that was reviewed.
    #[error("Plan fingerprint mismatch: reviewed {expected}, computed {actual}")]
    FingerprintMismatch {
        /// Fingerprint the caller reviewed.
        expected: String,
        /// Fingerprint of the plan about to run.
        actual: String,
    },

    /// A diff references a resource missing from both graphs.
    #[error("Inconsistent plan input: {message}")]
    Inconsistent {
        /// Description of the inconsistency.
        message: String,
    },
}

/// Errors returned by provider operations.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderError {
    /// The provider rejected or failed the operation.
    #[error("Provider operation failed: {message}")]
    OperationFailed {
        /// Description from the provider.
        message: String,
    },

    /// The physical resource does not exist.
    #[error("Resource not found: {id}")]
    NotFound {
        /// Provider-assigned ID.
        id: String,
    },

    /// An input still references an output that is not known.
    #[error("Input '{property}' references {urn}, whose outputs are not known")]
    UnresolvedInput {
        /// The input property.
        property: String,
        /// The referenced resource.
        urn: Urn,
    },

    /// The recorded resource has no provider ID to operate on.
    #[error("No provider ID recorded for {urn}")]
    MissingId {
        /// The resource lacking an ID.
        urn: Urn,
    },
}

impl ProviderError {
    /// Creates an operation failure.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::OperationFailed {
            message: message.into(),
        }
    }
}

/// Result type alias for Converge operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;

impl ConvergeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true for diagnostics produced before any step ran.
    #[must_use]
    pub const fn is_planning_diagnostic(&self) -> bool {
        matches!(
            self,
            Self::Decode(_) | Self::Graph(_) | Self::Analyze(_) | Self::Plan(_)
        )
    }
}

impl ConfigError {
    /// Creates a parse error with a location.
    #[must_use]
    pub fn parse(message: impl Into<String>, location: impl Into<String>) -> Self {
        Self::ParseError {
            message: message.into(),
            location: Some(location.into()),
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a local storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role() -> TypeToken {
        TypeToken::new("aws:iam/role:Role")
    }

    #[test]
    fn test_decode_error_lists_every_failure() {
        let mut err = DecodeError::new(role());
        err.add_failure(FieldError::Missing {
            type_token: role(),
            field: String::from("assumeRolePolicyDocument"),
        });
        err.add_failure(FieldError::Unrecognized {
            type_token: role(),
            field: String::from("colour"),
        });

        let rendered = err.to_string();
        assert!(rendered.starts_with("2 fields failed to decode:"));
        assert!(rendered.contains("\n\tassumeRolePolicyDocument: Missing required field"));
        assert!(rendered.contains("\n\tcolour: Unrecognized field 'colour'"));
    }

    #[test]
    fn test_cycle_renders_closed_loop() {
        let a = Urn::new("dev", None, &role(), "a");
        let b = Urn::new("dev", None, &role(), "b");
        let issue = GraphIssue::Cycle {
            urns: vec![a.clone(), b.clone()],
        };
        assert_eq!(issue.to_string(), format!("Dependency cycle: {a} -> {b} -> {a}"));
    }

    #[test]
    fn test_planning_diagnostic_classification() {
        let err = ConvergeError::from(GraphError::single(GraphIssue::DuplicateUrn {
            urn: Urn::new("dev", None, &role(), "a"),
        }));
        assert!(err.is_planning_diagnostic());
        assert!(!ConvergeError::internal("boom").is_planning_diagnostic());
    }
}
