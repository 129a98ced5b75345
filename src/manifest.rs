//! File-backed program evaluator.
//!
//! A manifest lists resource registrations in declaration order:
//!
//! ```yaml
//! resources:
//!   - type: aws:iam/role:Role
//!     name: app
//!     properties:
//!       assumeRolePolicyDocument: {}
//!       path: /service/
//!   - type: aws:lambda/function:Function
//!     name: handler
//!     dependsOn: [app]
//!     properties:
//!       role: { $output: app.arn }
//! ```
//!
//! `{ $output: name.property }` references another resource's output and
//! `{ $output: name }` its ID. `{ $unknown: true }` is a value that will only
//! be known after apply. Parents must be declared before their children;
//! references and `dependsOn` may point anywhere in the manifest.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use crate::encoding::{Encoding, Marshalers};
use crate::error::{ConfigError, GraphError, GraphIssue, Result};
use crate::resource::{OutputRef, PropertyMap, PropertyValue, ResourceRegistration, TypeToken, Urn};

const OUTPUT_KEY: &str = "$output";
const UNKNOWN_KEY: &str = "$unknown";

/// Produces the desired resource registrations for a stack.
pub trait ProgramEvaluator {
    /// Evaluates the program.
    ///
    /// # Errors
    ///
    /// Returns an error if the program cannot be evaluated.
    fn registrations(&self, stack: &str) -> Result<Vec<ResourceRegistration>>;
}

/// One manifest entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// Resource type token.
    #[serde(rename = "type")]
    pub type_token: String,
    /// Logical name, unique within the manifest.
    pub name: String,
    /// Name of the parent entry.
    #[serde(default)]
    pub parent: Option<String>,
    /// Names of explicit dependencies.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Input properties.
    #[serde(default)]
    pub properties: IndexMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    resources: Vec<ManifestEntry>,
}

/// Loads registrations from a YAML or JSON manifest.
#[derive(Debug, Clone, Default)]
pub struct ManifestEvaluator {
    entries: Vec<ManifestEntry>,
}

impl ManifestEvaluator {
    /// Creates an evaluator from entries.
    #[must_use]
    pub const fn new(entries: Vec<ManifestEntry>) -> Self {
        Self { entries }
    }

    /// Loads a manifest file, choosing the encoding by extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, has an unknown extension,
    /// or cannot be parsed.
    pub fn load(path: impl AsRef<Path>, marshalers: &Marshalers) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading manifest from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }
            .into());
        }
        let encoding = marshalers.for_path(path).ok_or_else(|| ConfigError::UnsupportedFormat {
            path: path.to_path_buf(),
        })?;
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::parse(format!("Failed to read manifest: {e}"), path.display().to_string()))?;

        Self::parse(&content, encoding)
            .map_err(|e| ConfigError::parse(e.to_string(), path.display().to_string()).into())
    }

    /// Parses manifest text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text does not parse.
    pub fn parse(content: &str, encoding: Encoding) -> Result<Self> {
        let file: ManifestFile = encoding.decode(content).map_err(|e| ConfigError::ParseError {
            message: format!("Manifest parse error: {e}"),
            location: None,
        })?;
        debug!("Parsed manifest with {} resource(s)", file.resources.len());
        Ok(Self::new(file.resources))
    }

    /// Entries in declaration order.
    #[must_use]
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    /// Assigns a URN to every uniquely named entry.
    ///
    /// Returns the URNs by name and, per entry, the URN it was given. A
    /// rejected entry gets `None`.
    fn assign_urns(&self, stack: &str, issues: &mut Vec<GraphIssue>) -> (HashMap<&str, Urn>, Vec<Option<Urn>>) {
        let mut urns: HashMap<&str, Urn> = HashMap::new();
        let mut assigned = Vec::with_capacity(self.entries.len());

        for entry in &self.entries {
            assigned.push(None);
            if urns.contains_key(entry.name.as_str()) {
                issues.push(GraphIssue::InvalidRegistration {
                    name: entry.name.clone(),
                    reason: String::from("name is declared more than once"),
                });
                continue;
            }
            let parent = match &entry.parent {
                None => None,
                Some(name) => match urns.get(name.as_str()) {
                    Some(urn) => Some(urn.clone()),
                    None => {
                        issues.push(GraphIssue::UnknownReference {
                            from: entry.name.clone(),
                            name: name.clone(),
                        });
                        continue;
                    }
                },
            };
            let token = TypeToken::new(entry.type_token.as_str());
            let urn = Urn::new(stack, parent.as_ref(), &token, &entry.name);
            if let Some(slot) = assigned.last_mut() {
                *slot = Some(urn.clone());
            }
            urns.insert(entry.name.as_str(), urn);
        }
        (urns, assigned)
    }
}

impl ProgramEvaluator for ManifestEvaluator {
    fn registrations(&self, stack: &str) -> Result<Vec<ResourceRegistration>> {
        let mut issues = Vec::new();
        let (urns, assigned) = self.assign_urns(stack, &mut issues);
        let mut registrations = Vec::with_capacity(self.entries.len());

        for (entry, urn) in self.entries.iter().zip(&assigned) {
            if urn.is_none() {
                continue;
            }
            let mut lookup = |name: &str| match urns.get(name) {
                Some(target) => Some(target.clone()),
                None => {
                    issues.push(GraphIssue::UnknownReference {
                        from: entry.name.clone(),
                        name: name.to_string(),
                    });
                    None
                }
            };

            let inputs: PropertyMap = entry
                .properties
                .iter()
                .map(|(key, value)| (key.clone(), convert(value, &mut lookup)))
                .collect();

            let mut registration = ResourceRegistration::new(entry.type_token.as_str(), entry.name.as_str(), inputs);
            if let Some(parent) = &entry.parent
                && let Some(parent_urn) = urns.get(parent.as_str())
            {
                registration = registration.with_parent(parent_urn.clone());
            }
            for dependency in &entry.depends_on {
                if let Some(target) = lookup(dependency) {
                    registration = registration.with_dependency(target);
                }
            }

            registrations.push(registration);
        }

        if issues.is_empty() {
            Ok(registrations)
        } else {
            Err(GraphError { issues }.into())
        }
    }
}

/// Converts a manifest value, turning reference markers into property values.
fn convert(value: &serde_json::Value, lookup: &mut impl FnMut(&str) -> Option<Urn>) -> PropertyValue {
    match value {
        serde_json::Value::Object(map) if map.len() == 1 => {
            if let Some(serde_json::Value::String(target)) = map.get(OUTPUT_KEY) {
                let (name, property) = match target.split_once('.') {
                    Some((name, property)) => (name, Some(property)),
                    None => (target.as_str(), None),
                };
                return match (lookup(name), property) {
                    (Some(urn), Some(property)) => OutputRef::new(urn, property).into(),
                    (Some(urn), None) => OutputRef::id_of(urn).into(),
                    (None, _) => PropertyValue::Unknown,
                };
            }
            if map.get(UNKNOWN_KEY) == Some(&serde_json::Value::Bool(true)) {
                return PropertyValue::Unknown;
            }
            PropertyValue::from_json(value)
        }
        serde_json::Value::Object(map) => PropertyValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), convert(v, lookup)))
                .collect(),
        ),
        serde_json::Value::Array(items) => PropertyValue::Array(items.iter().map(|v| convert(v, lookup)).collect()),
        other => PropertyValue::from_json(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConvergeError;
    use crate::graph::ResourceGraph;

    const MANIFEST: &str = r"
resources:
  - type: test:lambda:Function
    name: handler
    properties:
      role: { $output: app.arn }
      roleId: { $output: app }
      env:
        vars:
          TOKEN: { $unknown: true }
  - type: aws:iam/role:Role
    name: app
    properties:
      assumeRolePolicyDocument: {}
      path: /service/
  - type: test:iam:Policy
    name: policy
    parent: app
    dependsOn: [handler]
";

    #[test]
    fn test_registrations_and_references() {
        let evaluator = ManifestEvaluator::parse(MANIFEST, Encoding::Yaml).unwrap();
        let registrations = evaluator.registrations("dev").unwrap();
        assert_eq!(registrations.len(), 3);

        let app = registrations[1].urn("dev");
        let handler = &registrations[0];
        assert_eq!(
            handler.inputs.get("role"),
            Some(&PropertyValue::Output(OutputRef::new(app.clone(), "arn")))
        );
        assert_eq!(
            handler.inputs.get("roleId"),
            Some(&PropertyValue::Output(OutputRef::id_of(app.clone())))
        );
        let env = handler.inputs.get("env").and_then(PropertyValue::as_object).unwrap();
        let vars = env.get("vars").and_then(PropertyValue::as_object).unwrap();
        assert_eq!(vars.get("TOKEN"), Some(&PropertyValue::Unknown));

        let policy = &registrations[2];
        assert_eq!(policy.parent.as_ref(), Some(&app));
        assert_eq!(policy.dependencies, vec![handler.urn("dev")]);
        assert!(policy.urn("dev").as_str().contains("aws:iam/role:Role$test:iam:Policy"));
    }

    #[test]
    fn test_graph_from_manifest_orders_references() {
        let evaluator = ManifestEvaluator::parse(MANIFEST, Encoding::Yaml).unwrap();
        let graph = ResourceGraph::from_registrations("dev", evaluator.registrations("dev").unwrap()).unwrap();
        let order: Vec<String> = graph
            .topological_order()
            .unwrap()
            .iter()
            .map(|u| u.name().to_string())
            .collect();
        assert_eq!(order, vec!["app", "handler", "policy"]);
    }

    #[test]
    fn test_unknown_names_are_collected() {
        let manifest = r#"{"resources": [
            {"type": "test:index:Thing", "name": "a", "dependsOn": ["ghost"],
             "properties": {"x": {"$output": "phantom.id"}}},
            {"type": "test:index:Thing", "name": "a"}
        ]}"#;
        let evaluator = ManifestEvaluator::parse(manifest, Encoding::Json).unwrap();
        let err = evaluator.registrations("dev").unwrap_err();
        let ConvergeError::Graph(graph) = err else {
            panic!("expected graph error");
        };
        assert_eq!(graph.issues.len(), 3);
        assert!(matches!(graph.issues[0], GraphIssue::InvalidRegistration { .. }));
    }

    #[test]
    fn test_duplicate_name_with_other_type_is_rejected() {
        let manifest = r#"{"resources": [
            {"type": "test:index:Thing", "name": "a"},
            {"type": "test:index:Other", "name": "a", "properties": {"x": {"$output": "a.arn"}}}
        ]}"#;
        let evaluator = ManifestEvaluator::parse(manifest, Encoding::Json).unwrap();
        let err = evaluator.registrations("dev").unwrap_err();
        let ConvergeError::Graph(graph) = err else {
            panic!("expected graph error");
        };
        assert_eq!(
            graph.issues,
            vec![GraphIssue::InvalidRegistration {
                name: String::from("a"),
                reason: String::from("name is declared more than once"),
            }]
        );
    }

    #[test]
    fn test_load_rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stack.toml");
        std::fs::write(&path, "").unwrap();
        let err = ManifestEvaluator::load(&path, &Marshalers::standard()).unwrap_err();
        assert!(matches!(err, ConvergeError::Config(ConfigError::UnsupportedFormat { .. })));
    }
}
