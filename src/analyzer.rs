//! Analyzer gateway.
//!
//! Analyzers are policy checks run against the desired graph before a plan
//! is returned. Every failure from every analyzer is collected; any failure
//! aborts the run unless enforcement is turned off.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{AnalyzeError, AnalyzerError};
use crate::graph::ResourceGraph;
use crate::resource::{OutputRef, PropertyKey, PropertyMap, PropertyValue, TypeToken, Urn};

/// Default time allowed for a single analyzer call.
pub const DEFAULT_ANALYZER_TIMEOUT: Duration = Duration::from_secs(30);

/// A property-level problem reported by an analyzer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyViolation {
    /// The offending property.
    pub property: PropertyKey,
    /// Why it was rejected.
    pub reason: String,
}

impl PropertyViolation {
    /// Creates a violation.
    #[must_use]
    pub fn new(property: impl Into<PropertyKey>, reason: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            reason: reason.into(),
        }
    }
}

/// A pluggable policy check.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Checks the whole desired graph, returning failure reasons.
    async fn analyze(&self, graph: &ResourceGraph) -> Result<Vec<String>, AnalyzerError>;

    /// Checks one resource's properties.
    async fn analyze_resource(
        &self,
        type_token: &TypeToken,
        properties: &PropertyMap,
    ) -> Result<Vec<PropertyViolation>, AnalyzerError>;
}

/// A graph-wide analyzer failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalyzeFailure {
    /// Analyzer that reported it.
    pub analyzer: String,
    /// Reason.
    pub reason: String,
}

impl std::fmt::Display for AnalyzeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.analyzer, self.reason)
    }
}

/// A resource-scoped analyzer failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalyzeResourceFailure {
    /// Analyzer that reported it.
    pub analyzer: String,
    /// Offending resource.
    pub urn: Urn,
    /// Its type.
    pub type_token: TypeToken,
    /// Offending property.
    pub property: PropertyKey,
    /// Reason.
    pub reason: String,
}

impl std::fmt::Display for AnalyzeResourceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}: {}", self.analyzer, self.urn, self.property, self.reason)
    }
}

/// Summary of a passed analysis.
#[derive(Debug, Clone, Default)]
pub struct AnalysisReport {
    /// Number of analyzers consulted.
    pub analyzers: usize,
    /// Number of resources checked by each analyzer.
    pub resources: usize,
    /// Failures reported while enforcement was off.
    pub suppressed: Option<AnalyzeError>,
}

/// Runs registered analyzers and aggregates their failures.
pub struct AnalyzerGateway {
    analyzers: Vec<(String, Arc<dyn Analyzer>)>,
    timeout: Duration,
    enforce: bool,
}

impl std::fmt::Debug for AnalyzerGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.analyzers.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("AnalyzerGateway")
            .field("analyzers", &names)
            .field("timeout", &self.timeout)
            .field("enforce", &self.enforce)
            .finish()
    }
}

impl Default for AnalyzerGateway {
    fn default() -> Self {
        Self::new(DEFAULT_ANALYZER_TIMEOUT)
    }
}

impl AnalyzerGateway {
    /// Creates a gateway with no analyzers.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            analyzers: Vec::new(),
            timeout,
            enforce: true,
        }
    }

    /// Sets whether failures abort the run.
    #[must_use]
    pub fn with_enforcement(mut self, enforce: bool) -> Self {
        self.enforce = enforce;
        self
    }

    /// Registers an analyzer under a display name.
    pub fn register(&mut self, name: impl Into<String>, analyzer: Arc<dyn Analyzer>) {
        self.analyzers.push((name.into(), analyzer));
    }

    /// Number of registered analyzers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.analyzers.len()
    }

    /// Returns true if no analyzers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.analyzers.is_empty()
    }

    /// Runs every analyzer against the desired graph.
    ///
    /// Output references are resolved with `lookup` before resources are
    /// checked; anything it cannot resolve is passed as unknown. Analyzer
    /// errors and timeouts count as failures.
    ///
    /// # Errors
    ///
    /// Returns every failure found when enforcement is on.
    pub async fn check<F>(&self, desired: &ResourceGraph, lookup: &F) -> Result<AnalysisReport, AnalyzeError>
    where
        F: Fn(&OutputRef) -> Option<PropertyValue> + Sync,
    {
        let mut failures = AnalyzeError::default();
        let resolve = |reference: &OutputRef| Some(lookup(reference).unwrap_or(PropertyValue::Unknown));

        for (name, analyzer) in &self.analyzers {
            debug!("Running analyzer {}", name);

            match tokio::time::timeout(self.timeout, analyzer.analyze(desired)).await {
                Ok(Ok(reasons)) => failures.failures.extend(reasons.into_iter().map(|reason| AnalyzeFailure {
                    analyzer: name.clone(),
                    reason,
                })),
                Ok(Err(e)) => failures.failures.push(AnalyzeFailure {
                    analyzer: name.clone(),
                    reason: format!("analyzer error: {e}"),
                }),
                Err(_) => failures.failures.push(AnalyzeFailure {
                    analyzer: name.clone(),
                    reason: format!("timed out after {}s", self.timeout.as_secs_f64()),
                }),
            }

            for resource in desired.iter() {
                let properties = resource.inputs.resolve(&resolve);
                let call = analyzer.analyze_resource(&resource.type_token, &properties);
                match tokio::time::timeout(self.timeout, call).await {
                    Ok(Ok(violations)) => {
                        failures
                            .resource_failures
                            .extend(violations.into_iter().map(|v| AnalyzeResourceFailure {
                                analyzer: name.clone(),
                                urn: resource.urn.clone(),
                                type_token: resource.type_token.clone(),
                                property: v.property,
                                reason: v.reason,
                            }));
                    }
                    Ok(Err(e)) => failures.failures.push(AnalyzeFailure {
                        analyzer: name.clone(),
                        reason: format!("analyzer error on {}: {e}", resource.urn),
                    }),
                    Err(_) => failures.failures.push(AnalyzeFailure {
                        analyzer: name.clone(),
                        reason: format!("timed out analyzing {}", resource.urn),
                    }),
                }
            }
        }

        let mut report = AnalysisReport {
            analyzers: self.analyzers.len(),
            resources: desired.len(),
            suppressed: None,
        };

        if failures.is_empty() {
            info!("{} analyzer(s) passed", report.analyzers);
            return Ok(report);
        }
        if self.enforce {
            return Err(failures);
        }

        for failure in &failures.failures {
            warn!("Analyzer failure (not enforced): {}", failure);
        }
        for failure in &failures.resource_failures {
            warn!("Analyzer failure (not enforced): {}", failure);
        }
        report.suppressed = Some(failures);
        Ok(report)
    }
}
