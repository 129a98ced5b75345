//! Planning and apply orchestration.
//!
//! A planning run loads the snapshot, evaluates the program, decodes the
//! desired resources, builds both graphs, classifies and cascades diffs,
//! orders the steps and finally runs the analyzers. An apply run does the
//! same under the snapshot lock and then executes the plan.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::analyzer::{AnalysisReport, Analyzer, AnalyzerGateway};
use crate::config::{DecodePolicy, EngineConfig, StateBackend};
use crate::encoding::Marshalers;
use crate::error::{DecodeFailures, PlanError, Result};
use crate::graph::ResourceGraph;
use crate::manifest::ProgramEvaluator;
use crate::planner::{
    ApplyOptions, ApplyReport, CancelSignal, DiffClassifier, DiffKind, DiffSet, Plan, PlanBuilder,
    ReplacementCascade, StepExecutor,
};
use crate::provider::Provider;
use crate::resource::{Decoder, OutputRef, PropertyValue, Resource, SchemaRegistry, Urn};
use crate::state::{ApplyHistoryEntry, LocalSnapshotStore, S3SnapshotStore, Snapshot, SnapshotStore};

/// Result of a planning run.
#[derive(Debug)]
pub struct PlanOutcome {
    /// The ordered plan.
    pub plan: Plan,
    /// Per-resource decisions behind the plan.
    pub diffs: DiffSet,
    /// The snapshot the plan was computed against.
    pub snapshot: Snapshot,
    /// Analyzer summary.
    pub analysis: AnalysisReport,
    /// The desired graph the plan was computed from.
    pub desired: ResourceGraph,
    /// Resources left untouched because they failed decoding.
    pub excluded: Vec<Urn>,
}

/// Result of an apply run.
#[derive(Debug, Serialize)]
pub struct ApplyOutcome {
    /// The plan that ran.
    pub plan: Plan,
    /// Per-step results.
    pub report: ApplyReport,
    /// The snapshot after the run.
    #[serde(skip)]
    pub snapshot: Snapshot,
}

/// The deployment engine.
pub struct Engine<'a> {
    config: &'a EngineConfig,
    registry: &'a SchemaRegistry,
    store: &'a dyn SnapshotStore,
    analyzers: AnalyzerGateway,
}

impl std::fmt::Debug for Engine<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("stack", &self.config.project.stack)
            .field("store", &self.store.backend_type())
            .field("analyzers", &self.analyzers)
            .finish_non_exhaustive()
    }
}

/// Opens the snapshot store named by the configuration.
///
/// # Errors
///
/// Returns an error if a local snapshot path has an unsupported extension
/// or the working directory cannot be determined.
pub async fn open_store(config: &EngineConfig, marshalers: &Marshalers) -> Result<Box<dyn SnapshotStore>> {
    let state = &config.state;
    match state.backend {
        StateBackend::Local => {
            let store = match &state.path {
                Some(path) => LocalSnapshotStore::with_snapshot_path(path, marshalers)?,
                None => LocalSnapshotStore::new()?,
            };
            Ok(Box::new(store))
        }
        StateBackend::S3 => {
            let bucket = state.bucket.as_deref().unwrap_or_default();
            let store = S3SnapshotStore::new(bucket, state.prefix.as_deref(), state.region.as_deref()).await;
            Ok(Box::new(store))
        }
    }
}

impl<'a> Engine<'a> {
    /// Creates an engine.
    #[must_use]
    pub fn new(config: &'a EngineConfig, registry: &'a SchemaRegistry, store: &'a dyn SnapshotStore) -> Self {
        let analyzers = AnalyzerGateway::new(config.analyzers.timeout()).with_enforcement(config.analyzers.enforce);
        Self {
            config,
            registry,
            store,
            analyzers,
        }
    }

    /// Registers an analyzer.
    #[must_use]
    pub fn with_analyzer(mut self, name: impl Into<String>, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzers.register(name, analyzer);
        self
    }

    fn stack(&self) -> &str {
        &self.config.project.stack
    }

    async fn load_snapshot(&self) -> Result<Snapshot> {
        let snapshot = self.store.load().await?.unwrap_or_else(|| Snapshot::new(self.stack()));
        if snapshot.stack != self.stack() {
            warn!("Snapshot belongs to stack '{}', planning for '{}'", snapshot.stack, self.stack());
        }
        Ok(snapshot)
    }

    /// Decodes the desired resources, applying the decode policy.
    ///
    /// Returns the graph to plan against and the excluded URNs.
    fn decode_desired(&self, desired: ResourceGraph, snapshot: &Snapshot) -> Result<(ResourceGraph, Vec<Urn>)> {
        let failures = Decoder::new(self.registry).check_all(desired.iter());
        if failures.is_empty() {
            return Ok((desired, Vec::new()));
        }

        match self.config.decode.on_error {
            DecodePolicy::AbortRun => Err(DecodeFailures { errors: failures }.into()),
            DecodePolicy::ExcludeResource => {
                let excluded: Vec<Urn> = failures.iter().map(|f| f.urn.clone()).collect();
                for failure in &failures {
                    warn!("Excluding {}: {}", failure.urn, failure.error);
                }
                let kept: Vec<Resource> = desired
                    .iter()
                    .filter_map(|resource| {
                        if excluded.contains(&resource.urn) {
                            snapshot.get(&resource.urn).cloned()
                        } else {
                            Some(resource.clone())
                        }
                    })
                    .collect();
                Ok((ResourceGraph::from_resources(kept)?, excluded))
            }
        }
    }

    /// Computes a plan without calling any provider.
    ///
    /// # Errors
    ///
    /// Returns decode, graph and analyzer diagnostics in full, or an error
    /// if the snapshot cannot be loaded.
    pub async fn plan(&self, program: &dyn ProgramEvaluator) -> Result<PlanOutcome> {
        info!("Planning stack {}", self.stack());

        let snapshot = self.load_snapshot().await?;
        let registrations = program.registrations(self.stack())?;
        let desired = ResourceGraph::from_registrations(self.stack(), registrations)?;
        let (desired, excluded) = self.decode_desired(desired, &snapshot)?;
        let prior = ResourceGraph::from_snapshot(&snapshot)?;
        debug!("Prior graph: {} resource(s), desired graph: {} resource(s)", prior.len(), desired.len());

        let mut diffs = DiffClassifier::new(self.registry).classify(&prior, &desired);
        let escalated =
            ReplacementCascade::new(self.registry).apply_with_pending(&mut diffs, &desired, &snapshot.pending_deletes);
        if escalated > 0 {
            info!("Replacement cascade escalated {} resource(s)", escalated);
        }

        let plan = PlanBuilder::new(self.registry).build(
            self.stack(),
            &prior,
            &desired,
            &diffs,
            &snapshot.pending_deletes,
        )?;

        // Outputs are only known up front for resources that stay as they are.
        let lookup = |reference: &OutputRef| -> Option<PropertyValue> {
            match diffs.kind(&reference.urn) {
                Some(DiffKind::Same) => prior.lookup_output(reference),
                _ => None,
            }
        };
        let analysis = self.analyzers.check(&desired, &lookup).await?;

        Ok(PlanOutcome {
            plan,
            diffs,
            snapshot,
            analysis,
            desired,
            excluded,
        })
    }

    /// Plans and executes under the snapshot lock.
    ///
    /// With `expected_fingerprint`, the run is refused unless the computed
    /// plan matches the one that was reviewed.
    ///
    /// # Errors
    ///
    /// Returns planning diagnostics, a lock conflict, a fingerprint
    /// mismatch, or a snapshot save failure. Step failures are reported in
    /// the [`ApplyReport`].
    pub async fn apply(
        &self,
        program: &dyn ProgramEvaluator,
        provider: Arc<dyn Provider>,
        expected_fingerprint: Option<&str>,
        cancel: &CancelSignal,
    ) -> Result<ApplyOutcome> {
        let lock = self.store.acquire_lock("", "apply").await?;
        debug!(
            "Acquired {} snapshot lock {} as {}",
            self.store.backend_type(),
            lock.lock_id,
            lock.holder
        );

        let result = self
            .apply_locked(program, provider, expected_fingerprint, &lock.lock_id, cancel)
            .await;

        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            error!("Failed to release lock {}: {}", lock.lock_id, e);
        }
        result
    }

    async fn apply_locked(
        &self,
        program: &dyn ProgramEvaluator,
        provider: Arc<dyn Provider>,
        expected_fingerprint: Option<&str>,
        lock_id: &str,
        cancel: &CancelSignal,
    ) -> Result<ApplyOutcome> {
        let PlanOutcome {
            plan,
            diffs,
            mut snapshot,
            desired,
            ..
        } = self.plan(program).await?;

        if let Some(expected) = expected_fingerprint
            && expected != plan.fingerprint
        {
            return Err(PlanError::FingerprintMismatch {
                expected: expected.to_string(),
                actual: plan.fingerprint.clone(),
            }
            .into());
        }

        let options = ApplyOptions {
            concurrency: self.config.apply.concurrency,
            timeout: self.config.apply.timeout(),
            ..ApplyOptions::default()
        };
        let report = StepExecutor::new(provider, self.store)
            .with_options(options)
            .with_lock(lock_id)
            .execute(&plan, &mut snapshot, cancel)
            .await?;

        refresh_unchanged(&diffs, &desired, &mut snapshot);
        snapshot.add_history(ApplyHistoryEntry {
            timestamp: chrono::Utc::now(),
            fingerprint: plan.fingerprint.clone(),
            status: report.status,
            succeeded: report.succeeded,
            failed: report.failed,
            skipped: report.skipped + report.not_started,
        });
        self.store.save(&snapshot).await?;

        info!("Apply of {} finished: {}", self.stack(), report.status);
        Ok(ApplyOutcome { plan, report, snapshot })
    }
}

/// Copies dependency edges of unchanged resources into the snapshot.
///
/// Explicit dependencies are not inputs, so a change to them alone
/// produces no step but must still be recorded.
fn refresh_unchanged(diffs: &DiffSet, desired: &ResourceGraph, snapshot: &mut Snapshot) {
    for diff in diffs.iter().filter(|d| d.kind == DiffKind::Same) {
        let Some(target) = desired.get(&diff.urn) else {
            continue;
        };
        if let Some(record) = snapshot.get_mut(&diff.urn)
            && record.dependencies != target.dependencies
        {
            debug!("Refreshing dependencies of {}", diff.urn);
            record.dependencies.clone_from(&target.dependencies);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{MockAnalyzer, PropertyViolation};
    use crate::catalog::{standard_registry, ROLE_TYPE};
    use crate::config::ProviderConfig;
    use crate::encoding::Encoding;
    use crate::error::ConvergeError;
    use crate::manifest::ManifestEvaluator;
    use crate::planner::StepOp;
    use crate::provider::fake::FakeProvider;
    use crate::state::{ApplyStatus, MemorySnapshotStore};

    fn manifest(path: &str) -> ManifestEvaluator {
        let text = format!(
            r"
resources:
  - type: aws:iam/role:Role
    name: r1
    properties:
      name: r1
      assumeRolePolicyDocument: {{}}
      path: {path}
  - type: test:lambda:Function
    name: handler
    properties:
      name: handler
      role: {{ $output: r1.arn }}
"
        );
        ManifestEvaluator::parse(&text, Encoding::Yaml).unwrap()
    }

    fn registry() -> SchemaRegistry {
        standard_registry()
    }

    #[tokio::test]
    async fn test_plan_rejects_decode_failures() {
        let config = EngineConfig::new("web");
        let registry = registry();
        let store = MemorySnapshotStore::new();
        let engine = Engine::new(&config, &registry, &store);

        // "name" is not part of the role schema.
        let err = engine.plan(&manifest("/a/")).await.unwrap_err();
        let ConvergeError::Decode(failures) = err else {
            panic!("expected decode failures");
        };
        assert_eq!(failures.errors.len(), 1);
        assert_eq!(failures.field_failure_count(), 1);
    }

    fn lenient_registry() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        let mut schema = crate::catalog::role_schema();
        schema
            .fields
            .push(crate::resource::FieldSchema::optional("name", crate::resource::FieldType::String));
        registry.register(schema);
        registry
    }

    #[tokio::test]
    async fn test_apply_then_replace_role() {
        let config = EngineConfig::new("web");
        let registry = lenient_registry();
        let store = MemorySnapshotStore::new();
        let engine = Engine::new(&config, &registry, &store);
        let provider = Arc::new(FakeProvider::new());

        let first = engine
            .apply(&manifest("/a/"), provider.clone(), None, &CancelSignal::new())
            .await
            .unwrap();
        assert_eq!(first.report.status, ApplyStatus::Succeeded);
        assert_eq!(first.snapshot.len(), 2);
        assert_eq!(first.snapshot.history.len(), 1);

        let outcome = engine.plan(&manifest("/b/")).await.unwrap();
        let ops: Vec<(StepOp, String)> = outcome
            .plan
            .steps
            .iter()
            .map(|s| (s.op, s.urn.name().to_string()))
            .collect();
        assert_eq!(
            ops,
            vec![
                (StepOp::CreateReplacement, String::from("r1")),
                (StepOp::Update, String::from("handler")),
                (StepOp::DeleteReplaced, String::from("r1")),
            ]
        );

        let second = engine
            .apply(
                &manifest("/b/"),
                provider.clone(),
                Some(&outcome.plan.fingerprint),
                &CancelSignal::new(),
            )
            .await
            .unwrap();
        assert!(second.report.is_success());
        assert!(second.snapshot.pending_deletes.is_empty());
        assert!(!store.is_locked().await.unwrap());
        assert!(engine.plan(&manifest("/b/")).await.unwrap().plan.is_empty());
    }

    #[tokio::test]
    async fn test_apply_refuses_stale_fingerprint() {
        let config = EngineConfig::new("web");
        let registry = lenient_registry();
        let store = MemorySnapshotStore::new();
        let engine = Engine::new(&config, &registry, &store);

        let err = engine
            .apply(
                &manifest("/a/"),
                Arc::new(FakeProvider::new()),
                Some("deadbeef"),
                &CancelSignal::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConvergeError::Plan(PlanError::FingerprintMismatch { .. })));
        assert!(!store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_analyzer_failure_returns_no_plan() {
        let config = EngineConfig::new("web");
        let registry = lenient_registry();
        let store = MemorySnapshotStore::new();
        let mut analyzer = MockAnalyzer::new();
        analyzer.expect_analyze().returning(|_| Ok(Vec::new()));
        analyzer.expect_analyze_resource().returning(|type_token, _| {
            if type_token.as_str() == ROLE_TYPE {
                Ok(vec![PropertyViolation::new("roleName", "role names must be set explicitly")])
            } else {
                Ok(Vec::new())
            }
        });
        let engine = Engine::new(&config, &registry, &store).with_analyzer("naming", Arc::new(analyzer));

        let err = engine.plan(&manifest("/a/")).await.unwrap_err();
        let ConvergeError::Analyze(failures) = err else {
            panic!("expected analyzer failures");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures.resource_failures[0].property, "roleName");
    }

    #[tokio::test]
    async fn test_exclude_policy_keeps_prior_record() {
        let mut config = EngineConfig::new("web");
        config.decode.on_error = DecodePolicy::ExcludeResource;
        let registry = lenient_registry();
        let store = MemorySnapshotStore::new();
        let engine = Engine::new(&config, &registry, &store);
        engine
            .apply(&manifest("/a/"), Arc::new(FakeProvider::new()), None, &CancelSignal::new())
            .await
            .unwrap();

        // A number where the schema wants a string.
        let broken = manifest("/a/");
        let mut entries = broken.entries().to_vec();
        entries[0].properties.insert(String::from("path"), serde_json::json!(42));
        let outcome = engine.plan(&ManifestEvaluator::new(entries)).await.unwrap();

        assert_eq!(outcome.excluded.len(), 1);
        assert!(outcome.plan.is_empty());
    }

    #[tokio::test]
    async fn test_delete_before_replace_from_config() {
        let mut config = EngineConfig::new("web");
        config.providers.push(ProviderConfig {
            type_token: String::from(ROLE_TYPE),
            delete_before_replace: true,
        });
        let mut registry = lenient_registry();
        config.apply_capabilities(&mut registry);
        let store = MemorySnapshotStore::new();
        let engine = Engine::new(&config, &registry, &store);
        let provider = Arc::new(FakeProvider::new());
        engine
            .apply(&manifest("/a/"), provider.clone(), None, &CancelSignal::new())
            .await
            .unwrap();

        let outcome = engine.plan(&manifest("/b/")).await.unwrap();
        let ops: Vec<StepOp> = outcome.plan.steps.iter().map(|s| s.op).collect();
        assert_eq!(
            ops,
            vec![
                StepOp::DeleteReplaced,
                StepOp::DeleteReplaced,
                StepOp::CreateReplacement,
                StepOp::CreateReplacement,
            ]
        );
    }
}
