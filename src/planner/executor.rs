//! Step executor for applying plans.
//!
//! Steps run as soon as every step they depend on has succeeded and been
//! recorded, up to a concurrency limit. Each completed step is written to
//! the snapshot and saved before anything else is scheduled. A failed step
//! blocks its dependents; independent steps keep running. Cancellation and
//! timeouts stop scheduling but let in-flight steps finish and be recorded.
//! While a run holds the snapshot lock it re-writes the lock periodically so
//! it never expires under a long apply.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{ConvergeError, ProviderError, Result};
use crate::provider::{resolve_inputs, resolve_prior_inputs, Created, Provider};
use crate::resource::{PropertyMap, Resource, TypeToken, Urn};
use crate::state::{ApplyStatus, Snapshot, SnapshotStore, LOCK_REFRESH_SECS};

use super::plan::{Plan, Step, StepOp};

/// Default number of steps allowed in flight.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Options for an apply run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Maximum steps in flight at once.
    pub concurrency: usize,
    /// Stop scheduling after this long.
    pub timeout: Option<Duration>,
    /// Interval between lock refreshes.
    pub lock_refresh: Duration,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            timeout: None,
            lock_refresh: Duration::from_secs(LOCK_REFRESH_SECS),
        }
    }
}

/// Cooperative cancellation for an apply run.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    /// Creates a signal that has not fired.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Fires the signal.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Returns true once the signal has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Completes when the signal fires.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

/// Status of one step after a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet scheduled.
    Pending,
    /// Provider call in flight.
    Running,
    /// Completed and recorded.
    Succeeded,
    /// The provider call failed.
    Failed {
        /// The provider error.
        error: ProviderError,
    },
    /// A step it depends on failed or was skipped.
    Skipped {
        /// The blocking resource.
        blocked_by: Urn,
    },
    /// Never scheduled because the run stopped.
    NotStarted,
}

/// Outcome of a single step.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    /// Step index in the plan.
    pub index: usize,
    /// Operation.
    pub op: StepOp,
    /// Target resource.
    pub urn: Urn,
    /// Final status.
    pub status: StepStatus,
}

/// Result of executing a plan.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    /// One outcome per plan step, in plan order.
    pub outcomes: Vec<StepOutcome>,
    /// Overall status.
    pub status: ApplyStatus,
    /// Steps that succeeded.
    pub succeeded: usize,
    /// Steps that failed.
    pub failed: usize,
    /// Steps skipped because a dependency failed.
    pub skipped: usize,
    /// Steps never started because the run stopped.
    pub not_started: usize,
}

impl ApplyReport {
    fn from_statuses(plan: &Plan, statuses: Vec<StepStatus>, stopped: bool) -> Self {
        let outcomes: Vec<StepOutcome> = plan
            .steps
            .iter()
            .zip(statuses)
            .enumerate()
            .map(|(index, (step, status))| StepOutcome {
                index,
                op: step.op,
                urn: step.urn.clone(),
                status,
            })
            .collect();

        let count = |f: fn(&StepStatus) -> bool| outcomes.iter().filter(|o| f(&o.status)).count();
        let succeeded = count(|s| matches!(s, StepStatus::Succeeded));
        let failed = count(|s| matches!(s, StepStatus::Failed { .. }));
        let skipped = count(|s| matches!(s, StepStatus::Skipped { .. }));
        let not_started = count(|s| matches!(s, StepStatus::NotStarted));

        let status = if failed + skipped + not_started == 0 {
            ApplyStatus::Succeeded
        } else if stopped && not_started > 0 {
            ApplyStatus::Cancelled
        } else if succeeded == 0 {
            ApplyStatus::Failed
        } else {
            ApplyStatus::PartiallySucceeded
        };

        Self {
            outcomes,
            status,
            succeeded,
            failed,
            skipped,
            not_started,
        }
    }

    /// Returns true if every step succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ApplyStatus::Succeeded
    }

    /// Outcomes of failed steps.
    pub fn failures(&self) -> impl Iterator<Item = &StepOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, StepStatus::Failed { .. }))
    }
}

/// Provider call prepared by the coordinator.
enum Call {
    Create {
        inputs: PropertyMap,
    },
    Update {
        id: String,
        old: PropertyMap,
        new: PropertyMap,
    },
    Delete {
        id: String,
        props: PropertyMap,
    },
    Forget,
}

/// What a finished call produced.
enum Effect {
    Created(Created),
    Updated(PropertyMap),
    Deleted,
}

/// Executes plans against a provider.
pub struct StepExecutor<'a> {
    provider: Arc<dyn Provider>,
    store: &'a dyn SnapshotStore,
    options: ApplyOptions,
    lock_id: Option<String>,
}

impl std::fmt::Debug for StepExecutor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor")
            .field("store", &self.store.backend_type())
            .field("options", &self.options)
            .field("lock_id", &self.lock_id)
            .finish_non_exhaustive()
    }
}

impl<'a> StepExecutor<'a> {
    /// Creates an executor.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, store: &'a dyn SnapshotStore) -> Self {
        Self {
            provider,
            store,
            options: ApplyOptions::default(),
            lock_id: None,
        }
    }

    /// Sets the run options.
    #[must_use]
    pub fn with_options(mut self, options: ApplyOptions) -> Self {
        self.options = options;
        self
    }

    /// Keeps the snapshot lock `lock_id` alive for the whole run.
    #[must_use]
    pub fn with_lock(mut self, lock_id: impl Into<String>) -> Self {
        self.lock_id = Some(lock_id.into());
        self
    }

    /// Executes a plan, recording every completed step in `snapshot`.
    ///
    /// Step failures are reported in the [`ApplyReport`], not as errors.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be saved or the lock can no
    /// longer be refreshed. Scheduling stops at that point and in-flight
    /// steps are drained first.
    pub async fn execute(&self, plan: &Plan, snapshot: &mut Snapshot, cancel: &CancelSignal) -> Result<ApplyReport> {
        info!("Executing plan {} with {} step(s)", plan.fingerprint, plan.len());

        let concurrency = self.options.concurrency.max(1);
        let deadline = self.options.timeout.map(|t| Instant::now() + t);
        let mut statuses = vec![StepStatus::Pending; plan.len()];
        let mut in_flight: JoinSet<(usize, std::result::Result<Effect, ProviderError>)> = JoinSet::new();
        let mut stopped = false;
        let mut fatal = None;

        let period = self.options.lock_refresh.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if !stopped && cancel.is_cancelled() {
                warn!("Apply cancelled, waiting for {} in-flight step(s)", in_flight.len());
                stopped = true;
            }
            if !stopped {
                self.schedule(plan, snapshot, &mut statuses, &mut in_flight, concurrency);
            }
            if in_flight.is_empty() {
                break;
            }

            let expired = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                joined = in_flight.join_next() => match joined {
                    Some(Ok((index, result))) => {
                        let step = &plan.steps[index];
                        match result {
                            Ok(effect) => {
                                record(step, effect, snapshot);
                                statuses[index] = StepStatus::Succeeded;
                                info!("{} {} done", step.op, step.urn);
                                if fatal.is_none() {
                                    if let Err(e) = self.store.save(snapshot).await {
                                        error!("Failed to save snapshot after {} {}: {}", step.op, step.urn, e);
                                        stopped = true;
                                        fatal = Some(e);
                                    }
                                }
                            }
                            Err(e) => {
                                error!("{} {} failed: {}", step.op, step.urn, e);
                                statuses[index] = StepStatus::Failed { error: e };
                            }
                        }
                    }
                    Some(Err(e)) => error!("Step task aborted: {}", e),
                    None => {}
                },
                () = cancel.cancelled(), if !stopped => {
                    warn!("Apply cancelled, waiting for {} in-flight step(s)", in_flight.len());
                    stopped = true;
                }
                () = expired, if !stopped => {
                    warn!("Apply timed out, waiting for {} in-flight step(s)", in_flight.len());
                    stopped = true;
                }
                _ = heartbeat.tick(), if self.lock_id.is_some() && fatal.is_none() => {
                    if let Some(e) = self.refresh_lock().await {
                        stopped = true;
                        fatal = Some(e);
                    }
                }
            }
        }

        for status in &mut statuses {
            match status {
                StepStatus::Running => {
                    *status = StepStatus::Failed {
                        error: ProviderError::failed("step task aborted"),
                    };
                }
                StepStatus::Pending => *status = StepStatus::NotStarted,
                _ => {}
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }

        let report = ApplyReport::from_statuses(plan, statuses, stopped);
        info!(
            "Apply {}: {} succeeded, {} failed, {} skipped, {} not started",
            report.status, report.succeeded, report.failed, report.skipped, report.not_started
        );
        Ok(report)
    }

    /// Re-writes the held lock, returning the error if it was lost.
    async fn refresh_lock(&self) -> Option<ConvergeError> {
        let lock_id = self.lock_id.as_deref()?;
        match self.store.refresh_lock(lock_id).await {
            Ok(lock) => {
                debug!("Snapshot lock {} held until {}", lock.lock_id, lock.expires_at);
                None
            }
            Err(e) => {
                error!("Lost snapshot lock {}: {}", lock_id, e);
                Some(e)
            }
        }
    }

    /// Settles blocked steps and launches ready ones, in plan order.
    ///
    /// Dependencies always point to earlier steps, so a single pass sees
    /// every status change it causes.
    fn schedule(
        &self,
        plan: &Plan,
        snapshot: &Snapshot,
        statuses: &mut [StepStatus],
        in_flight: &mut JoinSet<(usize, std::result::Result<Effect, ProviderError>)>,
        concurrency: usize,
    ) {
        for (index, step) in plan.steps.iter().enumerate() {
            if statuses[index] != StepStatus::Pending {
                continue;
            }

            let blocker = step.depends_on.iter().find(|&&dep| {
                matches!(statuses[dep], StepStatus::Failed { .. } | StepStatus::Skipped { .. })
            });
            if let Some(&dep) = blocker {
                let blocked_by = plan.steps[dep].urn.clone();
                warn!("Skipping {} {}: blocked by {}", step.op, step.urn, blocked_by);
                statuses[index] = StepStatus::Skipped { blocked_by };
                continue;
            }

            let ready = step
                .depends_on
                .iter()
                .all(|&dep| statuses[dep] == StepStatus::Succeeded);
            if !ready || in_flight.len() >= concurrency {
                continue;
            }

            match prepare(step, snapshot) {
                Ok(call) => {
                    info!("{} {}", step.op, step.urn);
                    statuses[index] = StepStatus::Running;
                    let provider = Arc::clone(&self.provider);
                    let type_token = step.type_token.clone();
                    in_flight.spawn(async move { (index, run(provider.as_ref(), &type_token, call).await) });
                }
                Err(e) => {
                    error!("{} {} failed: {}", step.op, step.urn, e);
                    statuses[index] = StepStatus::Failed { error: e };
                }
            }
        }
    }
}

fn prepare(step: &Step, snapshot: &Snapshot) -> std::result::Result<Call, ProviderError> {
    let missing_id = || ProviderError::MissingId { urn: step.urn.clone() };

    match step.op {
        StepOp::Create | StepOp::CreateReplacement => {
            let new = step.new.as_ref().ok_or_else(|| ProviderError::failed("create step has no desired state"))?;
            let inputs = resolve_inputs(&step.urn, &new.inputs, snapshot)?;
            Ok(Call::Create { inputs })
        }
        StepOp::Update => {
            let new = step.new.as_ref().ok_or_else(|| ProviderError::failed("update step has no desired state"))?;
            let old = step.old.as_ref().ok_or_else(missing_id)?;
            let id = old.id.clone().ok_or_else(missing_id)?;
            let inputs = resolve_inputs(&step.urn, &new.inputs, snapshot)?;
            Ok(Call::Update {
                id,
                old: resolve_prior_inputs(&old.inputs, snapshot),
                new: inputs,
            })
        }
        StepOp::Delete | StepOp::DeleteReplaced => {
            let Some(old) = step.old.as_ref() else {
                return Ok(Call::Forget);
            };
            match &old.id {
                Some(id) => Ok(Call::Delete {
                    id: id.clone(),
                    props: resolve_prior_inputs(&old.inputs, snapshot),
                }),
                None => {
                    debug!("No provider ID recorded for {}, forgetting it", step.urn);
                    Ok(Call::Forget)
                }
            }
        }
    }
}

async fn run(provider: &dyn Provider, type_token: &TypeToken, call: Call) -> std::result::Result<Effect, ProviderError> {
    match call {
        Call::Create { inputs } => provider.create(type_token, &inputs).await.map(Effect::Created),
        Call::Update { id, old, new } => provider.update(type_token, &id, &old, &new).await.map(Effect::Updated),
        Call::Delete { id, props } => match provider.delete(type_token, &id, &props).await {
            Ok(()) => Ok(Effect::Deleted),
            Err(ProviderError::NotFound { .. }) => {
                debug!("{} was already deleted", id);
                Ok(Effect::Deleted)
            }
            Err(e) => Err(e),
        },
        Call::Forget => Ok(Effect::Deleted),
    }
}

/// Applies one completed step to the snapshot.
fn record(step: &Step, effect: Effect, snapshot: &mut Snapshot) {
    let old_id = step.old.as_ref().and_then(|r| r.id.clone());

    match (step.op, effect) {
        (StepOp::Create | StepOp::CreateReplacement, Effect::Created(created)) => {
            if step.op == StepOp::CreateReplacement
                && old_id.is_some()
                && snapshot.get(&step.urn).and_then(|r| r.id.clone()) == old_id
            {
                snapshot.retire(&step.urn);
            }
            if let Some(new) = &step.new {
                snapshot.upsert(recorded(new, Some(created.id), created.outputs));
            }
        }
        (StepOp::Update, Effect::Updated(outputs)) => {
            if let Some(new) = &step.new {
                snapshot.upsert(recorded(new, old_id, outputs));
            }
        }
        (StepOp::Delete, _) => {
            snapshot.remove(&step.urn);
        }
        (StepOp::DeleteReplaced, _) => {
            if snapshot.remove_pending_delete(&step.urn, old_id.as_deref()).is_none()
                && snapshot.get(&step.urn).and_then(|r| r.id.clone()) == old_id
            {
                snapshot.remove(&step.urn);
            }
        }
        (op, _) => warn!("Unexpected result for {} {}", op, step.urn),
    }
}

fn recorded(desired: &Resource, id: Option<String>, outputs: PropertyMap) -> Resource {
    Resource {
        id,
        outputs,
        ..desired.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceGraph;
    use crate::planner::{DiffClassifier, PlanBuilder, ReplacementCascade};
    use crate::provider::fake::FakeProvider;
    use crate::resource::{FieldSchema, FieldType, OutputRef, PropertyValue, Schema, SchemaRegistry};
    use crate::state::MemorySnapshotStore;

    const THING: &str = "test:index:Thing";

    fn registry() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry.register(Schema::new(
            TypeToken::new(THING),
            vec![
                FieldSchema::required("name", FieldType::String).replaces(),
                FieldSchema::optional("role", FieldType::String),
                FieldSchema::output("arn", FieldType::String),
            ],
        ));
        registry
    }

    fn urn(name: &str) -> Urn {
        Urn::new("dev", None, &TypeToken::new(THING), name)
    }

    fn thing(logical: &str, name: &str) -> Resource {
        let mut inputs = PropertyMap::new();
        inputs.insert("name", name);
        Resource::new(urn(logical), inputs)
    }

    fn thing_using(logical: &str, role: &str) -> Resource {
        let mut resource = thing(logical, logical);
        resource.inputs.insert("role", OutputRef::new(urn(role), "arn"));
        resource
    }

    fn plan_for(prior: &Snapshot, desired: Vec<Resource>) -> Plan {
        let registry = registry();
        let prior_graph = ResourceGraph::from_snapshot(prior).unwrap();
        let desired = ResourceGraph::from_resources(desired).unwrap();
        let mut diffs = DiffClassifier::new(&registry).classify(&prior_graph, &desired);
        ReplacementCascade::new(&registry).apply_with_pending(&mut diffs, &desired, &prior.pending_deletes);
        PlanBuilder::new(&registry)
            .build("dev", &prior_graph, &desired, &diffs, &prior.pending_deletes)
            .unwrap()
    }

    #[tokio::test]
    async fn test_creates_in_order_and_records_each_step() {
        let provider = Arc::new(FakeProvider::new());
        let store = MemorySnapshotStore::new();
        let mut snapshot = Snapshot::new("dev");
        let plan = plan_for(&snapshot, vec![thing_using("f", "r"), thing("r", "r")]);

        let report = StepExecutor::new(provider.clone(), &store)
            .execute(&plan, &mut snapshot, &CancelSignal::new())
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(provider.calls(), vec!["create r", "create f"]);
        assert_eq!(store.saves().await.len(), 2);
        assert_eq!(store.saves().await[0].len(), 1);

        let function = snapshot.get(&urn("f")).unwrap();
        assert_eq!(function.id.as_deref(), Some("f-1"));
        assert!(function.inputs.get("role").is_some_and(|v| v.is_computed()));
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_only() {
        let provider = Arc::new(FakeProvider::new());
        provider.fail_on("r", ProviderError::failed("quota exceeded"));
        let store = MemorySnapshotStore::new();
        let mut snapshot = Snapshot::new("dev");
        let plan = plan_for(
            &snapshot,
            vec![thing("r", "r"), thing_using("f", "r"), thing("g", "g")],
        );

        let report = StepExecutor::new(provider, &store)
            .execute(&plan, &mut snapshot, &CancelSignal::new())
            .await
            .unwrap();

        assert_eq!(report.status, ApplyStatus::PartiallySucceeded);
        assert_eq!((report.succeeded, report.failed, report.skipped), (1, 1, 1));
        let f = plan.position(StepOp::Create, &urn("f")).unwrap();
        assert_eq!(
            report.outcomes[f].status,
            StepStatus::Skipped { blocked_by: urn("r") }
        );
        assert!(snapshot.get(&urn("g")).is_some());
        assert!(snapshot.get(&urn("r")).is_none());
    }

    #[tokio::test]
    async fn test_replacement_creates_then_deletes_old() {
        let provider = Arc::new(FakeProvider::new());
        let store = MemorySnapshotStore::new();
        let mut snapshot = Snapshot::new("dev");
        snapshot.upsert(thing("r", "r").with_id("r-old"));
        let plan = plan_for(&snapshot, vec![thing("r", "r2")]);

        let report = StepExecutor::new(provider.clone(), &store)
            .execute(&plan, &mut snapshot, &CancelSignal::new())
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(provider.calls(), vec!["create r2", "delete r r-old"]);
        assert_eq!(snapshot.get(&urn("r")).and_then(|r| r.id.as_deref()), Some("r2-0"));
        assert!(snapshot.pending_deletes.is_empty());

        let after_create = &store.saves().await[0];
        assert_eq!(after_create.pending_deletes.len(), 1);
    }

    #[tokio::test]
    async fn test_interrupted_replacement_repoints_dependents() {
        let mut outputs = PropertyMap::new();
        outputs.insert("arn", "arn:r-old");
        let mut snapshot = Snapshot::new("dev");
        snapshot.upsert(thing("r", "r").with_id("r-old").with_outputs(outputs));
        snapshot.upsert(thing_using("f", "r").with_id("f-1"));
        let desired = || vec![thing("r", "r2"), thing_using("f", "r")];
        let store = MemorySnapshotStore::new();

        let first = Arc::new(FakeProvider::new());
        first.fail_on("f", ProviderError::failed("throttled"));
        let report = StepExecutor::new(first.clone(), &store)
            .execute(&plan_for(&snapshot, desired()), &mut snapshot, &CancelSignal::new())
            .await
            .unwrap();
        assert_eq!(report.status, ApplyStatus::PartiallySucceeded);
        assert_eq!(first.calls(), vec!["create r2", "update f"]);
        assert_eq!(snapshot.pending_deletes.len(), 1);

        let plan = plan_for(&snapshot, desired());
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.position(StepOp::Update, &urn("f")), Some(0));
        assert_eq!(plan.steps[1].op, StepOp::DeleteReplaced);
        assert_eq!(plan.steps[1].depends_on, vec![0]);

        let second = Arc::new(FakeProvider::new());
        let report = StepExecutor::new(second.clone(), &store)
            .execute(&plan, &mut snapshot, &CancelSignal::new())
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(second.calls(), vec!["update f", "delete r r-old"]);

        let old_inputs = second.old_inputs.lock().unwrap().clone();
        assert_eq!(
            old_inputs[0].get("role").and_then(PropertyValue::as_str),
            Some("arn:r-old")
        );
        assert!(snapshot.pending_deletes.is_empty());
        assert_eq!(plan_for(&snapshot, desired()).len(), 0);
    }

    #[tokio::test]
    async fn test_lock_is_refreshed_during_run() {
        let provider = Arc::new(FakeProvider::with_delay(Duration::from_millis(40)));
        let store = MemorySnapshotStore::new();
        let lock = store.acquire_lock("runner", "apply").await.unwrap();
        let mut snapshot = Snapshot::new("dev");
        let plan = plan_for(&snapshot, vec![thing("a", "a"), thing("b", "b")]);
        let options = ApplyOptions {
            concurrency: 1,
            lock_refresh: Duration::from_millis(10),
            ..ApplyOptions::default()
        };

        let report = StepExecutor::new(provider, &store)
            .with_options(options)
            .with_lock(lock.lock_id.clone())
            .execute(&plan, &mut snapshot, &CancelSignal::new())
            .await
            .unwrap();

        assert!(report.is_success());
        let held = store.lock_info().await.unwrap().unwrap();
        assert_eq!(held.lock_id, lock.lock_id);
        assert!(held.expires_at > lock.expires_at);
    }

    #[tokio::test]
    async fn test_lost_lock_stops_the_run() {
        let provider = Arc::new(FakeProvider::with_delay(Duration::from_millis(40)));
        let store = MemorySnapshotStore::new();
        let lock = store.acquire_lock("runner", "apply").await.unwrap();
        store.force_unlock().await.unwrap();
        let mut snapshot = Snapshot::new("dev");
        let plan = plan_for(&snapshot, vec![thing("a", "a"), thing("b", "b")]);
        let options = ApplyOptions {
            concurrency: 1,
            lock_refresh: Duration::from_millis(10),
            ..ApplyOptions::default()
        };

        let result = StepExecutor::new(provider.clone(), &store)
            .with_options(options)
            .with_lock(lock.lock_id)
            .execute(&plan, &mut snapshot, &CancelSignal::new())
            .await;

        assert!(matches!(result, Err(ConvergeError::State(_))));
        assert_eq!(provider.calls(), vec!["create a"]);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let provider = Arc::new(FakeProvider::new());
        let store = MemorySnapshotStore::new();
        let mut snapshot = Snapshot::new("dev");
        let plan = plan_for(&snapshot, vec![thing("a", "a"), thing("b", "b")]);
        let cancel = CancelSignal::new();
        cancel.cancel();

        let report = StepExecutor::new(provider.clone(), &store)
            .execute(&plan, &mut snapshot, &cancel)
            .await
            .unwrap();

        assert_eq!(report.status, ApplyStatus::Cancelled);
        assert_eq!(report.not_started, 2);
        assert!(provider.calls().is_empty());
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_drains_in_flight_steps() {
        let provider = Arc::new(FakeProvider::with_delay(Duration::from_millis(100)));
        let store = MemorySnapshotStore::new();
        let mut snapshot = Snapshot::new("dev");
        let plan = plan_for(&snapshot, vec![thing("a", "a"), thing("b", "b"), thing("c", "c")]);
        let options = ApplyOptions {
            concurrency: 1,
            timeout: Some(Duration::from_millis(10)),
            ..ApplyOptions::default()
        };

        let report = StepExecutor::new(provider, &store)
            .with_options(options)
            .execute(&plan, &mut snapshot, &CancelSignal::new())
            .await
            .unwrap();

        assert_eq!(report.status, ApplyStatus::Cancelled);
        assert_eq!((report.succeeded, report.not_started), (1, 2));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(store.saves().await.len(), 1);
    }

    #[tokio::test]
    async fn test_save_failure_is_fatal() {
        let provider = Arc::new(FakeProvider::new());
        let store = MemorySnapshotStore::new();
        store.fail_saves_after(0).await;
        let mut snapshot = Snapshot::new("dev");
        let plan = plan_for(&snapshot, vec![thing("r", "r"), thing_using("f", "r")]);

        let result = StepExecutor::new(provider.clone(), &store)
            .execute(&plan, &mut snapshot, &CancelSignal::new())
            .await;

        assert!(matches!(result, Err(ConvergeError::State(_))));
        assert_eq!(provider.calls(), vec!["create r"]);
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_resource() {
        let provider = Arc::new(FakeProvider::new());
        provider.fail_on("gone", ProviderError::NotFound { id: String::from("gone-1") });
        let store = MemorySnapshotStore::new();
        let mut snapshot = Snapshot::new("dev");
        snapshot.upsert(thing("gone", "gone").with_id("gone-1"));
        let plan = plan_for(&snapshot, vec![]);

        let report = StepExecutor::new(provider, &store)
            .execute(&plan, &mut snapshot, &CancelSignal::new())
            .await
            .unwrap();

        assert!(report.is_success());
        assert!(snapshot.get(&urn("gone")).is_none());
    }
}
