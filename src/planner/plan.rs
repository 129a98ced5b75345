//! Plan construction.
//!
//! A plan is an ordered list of steps. Creates, updates and replacement
//! creates follow the desired graph's topological order so dependencies
//! exist first. Deletes follow the prior graph's reverse order so nothing
//! is deleted while a dependent still uses it. Replaced instances are
//! deleted after their replacement exists, unless the provider requires
//! the old instance to go first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info};

use crate::error::GraphError;
use crate::graph::ResourceGraph;
use crate::resource::{PropertyKey, Resource, SchemaRegistry, TypeToken, Urn};

use super::diff::{DiffKind, DiffSet, ResourceDiff};
use super::fingerprint::PlanHasher;

/// Operation performed by a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOp {
    /// Create a new resource.
    Create,
    /// Update a resource in place.
    Update,
    /// Delete a resource removed from the program.
    Delete,
    /// Create the new instance of a replaced resource.
    CreateReplacement,
    /// Delete the old instance of a replaced resource.
    DeleteReplaced,
}

impl StepOp {
    /// Returns true for operations that create an instance.
    #[must_use]
    pub const fn is_create(self) -> bool {
        matches!(self, Self::Create | Self::CreateReplacement)
    }

    /// Returns true for operations that delete an instance.
    #[must_use]
    pub const fn is_delete(self) -> bool {
        matches!(self, Self::Delete | Self::DeleteReplaced)
    }
}

impl std::fmt::Display for StepOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::CreateReplacement => "create-replacement",
            Self::DeleteReplaced => "delete-replaced",
        };
        write!(f, "{op}")
    }
}

/// One provider operation in a plan.
#[derive(Debug, Clone, Serialize)]
pub struct Step {
    /// Operation.
    pub op: StepOp,
    /// Target resource.
    pub urn: Urn,
    /// Target type.
    pub type_token: TypeToken,
    /// Recorded instance the step acts on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<Resource>,
    /// Desired instance the step produces.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<Resource>,
    /// Keys that motivated the step.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<PropertyKey>,
    /// Indices of steps that must finish first.
    pub depends_on: Vec<usize>,
    /// Human-readable reason.
    pub reason: String,
}

/// Counts of resources by diff kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Resources to create.
    pub creates: usize,
    /// Resources to update in place.
    pub updates: usize,
    /// Resources to replace.
    pub replaces: usize,
    /// Resources to delete.
    pub deletes: usize,
    /// Unchanged resources.
    pub unchanged: usize,
}

impl PlanSummary {
    fn from_diffs(diffs: &DiffSet) -> Self {
        Self {
            creates: diffs.count(DiffKind::Added),
            updates: diffs.count(DiffKind::Updated),
            replaces: diffs.count(DiffKind::Replaced),
            deletes: diffs.count(DiffKind::Deleted),
            unchanged: diffs.count(DiffKind::Same),
        }
    }
}

/// An ordered, fingerprinted set of steps.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// Stack the plan targets.
    pub stack: String,
    /// When the plan was built.
    pub created_at: DateTime<Utc>,
    /// Steps in a valid sequential order.
    pub steps: Vec<Step>,
    /// Resource counts.
    pub summary: PlanSummary,
    /// Hash of the steps, used to confirm the reviewed plan is the one applied.
    pub fingerprint: String,
}

impl Plan {
    /// Returns true if nothing needs to change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Operations in order, with their targets.
    #[must_use]
    pub fn ops(&self) -> Vec<(StepOp, &Urn)> {
        self.steps.iter().map(|s| (s.op, &s.urn)).collect()
    }

    /// Index of the first step of `op` on `urn`.
    #[must_use]
    pub fn position(&self, op: StepOp, urn: &Urn) -> Option<usize> {
        self.steps.iter().position(|s| s.op == op && &s.urn == urn)
    }
}

/// Turns classified diffs into an ordered plan.
#[derive(Debug, Clone, Copy)]
pub struct PlanBuilder<'a> {
    registry: &'a SchemaRegistry,
}

struct Emitter<'g> {
    prior: &'g ResourceGraph,
    desired: &'g ResourceGraph,
    steps: Vec<Step>,
    last_step: HashMap<Urn, usize>,
    deleted: HashSet<Urn>,
}

impl Emitter<'_> {
    fn push(&mut self, step: Step) -> usize {
        let index = self.steps.len();
        self.last_step.insert(step.urn.clone(), index);
        self.steps.push(step);
        index
    }

    /// Latest steps among `start` and its neighbors, walking through
    /// neighbors that have no step of their own.
    fn reach(&self, urn: &Urn, neighbors: impl Fn(&Urn) -> Vec<Urn>) -> Vec<usize> {
        let mut found = BTreeSet::new();
        if let Some(&own) = self.last_step.get(urn) {
            found.insert(own);
        }

        let mut visited: HashSet<Urn> = HashSet::new();
        let mut pending = neighbors(urn);
        while let Some(next) = pending.pop() {
            if !visited.insert(next.clone()) {
                continue;
            }
            match self.last_step.get(&next) {
                Some(&index) => {
                    found.insert(index);
                }
                None => pending.extend(neighbors(&next)),
            }
        }
        found.into_iter().collect()
    }

    fn create_deps(&self, urn: &Urn) -> Vec<usize> {
        self.reach(urn, |u| self.desired.dependencies(u))
    }

    fn delete_deps(&self, urn: &Urn) -> Vec<usize> {
        self.reach(urn, |u| self.prior.dependents(u))
    }

    fn step(op: StepOp, diff: &ResourceDiff, old: Option<&Resource>, new: Option<&Resource>, reason: String) -> Step {
        Step {
            op,
            urn: diff.urn.clone(),
            type_token: diff.type_token.clone(),
            old: old.cloned(),
            new: new.cloned(),
            keys: diff.keys(),
            depends_on: Vec::new(),
            reason,
        }
    }

    fn emit_delete(&mut self, op: StepOp, diff: &ResourceDiff, reason: String) {
        let depends_on = self.delete_deps(&diff.urn);
        let old = self.prior.get(&diff.urn);
        let mut step = Self::step(op, diff, old, None, reason);
        step.depends_on = depends_on;
        self.push(step);
        self.deleted.insert(diff.urn.clone());
    }

    fn emit_create(&mut self, op: StepOp, diff: &ResourceDiff, reason: String) {
        let depends_on = self.create_deps(&diff.urn);
        let old = self.prior.get(&diff.urn);
        let new = self.desired.get(&diff.urn);
        let mut step = Self::step(op, diff, old, new, reason);
        step.depends_on = depends_on;
        self.push(step);
    }
}

fn replace_reason(diff: &ResourceDiff) -> String {
    let keys = diff.replace_keys();
    if keys.is_empty() {
        let causes: Vec<String> = diff.cascaded_from.iter().map(|u| u.name().to_string()).collect();
        format!("dependency replaced: {}", causes.join(", "))
    } else {
        format!("replacing: {}", keys.join(", "))
    }
}

fn update_reason(diff: &ResourceDiff) -> String {
    let keys = diff.changed_keys();
    if keys.is_empty() {
        let causes: Vec<String> = diff.cascaded_from.iter().map(|u| u.name().to_string()).collect();
        format!("dependency replaced: {}", causes.join(", "))
    } else {
        format!("updating: {}", keys.join(", "))
    }
}

impl<'a> PlanBuilder<'a> {
    /// Creates a plan builder.
    #[must_use]
    pub const fn new(registry: &'a SchemaRegistry) -> Self {
        Self { registry }
    }

    fn deletes_first(&self, type_token: &TypeToken) -> bool {
        self.registry.capabilities(type_token).delete_before_replace
    }

    /// Moves the updated prior dependents of each delete-first replacement
    /// ahead of it, along with everything they depend on.
    ///
    /// Those updates drop the reference to the old instance, so they must
    /// land before it is deleted. None of them depends on the replaced
    /// resource in the desired graph, since that would have forced their
    /// replacement, so the result is still a topological order.
    fn hoist_detaching_updates(
        &self,
        mut order: Vec<Urn>,
        prior: &ResourceGraph,
        desired: &ResourceGraph,
        diffs: &DiffSet,
    ) -> Vec<Urn> {
        let delete_first: Vec<Urn> = diffs
            .iter()
            .filter(|d| d.kind == DiffKind::Replaced && self.deletes_first(&d.type_token))
            .map(|d| d.urn.clone())
            .collect();

        for urn in delete_first {
            let Some(at) = order.iter().position(|u| u == &urn) else {
                continue;
            };
            let mut hoisted: HashSet<Urn> = HashSet::new();
            let mut pending: Vec<Urn> = prior
                .transitive_dependents(&urn)
                .into_iter()
                .filter(|d| diffs.kind(d) == Some(DiffKind::Updated))
                .collect();
            while let Some(next) = pending.pop() {
                if hoisted.insert(next.clone()) {
                    pending.extend(desired.dependencies(&next));
                }
            }
            if hoisted.is_empty() {
                continue;
            }

            let (moved, rest): (Vec<Urn>, Vec<Urn>) =
                order.split_off(at).into_iter().partition(|u| hoisted.contains(u));
            debug!("Updating {} resource(s) before deleting {}", moved.len(), urn);
            order.extend(moved);
            order.extend(rest);
        }
        order
    }

    /// Builds the plan.
    ///
    /// `diffs` must already include the replacement cascade.
    /// `pending_deletes` are replaced instances left over from earlier runs;
    /// they are deleted last.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphError`] if either graph has a cycle.
    pub fn build(
        &self,
        stack: &str,
        prior: &ResourceGraph,
        desired: &ResourceGraph,
        diffs: &DiffSet,
        pending_deletes: &[Resource],
    ) -> Result<Plan, GraphError> {
        let desired_order = self.hoist_detaching_updates(desired.topological_order()?, prior, desired, diffs);
        let prior_order = prior.topological_order()?;
        let prior_rank: HashMap<&Urn, usize> =
            prior_order.iter().enumerate().map(|(i, u)| (u, i)).collect();

        let mut emitter = Emitter {
            prior,
            desired,
            steps: Vec::new(),
            last_step: HashMap::new(),
            deleted: HashSet::new(),
        };

        for urn in &desired_order {
            let Some(diff) = diffs.get(urn) else {
                continue;
            };
            match diff.kind {
                DiffKind::Same | DiffKind::Deleted => {}
                DiffKind::Added => {
                    emitter.emit_create(StepOp::Create, diff, String::from("new resource"));
                }
                DiffKind::Updated => {
                    emitter.emit_create(StepOp::Update, diff, update_reason(diff));
                }
                DiffKind::Replaced if self.deletes_first(&diff.type_token) => {
                    let mut doomed: Vec<Urn> = prior
                        .transitive_dependents(urn)
                        .into_iter()
                        .filter(|d| {
                            matches!(diffs.kind(d), Some(DiffKind::Replaced | DiffKind::Deleted))
                        })
                        .collect();
                    doomed.sort_by_key(|d| std::cmp::Reverse(prior_rank.get(d).copied().unwrap_or(0)));

                    for dependent in doomed {
                        if emitter.deleted.contains(&dependent) {
                            continue;
                        }
                        let Some(dependent_diff) = diffs.get(&dependent) else {
                            continue;
                        };
                        let op = if dependent_diff.kind == DiffKind::Deleted {
                            StepOp::Delete
                        } else {
                            StepOp::DeleteReplaced
                        };
                        let reason = format!("{} must be deleted before it is replaced", urn.name());
                        emitter.emit_delete(op, dependent_diff, reason);
                    }

                    if !emitter.deleted.contains(urn) {
                        emitter.emit_delete(
                            StepOp::DeleteReplaced,
                            diff,
                            String::from("deleting before creating replacement"),
                        );
                    }
                    emitter.emit_create(StepOp::CreateReplacement, diff, replace_reason(diff));
                }
                DiffKind::Replaced => {
                    emitter.emit_create(StepOp::CreateReplacement, diff, replace_reason(diff));
                }
            }
        }

        for urn in prior_order.iter().rev() {
            if emitter.deleted.contains(urn) {
                continue;
            }
            let Some(diff) = diffs.get(urn) else {
                continue;
            };
            match diff.kind {
                DiffKind::Deleted => {
                    emitter.emit_delete(StepOp::Delete, diff, String::from("removed from program"));
                }
                DiffKind::Replaced => {
                    emitter.emit_delete(
                        StepOp::DeleteReplaced,
                        diff,
                        String::from("replaced by new instance"),
                    );
                }
                _ => {}
            }
        }

        for leftover in pending_deletes.iter().rev() {
            debug!("Scheduling leftover delete of {}", leftover.urn);
            let depends_on = emitter.delete_deps(&leftover.urn);
            emitter.push(Step {
                op: StepOp::DeleteReplaced,
                urn: leftover.urn.clone(),
                type_token: leftover.type_token.clone(),
                old: Some(leftover.clone()),
                new: None,
                keys: Vec::new(),
                depends_on,
                reason: String::from("pending delete from an earlier run"),
            });
        }

        let steps = emitter.steps;
        let fingerprint = PlanHasher::new().fingerprint(stack, &steps);
        let plan = Plan {
            stack: stack.to_string(),
            created_at: Utc::now(),
            summary: PlanSummary::from_diffs(diffs),
            steps,
            fingerprint,
        };

        info!(
            "Plan for {}: {} step(s), {} create, {} update, {} replace, {} delete",
            stack,
            plan.len(),
            plan.summary.creates,
            plan.summary.updates,
            plan.summary.replaces,
            plan.summary.deletes
        );
        Ok(plan)
    }
}
