//! Replacement cascade.
//!
//! Replacing a resource gives it a new identity, so everything that
//! references it sees its inputs change. Each referencing key is treated as
//! changed and classified by its own mutability; dependents with only an
//! explicit dependency are updated. When the replaced type must be deleted
//! before its replacement is created, every transitive dependent has to go
//! too, so they are all replaced.
//!
//! A replaced instance still awaiting deletion from an interrupted run counts
//! as a replacement too: dependents recorded against it are re-pointed at
//! the live instance before it goes.
//!
//! Escalation only moves upward (same, update, replace), so the worklist
//! reaches a fixed point.

use std::collections::{HashSet, VecDeque};
use tracing::debug;

use crate::graph::ResourceGraph;
use crate::resource::{Resource, SchemaRegistry, TypeToken, Urn};

use super::diff::{DiffClassifier, DiffKind, DiffSet};

/// Propagates replacements to dependents.
#[derive(Debug, Clone, Copy)]
pub struct ReplacementCascade<'a> {
    registry: &'a SchemaRegistry,
}

impl<'a> ReplacementCascade<'a> {
    /// Creates a cascade over a registry.
    #[must_use]
    pub const fn new(registry: &'a SchemaRegistry) -> Self {
        Self { registry }
    }

    fn deletes_first(&self, type_token: &TypeToken) -> bool {
        self.registry.capabilities(type_token).delete_before_replace
    }

    /// Escalates diffs until no replacement changes anything further.
    ///
    /// Returns the number of diffs that were escalated.
    pub fn apply(&self, diffs: &mut DiffSet, desired: &ResourceGraph) -> usize {
        self.apply_with_pending(diffs, desired, &[])
    }

    /// Like [`apply`](Self::apply), also treating every resource with a
    /// pending delete as replaced.
    pub fn apply_with_pending(&self, diffs: &mut DiffSet, desired: &ResourceGraph, pending_deletes: &[Resource]) -> usize {
        let classifier = DiffClassifier::new(self.registry);
        let mut escalated: HashSet<Urn> = HashSet::new();
        let mut forced: HashSet<Urn> = HashSet::new();
        let mut queue: VecDeque<(Urn, bool)> = VecDeque::new();

        for diff in diffs.iter().filter(|d| d.kind == DiffKind::Replaced) {
            let force = self.deletes_first(&diff.type_token);
            if force {
                forced.insert(diff.urn.clone());
            }
            queue.push_back((diff.urn.clone(), force));
        }

        let mut seeded: HashSet<&Urn> = HashSet::new();
        for retired in pending_deletes {
            let already_replaced = diffs.kind(&retired.urn) == Some(DiffKind::Replaced);
            if desired.contains(&retired.urn) && !already_replaced && seeded.insert(&retired.urn) {
                debug!("{} has a pending delete, re-pointing its dependents", retired.urn);
                queue.push_back((retired.urn.clone(), false));
            }
        }

        while let Some((replaced, force)) = queue.pop_front() {
            for dependent in desired.dependents(&replaced) {
                let Some(resource) = desired.get(&dependent) else {
                    continue;
                };
                let Some(diff) = diffs.get_mut(&dependent) else {
                    continue;
                };
                if !diff.is_matched() {
                    continue;
                }

                let before = diff.kind;
                let keys = resource.keys_referencing(&replaced);
                for key in &keys {
                    diff.add_change(classifier.forced_change(resource, key));
                }
                if keys.is_empty() {
                    diff.escalate(DiffKind::Updated);
                }
                if force {
                    diff.escalate(DiffKind::Replaced);
                }

                if diff.kind != before || force {
                    if !diff.cascaded_from.contains(&replaced) {
                        diff.cascaded_from.push(replaced.clone());
                    }
                    if diff.kind != before {
                        debug!("{} escalated from {} to {} by {}", dependent, before, diff.kind, replaced);
                        escalated.insert(dependent.clone());
                    }
                }

                if diff.kind != DiffKind::Replaced {
                    continue;
                }
                let child_force = force || self.deletes_first(&resource.type_token);
                let newly_replaced = before != DiffKind::Replaced;
                let newly_forced = child_force && !forced.contains(&dependent);
                if newly_replaced || newly_forced {
                    if child_force {
                        forced.insert(dependent.clone());
                    }
                    queue.push_back((dependent, child_force));
                }
            }
        }

        escalated.len()
    }
}
