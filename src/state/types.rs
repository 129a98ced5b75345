//! Snapshot types: the recorded state of deployed resources.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resource::{Resource, Urn};

/// Current version of the snapshot format.
pub const SNAPSHOT_VERSION: &str = "1";

/// Maximum number of apply history entries kept.
const MAX_HISTORY: usize = 100;

/// The recorded state of a stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot format version.
    pub version: String,
    /// Stack name.
    pub stack: String,
    /// Incremented on every recorded mutation.
    #[serde(default)]
    pub serial: u64,
    /// Live resources, in the order they were recorded.
    #[serde(default)]
    pub resources: Vec<Resource>,
    /// Replaced instances still waiting for deletion.
    #[serde(default)]
    pub pending_deletes: Vec<Resource>,
    /// When the snapshot was last mutated.
    pub last_updated: DateTime<Utc>,
    /// Recent apply runs, oldest first.
    #[serde(default)]
    pub history: Vec<ApplyHistoryEntry>,
}

/// Overall outcome of an apply run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    /// Every step succeeded.
    Succeeded,
    /// Some steps succeeded and some failed or were skipped.
    PartiallySucceeded,
    /// No step succeeded.
    Failed,
    /// The run was cancelled or timed out before finishing.
    Cancelled,
}

/// A single entry in the apply history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyHistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Fingerprint of the plan that ran.
    pub fingerprint: String,
    /// Overall outcome.
    pub status: ApplyStatus,
    /// Number of succeeded steps.
    pub succeeded: usize,
    /// Number of failed steps.
    pub failed: usize,
    /// Number of skipped or never-started steps.
    pub skipped: usize,
}

impl Snapshot {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn new(stack: &str) -> Self {
        Self {
            version: SNAPSHOT_VERSION.to_string(),
            stack: stack.to_string(),
            serial: 0,
            resources: Vec::new(),
            pending_deletes: Vec::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    fn touch(&mut self) {
        self.serial += 1;
        self.last_updated = Utc::now();
    }

    /// Gets a live resource.
    #[must_use]
    pub fn get(&self, urn: &Urn) -> Option<&Resource> {
        self.resources.iter().find(|r| &r.urn == urn)
    }

    /// Gets a mutable live resource.
    pub fn get_mut(&mut self, urn: &Urn) -> Option<&mut Resource> {
        self.resources.iter_mut().find(|r| &r.urn == urn)
    }

    /// Records a resource, replacing any live record with the same URN in place.
    pub fn upsert(&mut self, resource: Resource) {
        match self.resources.iter_mut().find(|r| r.urn == resource.urn) {
            Some(existing) => *existing = resource,
            None => self.resources.push(resource),
        }
        self.touch();
    }

    /// Removes a live resource.
    pub fn remove(&mut self, urn: &Urn) -> Option<Resource> {
        let index = self.resources.iter().position(|r| &r.urn == urn)?;
        let removed = self.resources.remove(index);
        self.touch();
        Some(removed)
    }

    /// Moves the live record of `urn` to the pending-delete list.
    ///
    /// Returns false if there was no live record.
    pub fn retire(&mut self, urn: &Urn) -> bool {
        let Some(index) = self.resources.iter().position(|r| &r.urn == urn) else {
            return false;
        };
        let old = self.resources.remove(index);
        self.pending_deletes.push(old);
        self.touch();
        true
    }

    /// Removes a pending delete matching both URN and ID.
    pub fn remove_pending_delete(&mut self, urn: &Urn, id: Option<&str>) -> Option<Resource> {
        let index = self
            .pending_deletes
            .iter()
            .position(|r| &r.urn == urn && r.id.as_deref() == id)?;
        let removed = self.pending_deletes.remove(index);
        self.touch();
        Some(removed)
    }

    /// Adds a history entry, keeping only the most recent ones.
    pub fn add_history(&mut self, entry: ApplyHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Number of live resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if no resources are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.pending_deletes.is_empty()
    }
}

impl std::fmt::Display for ApplyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::Succeeded => "succeeded",
            Self::PartiallySucceeded => "partially succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{status}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{PropertyMap, TypeToken};

    fn resource(name: &str, id: &str) -> Resource {
        let urn = Urn::new("dev", None, &TypeToken::new("test:index:Thing"), name);
        Resource::new(urn, PropertyMap::new()).with_id(id)
    }

    #[test]
    fn test_mutations_bump_serial() {
        let mut snapshot = Snapshot::new("dev");
        snapshot.upsert(resource("a", "a-1"));
        snapshot.upsert(resource("a", "a-2"));
        snapshot.upsert(resource("b", "b-1"));

        assert_eq!(snapshot.serial, 3);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.resources[0].id.as_deref(), Some("a-2"));
    }

    #[test]
    fn test_retire_and_remove_pending() {
        let mut snapshot = Snapshot::new("dev");
        let old = resource("a", "a-1");
        let urn = old.urn.clone();
        snapshot.upsert(old);

        assert!(snapshot.retire(&urn));
        assert!(snapshot.get(&urn).is_none());
        assert_eq!(snapshot.pending_deletes.len(), 1);

        assert!(snapshot.remove_pending_delete(&urn, Some("other")).is_none());
        assert!(snapshot.remove_pending_delete(&urn, Some("a-1")).is_some());
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut snapshot = Snapshot::new("dev");
        for i in 0..105 {
            snapshot.add_history(ApplyHistoryEntry {
                timestamp: Utc::now(),
                fingerprint: format!("fp-{i}"),
                status: ApplyStatus::Succeeded,
                succeeded: 1,
                failed: 0,
                skipped: 0,
            });
        }
        assert_eq!(snapshot.history.len(), MAX_HISTORY);
        assert_eq!(snapshot.history[0].fingerprint, "fp-5");
    }
}
