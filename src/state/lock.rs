//! Snapshot locking.
//!
//! A lock serializes apply runs against one snapshot. Locks expire so a
//! crashed process cannot block a stack forever.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{ConvergeError, Result, StateError};

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300;

/// How often a long-running holder re-writes its lock.
pub const LOCK_REFRESH_SECS: u64 = 60;

/// Information about a snapshot lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// What the holder is doing (`apply`, `manual`, ...).
    #[serde(default)]
    pub operation: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a new lock for a holder and operation.
    #[must_use]
    pub fn new(holder: &str, operation: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            operation: operation.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Refreshes the lock expiry time.
    pub fn refresh(&mut self) {
        self.expires_at = Utc::now() + chrono::Duration::seconds(LOCK_EXPIRY_SECS);
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let suffix = &Uuid::new_v4().simple().to_string()[..8];

    format!("{hostname}-{pid}-{suffix}")
}

/// Fails if `existing` is an unexpired lock.
pub(crate) fn ensure_available(existing: Option<&LockInfo>) -> Result<()> {
    match existing {
        Some(lock) if !lock.is_expired() => Err(ConvergeError::State(StateError::LockedByOther {
            holder: lock.holder.clone(),
            operation: lock.operation.clone(),
            since: lock.acquired_at.to_rfc3339(),
        })),
        Some(_) => {
            debug!("Expired lock found, taking over");
            Ok(())
        }
        None => Ok(()),
    }
}

/// Extends `existing` if it is still the lock named `lock_id`.
///
/// A lock that was released or taken over cannot be refreshed.
pub(crate) fn refreshed(existing: Option<LockInfo>, lock_id: &str) -> Result<LockInfo> {
    match existing {
        Some(mut lock) if lock.lock_id == lock_id => {
            lock.refresh();
            Ok(lock)
        }
        Some(other) => Err(ConvergeError::State(StateError::LockFailed {
            message: format!("lock {lock_id} was taken over by {}", other.holder),
        })),
        None => Err(ConvergeError::State(StateError::LockFailed {
            message: format!("lock {lock_id} is no longer held"),
        })),
    }
}

/// Builds a fresh lock, generating a holder ID when none is given.
pub(crate) fn new_lock(holder: &str, operation: &str) -> LockInfo {
    if holder.is_empty() {
        LockInfo::new(&generate_holder_id(), operation)
    } else {
        LockInfo::new(holder, operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_lock_is_live() {
        let lock = LockInfo::new("ci-runner", "apply");
        assert_eq!(lock.holder, "ci-runner");
        assert_eq!(lock.operation, "apply");
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > 0);
    }

    #[test]
    fn test_backdated_lock_expires() {
        let mut lock = LockInfo::new("ci-runner", "apply");
        lock.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(lock.is_expired());
        assert_eq!(lock.remaining_secs(), 0);
    }

    #[test]
    fn test_live_lock_blocks_expired_does_not() {
        let mut lock = new_lock("", "apply");
        assert!(!lock.holder.is_empty());
        assert!(matches!(
            ensure_available(Some(&lock)),
            Err(ConvergeError::State(StateError::LockedByOther { .. }))
        ));

        lock.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(ensure_available(Some(&lock)).is_ok());
        assert!(ensure_available(None).is_ok());
    }

    #[test]
    fn test_refresh_keeps_old_lock_exclusive() {
        let mut lock = LockInfo::new("ci-runner", "apply");
        lock.expires_at = Utc::now() + chrono::Duration::seconds(1);
        let lock_id = lock.lock_id.clone();

        let lock = refreshed(Some(lock), &lock_id).unwrap();
        assert!(lock.remaining_secs() > LOCK_EXPIRY_SECS - 5);
        assert!(ensure_available(Some(&lock)).is_err());
    }

    #[test]
    fn test_refresh_requires_ownership() {
        let lock = LockInfo::new("ci-runner", "apply");
        assert!(matches!(
            refreshed(Some(lock), "someone-else"),
            Err(ConvergeError::State(StateError::LockFailed { .. }))
        ));
        assert!(refreshed(None, "anything").is_err());
    }

    #[test]
    fn test_holder_ids_are_unique() {
        let first = generate_holder_id();
        let second = generate_holder_id();
        assert_ne!(first, second);
        assert!(first.contains(&std::process::id().to_string()));
    }
}
