//! Snapshot store trait definition.

use async_trait::async_trait;

use crate::error::Result;
use super::lock::LockInfo;
use super::types::Snapshot;

/// Durable storage for a stack's snapshot.
///
/// `save` must be durable when it returns: the executor records each
/// completed step before releasing any step that depends on it.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Loads the snapshot.
    ///
    /// Returns `None` if nothing has been recorded yet.
    async fn load(&self) -> Result<Option<Snapshot>>;

    /// Saves the snapshot.
    async fn save(&self, snapshot: &Snapshot) -> Result<()>;

    /// Deletes the snapshot and any lock.
    async fn delete(&self) -> Result<()>;

    /// Checks if a snapshot exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the lock for an operation.
    ///
    /// An empty holder is replaced by a generated process identifier.
    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo>;

    /// Releases the lock if `lock_id` still owns it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Pushes back the expiry of the lock `lock_id`.
    ///
    /// Fails if that lock is no longer the one held.
    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo>;

    /// Removes the lock regardless of owner.
    async fn force_unlock(&self) -> Result<()>;

    /// Gets current lock information if locked.
    async fn lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if an unexpired lock is held.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self.lock_info().await?.is_some_and(|lock| !lock.is_expired()))
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl SnapshotStore for Box<dyn SnapshotStore> {
    async fn load(&self) -> Result<Option<Snapshot>> {
        (**self).load().await
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        (**self).save(snapshot).await
    }

    async fn delete(&self) -> Result<()> {
        (**self).delete().await
    }

    async fn exists(&self) -> Result<bool> {
        (**self).exists().await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder, operation).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        (**self).refresh_lock(lock_id).await
    }

    async fn force_unlock(&self) -> Result<()> {
        (**self).force_unlock().await
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).lock_info().await
    }

    async fn is_locked(&self) -> Result<bool> {
        (**self).is_locked().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
