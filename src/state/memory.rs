//! In-memory snapshot store.
//!
//! Keeps every saved snapshot so callers can inspect how a run progressed.
//! Useful for previews and for driving the engine in tests.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{Result, StateError};

use super::lock::{ensure_available, new_lock, refreshed, LockInfo};
use super::store::SnapshotStore;
use super::types::Snapshot;

#[derive(Debug, Default)]
struct Inner {
    saves: Vec<Snapshot>,
    lock: Option<LockInfo>,
    fail_after: Option<usize>,
}

/// Snapshot store backed by memory.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    inner: Mutex<Inner>,
}

impl MemorySnapshotStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that already holds a snapshot.
    #[must_use]
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            inner: Mutex::new(Inner {
                saves: vec![snapshot],
                ..Inner::default()
            }),
        }
    }

    /// Makes every save after the next `count` fail.
    pub async fn fail_saves_after(&self, count: usize) {
        let mut inner = self.inner.lock().await;
        inner.fail_after = Some(inner.saves.len() + count);
    }

    /// Every snapshot saved so far, oldest first.
    pub async fn saves(&self) -> Vec<Snapshot> {
        self.inner.lock().await.saves.clone()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self) -> Result<Option<Snapshot>> {
        Ok(self.inner.lock().await.saves.last().cloned())
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.fail_after.is_some_and(|limit| inner.saves.len() >= limit) {
            return Err(StateError::storage("memory store rejected the write").into());
        }
        inner.saves.push(snapshot.clone());
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.saves.clear();
        inner.lock = None;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(!self.inner.lock().await.saves.is_empty())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let mut inner = self.inner.lock().await;
        ensure_available(inner.lock.as_ref())?;
        let lock = new_lock(holder, operation);
        inner.lock = Some(lock.clone());
        Ok(lock)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.lock.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            inner.lock = None;
        }
        Ok(())
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let mut inner = self.inner.lock().await;
        let lock = refreshed(inner.lock.clone(), lock_id)?;
        inner.lock = Some(lock.clone());
        Ok(lock)
    }

    async fn force_unlock(&self) -> Result<()> {
        self.inner.lock().await.lock = None;
        Ok(())
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.inner.lock().await.lock.clone())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
