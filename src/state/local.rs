//! Local file-based snapshot storage.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::encoding::{Encoding, Marshalers};
use crate::error::{ConvergeError, Result, StateError};

use super::lock::{ensure_available, new_lock, refreshed, LockInfo, LOCK_EXPIRY_SECS};
use super::store::SnapshotStore;
use super::types::{Snapshot, SNAPSHOT_VERSION};

/// Default state directory name.
const STATE_DIR: &str = ".converge";

/// Snapshot file name.
const SNAPSHOT_FILE: &str = "snapshot.json";

/// Lock file name.
const LOCK_FILE: &str = "snapshot.lock";

/// Local file-based snapshot store.
#[derive(Debug)]
pub struct LocalSnapshotStore {
    /// Directory holding the snapshot and lock.
    base_dir: PathBuf,
    /// Path to the snapshot file.
    snapshot_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Snapshot encoding.
    encoding: Encoding,
}

impl LocalSnapshotStore {
    /// Creates a store under `.converge/` in the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| ConvergeError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a store with a JSON snapshot inside `base_dir`.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            snapshot_path: base_dir.join(SNAPSHOT_FILE),
            lock_path: base_dir.join(LOCK_FILE),
            base_dir,
            encoding: Encoding::Json,
        }
    }

    /// Creates a store for an explicit snapshot file.
    ///
    /// The encoding is chosen from the file extension.
    ///
    /// # Errors
    ///
    /// Returns an error if no marshaler handles the extension.
    pub fn with_snapshot_path(snapshot_path: impl Into<PathBuf>, marshalers: &Marshalers) -> Result<Self> {
        let snapshot_path = snapshot_path.into();
        let encoding = marshalers.for_path(&snapshot_path).ok_or_else(|| {
            StateError::UnsupportedFormat {
                path: snapshot_path.clone(),
            }
        })?;
        let base_dir = snapshot_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        Ok(Self {
            lock_path: base_dir.join(LOCK_FILE),
            base_dir,
            snapshot_path,
            encoding,
        })
    }

    /// Path of the snapshot file.
    #[must_use]
    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir)
                .await
                .map_err(|e| StateError::storage(format!("Failed to create state directory: {e}")))?;
        }
        Ok(())
    }

    /// Writes `content` to `path` through a synced temp file and a rename.
    async fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        self.ensure_dir().await?;
        let mut temp_name = path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::storage(format!("Failed to create {}: {e}", temp_path.display())))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::storage(format!("Failed to write {}: {e}", temp_path.display())))?;
        file.sync_all()
            .await
            .map_err(|e| StateError::storage(format!("Failed to sync {}: {e}", temp_path.display())))?;

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| StateError::storage(format!("Failed to rename onto {}: {e}", path.display())))?;
        Ok(())
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lock_path)
            .await
            .map_err(|e| StateError::corrupted(format!("Failed to read lock file: {e}")))?;

        let lock_info: LockInfo = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock file: {e}")))?;

        Ok(Some(lock_info))
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path).await.map_err(|e| StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for LocalSnapshotStore {
    async fn load(&self) -> Result<Option<Snapshot>> {
        if !self.snapshot_path.exists() {
            debug!("Snapshot file does not exist: {}", self.snapshot_path.display());
            return Ok(None);
        }

        info!("Loading snapshot from: {}", self.snapshot_path.display());

        let content = fs::read_to_string(&self.snapshot_path)
            .await
            .map_err(|e| StateError::corrupted(format!("Failed to read snapshot file: {e}")))?;

        let snapshot: Snapshot = self
            .encoding
            .decode(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse snapshot file: {e}")))?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StateError::VersionMismatch {
                expected: SNAPSHOT_VERSION.to_string(),
                found: snapshot.version,
            }
            .into());
        }

        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        debug!(
            "Saving snapshot serial {} to: {}",
            snapshot.serial,
            self.snapshot_path.display()
        );

        let content = self
            .encoding
            .encode(snapshot)
            .map_err(|e| StateError::serialization(format!("Failed to serialize snapshot: {e}")))?;

        self.write_atomic(&self.snapshot_path, &content).await
    }

    async fn delete(&self) -> Result<()> {
        if self.snapshot_path.exists() {
            info!("Deleting snapshot file: {}", self.snapshot_path.display());
            fs::remove_file(&self.snapshot_path)
                .await
                .map_err(|e| StateError::storage(format!("Failed to delete snapshot file: {e}")))?;
        }

        self.delete_lock_file().await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.snapshot_path.exists())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        ensure_available(self.read_lock_file().await?.as_ref())?;

        let lock_info = new_lock(holder, operation);
        let content = serde_json::to_string_pretty(&lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        self.write_atomic(&self.lock_path, &content)
            .await
            .map_err(|e| StateError::LockFailed {
                message: e.to_string(),
            })?;

        info!(
            "Acquired snapshot lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released snapshot lock: {lock_id}");
            } else {
                debug!("Lock ID mismatch: expected {lock_id}, found {}", existing.lock_id);
            }
        }
        Ok(())
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let lock_info = refreshed(self.read_lock_file().await?, lock_id)?;
        let content = serde_json::to_string_pretty(&lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        self.write_atomic(&self.lock_path, &content)
            .await
            .map_err(|e| StateError::LockFailed {
                message: e.to_string(),
            })?;

        debug!("Refreshed snapshot lock {} until {}", lock_id, lock_info.expires_at);
        Ok(lock_info)
    }

    async fn force_unlock(&self) -> Result<()> {
        self.delete_lock_file().await
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{PropertyMap, Resource, TypeToken, Urn};
    use tempfile::TempDir;

    fn create_test_store() -> (LocalSnapshotStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalSnapshotStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    fn sample_snapshot() -> Snapshot {
        let mut snapshot = Snapshot::new("dev");
        let urn = Urn::new("dev", None, &TypeToken::new("aws:iam/role:Role"), "deployer");
        let mut inputs = PropertyMap::new();
        inputs.insert("path", "/ci/");
        snapshot.upsert(Resource::new(urn, inputs).with_id("deployer-1"));
        snapshot
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store();
        store.save(&sample_snapshot()).await.expect("Failed to save snapshot");

        let loaded = store
            .load()
            .await
            .expect("Failed to load snapshot")
            .expect("Snapshot should exist");

        assert_eq!(loaded.stack, "dev");
        assert_eq!(loaded.serial, 1);
        assert_eq!(loaded.resources[0].id.as_deref(), Some("deployer-1"));
    }

    #[tokio::test]
    async fn test_yaml_snapshot_path() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let path = temp.path().join("nested").join("stack.yaml");
        let store = LocalSnapshotStore::with_snapshot_path(&path, &Marshalers::standard())
            .expect("yaml is supported");

        store.save(&sample_snapshot()).await.expect("Failed to save snapshot");
        let text = std::fs::read_to_string(&path).expect("snapshot written");
        assert!(text.contains("stack: dev"));
        assert!(store.load().await.expect("load").is_some());
    }

    #[test]
    fn test_unsupported_extension() {
        let result = LocalSnapshotStore::with_snapshot_path("state.toml", &Marshalers::standard());
        assert!(matches!(
            result,
            Err(ConvergeError::State(StateError::UnsupportedFormat { .. }))
        ));
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();
        assert!(store.load().await.expect("Load should not fail").is_none());
        assert!(!store.exists().await.expect("exists check failed"));
    }

    #[tokio::test]
    async fn test_version_mismatch() {
        let (store, _temp) = create_test_store();
        let mut snapshot = sample_snapshot();
        snapshot.version = String::from("0");
        store.save(&snapshot).await.expect("Failed to save snapshot");

        assert!(matches!(
            store.load().await,
            Err(ConvergeError::State(StateError::VersionMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("test-holder", "apply")
            .await
            .expect("Failed to acquire lock");
        assert!(store.is_locked().await.expect("is_locked failed"));

        store.release_lock("someone-else").await.expect("mismatch is not an error");
        assert!(store.is_locked().await.expect("is_locked failed"));

        store.release_lock(&lock.lock_id).await.expect("Failed to release lock");
        assert!(!store.is_locked().await.expect("is_locked failed"));
    }

    #[tokio::test]
    async fn test_lock_conflict_and_force_unlock() {
        let (store, _temp) = create_test_store();

        let _lock = store
            .acquire_lock("holder-1", "apply")
            .await
            .expect("Failed to acquire first lock");
        assert!(store.acquire_lock("holder-2", "apply").await.is_err());

        store.force_unlock().await.expect("force unlock");
        assert!(store.acquire_lock("holder-2", "apply").await.is_ok());
    }

    #[tokio::test]
    async fn test_refreshed_lock_outlives_original_expiry() {
        let (store, _temp) = create_test_store();
        let mut lock = store
            .acquire_lock("holder-1", "apply")
            .await
            .expect("Failed to acquire lock");

        lock.expires_at = chrono::Utc::now() + chrono::Duration::seconds(1);
        let content = serde_json::to_string_pretty(&lock).expect("serialize lock");
        std::fs::write(&store.lock_path, content).expect("write lock");

        let refreshed = store.refresh_lock(&lock.lock_id).await.expect("refresh lock");
        assert!(refreshed.remaining_secs() > LOCK_EXPIRY_SECS - 5);
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

        assert!(matches!(
            store.acquire_lock("holder-2", "apply").await,
            Err(ConvergeError::State(StateError::LockedByOther { .. }))
        ));
    }

    #[tokio::test]
    async fn test_taken_over_lock_cannot_be_refreshed() {
        let (store, _temp) = create_test_store();
        let lock = store
            .acquire_lock("holder-1", "apply")
            .await
            .expect("Failed to acquire lock");
        store.force_unlock().await.expect("force unlock");
        store.acquire_lock("holder-2", "apply").await.expect("second lock");

        assert!(matches!(
            store.refresh_lock(&lock.lock_id).await,
            Err(ConvergeError::State(StateError::LockFailed { .. }))
        ));
    }
}
