//! S3-based snapshot storage for shared stacks.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::error::{Result, StateError};

use super::lock::{ensure_available, new_lock, refreshed, LockInfo, LOCK_EXPIRY_SECS};
use super::store::SnapshotStore;
use super::types::{Snapshot, SNAPSHOT_VERSION};

/// Snapshot object key suffix.
const SNAPSHOT_KEY: &str = "snapshot.json";

/// Lock object key suffix.
const LOCK_KEY: &str = "snapshot.lock";

/// S3-based snapshot store.
#[derive(Debug)]
pub struct S3SnapshotStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, empty or ending in `/`.
    prefix: String,
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .map(|p| format!("{p}/"))
        .unwrap_or_default()
}

impl S3SnapshotStore {
    /// Creates a store using the ambient AWS configuration.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Self {
        let config = if let Some(region) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Self::with_client(Client::new(&config), bucket, prefix)
    }

    /// Creates a store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    /// Gets the full S3 key for a file.
    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| StateError::s3(format!("Failed to read S3 object: {e}")))?;

                let content = String::from_utf8(bytes.to_vec())
                    .map_err(|e| StateError::corrupted(format!("Invalid UTF-8 in S3 object: {e}")))?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::s3(format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    /// Puts an object to S3.
    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StateError::s3(format!("S3 put error: {e}")))?;

        Ok(())
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StateError::s3(format!("S3 delete error: {e}")))?;

        Ok(())
    }

    /// Checks if an object exists in S3.
    async fn object_exists(&self, key: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(StateError::s3(format!("S3 head error: {service_err}")).into())
                }
            }
        }
    }
}

#[async_trait]
impl SnapshotStore for S3SnapshotStore {
    async fn load(&self) -> Result<Option<Snapshot>> {
        let key = self.key(SNAPSHOT_KEY);
        debug!("Loading snapshot from s3://{}/{key}", self.bucket);

        let Some(json) = self.get_object(&key).await? else {
            debug!("No snapshot found in S3");
            return Ok(None);
        };

        let snapshot: Snapshot = serde_json::from_str(&json)
            .map_err(|e| StateError::corrupted(format!("Failed to parse snapshot: {e}")))?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StateError::VersionMismatch {
                expected: SNAPSHOT_VERSION.to_string(),
                found: snapshot.version,
            }
            .into());
        }

        info!(
            "Loaded snapshot for stack {} (serial {})",
            snapshot.stack, snapshot.serial
        );
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let key = self.key(SNAPSHOT_KEY);
        debug!("Saving snapshot serial {} to s3://{}/{key}", snapshot.serial, self.bucket);

        let content = serde_json::to_string_pretty(snapshot)
            .map_err(|e| StateError::serialization(format!("Failed to serialize snapshot: {e}")))?;

        self.put_object(&key, &content).await
    }

    async fn delete(&self) -> Result<()> {
        let snapshot_key = self.key(SNAPSHOT_KEY);
        info!("Deleting snapshot from s3://{}/{snapshot_key}", self.bucket);

        self.delete_object(&snapshot_key).await?;
        self.delete_object(&self.key(LOCK_KEY)).await
    }

    async fn exists(&self) -> Result<bool> {
        self.object_exists(&self.key(SNAPSHOT_KEY)).await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        ensure_available(self.lock_info().await?.as_ref())?;

        let lock_info = new_lock(holder, operation);
        let content = serde_json::to_string_pretty(&lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        self.put_object(&self.key(LOCK_KEY), &content).await?;

        info!(
            "Acquired snapshot lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.lock_info().await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.key(LOCK_KEY)).await?;
                info!("Released snapshot lock: {lock_id}");
            } else {
                debug!("Lock ID mismatch: expected {lock_id}, found {}", existing.lock_id);
            }
        }
        Ok(())
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let lock_info = refreshed(self.lock_info().await?, lock_id)?;
        let content = serde_json::to_string_pretty(&lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        self.put_object(&self.key(LOCK_KEY), &content).await?;

        debug!("Refreshed snapshot lock {} until {}", lock_id, lock_info.expires_at);
        Ok(lock_info)
    }

    async fn force_unlock(&self) -> Result<()> {
        self.delete_object(&self.key(LOCK_KEY)).await
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        let Some(content) = self.get_object(&self.key(LOCK_KEY)).await? else {
            return Ok(None);
        };

        let lock_info: LockInfo = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock: {e}")))?;
        Ok(Some(lock_info))
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("stacks/prod/")), "stacks/prod/");
        assert_eq!(normalize_prefix(Some("/stacks")), "stacks/");
    }
}
