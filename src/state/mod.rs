//! Snapshot storage.
//!
//! The snapshot records every deployed resource with its provider ID and
//! outputs, replaced instances awaiting deletion, and recent apply history.

mod local;
mod lock;
mod memory;
mod s3;
mod store;
mod types;

pub use local::LocalSnapshotStore;
pub use lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS, LOCK_REFRESH_SECS};
pub use memory::MemorySnapshotStore;
pub use s3::S3SnapshotStore;
pub use store::SnapshotStore;
pub use types::{ApplyHistoryEntry, ApplyStatus, Snapshot, SNAPSHOT_VERSION};
