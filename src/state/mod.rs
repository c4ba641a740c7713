//! State management module.
//!
//! This module provides versioned, lockable storage of resource records:
//! snapshot types, locks, the `StateStore` trait and its local, in-memory
//! and S3 backends, plus read-only remote state references.

mod local;
mod lock;
mod memory;
mod remote;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{DEFAULT_LOCK_TTL_SECS, LockInfo, generate_holder_id};
pub use memory::MemoryStateStore;
pub use remote::{HttpRemoteState, RemoteState, StoreRemoteState};
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{DeposedObject, ResourceRecord, STATE_VERSION, SnapshotVersion, StateSnapshot};
