//! Simsync Core Library
//!
//! Bucket mirroring over the real-time sync protocol: wire codec, text
//! deltas, the entity store, the sync client, and the file and note
//! bucket states built on them.

pub mod bridge;
pub mod bucket;
pub mod delta;
pub mod notes;
pub mod store;
pub mod sync;

pub use bridge::{BridgeError, LocalBridge, LocalEvent, SyncedFile};
pub use bucket::{Bucket, BucketState, SharedBucket, StateError};
pub use delta::{DeltaCodec, DeltaError, DiffMatchPatch};
pub use notes::NoteMirror;
pub use store::{Applied, Entity, EntityStore, StoreError};
pub use sync::{
    Change, ClientSettings, ConnectionState, Disconnect, SyncClient, SyncError,
};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
