//! Sync module for the bucket channel protocol.
//!
//! This module provides the WebSocket client that keeps one bucket mirrored
//! between the server and a local [`Bucket`](crate::bucket::Bucket).
//!
//! ## Protocol
//!
//! 1. Connect to `<server>/sock/1/<app_id>/websocket`
//! 2. Send `0:init:{...}` with the token, app id and bucket name
//! 3. Receive the auth acknowledgement, then the bucket acknowledgement
//! 4. Page through the index with `0:i::<mark>::<limit>`, then fetch each
//!    entity with `0:e:<id>.<version>`
//! 5. Stream: apply `0:c:[...]` broadcasts, send local changes as
//!    `0:c:{...}` and heartbeats as `h:<n>`

mod client;
mod error;
pub mod protocol;

pub use client::{
    ClientSettings, ConnectionState, Disconnect, SyncClient, CLOSE_GRACE, DEFAULT_SERVER_URL,
    HEARTBEAT_INTERVAL,
};
pub use error::SyncError;
pub use protocol::{Broadcast, Change, ChangeRejection, FieldOp, Operation};
