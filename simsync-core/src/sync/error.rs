//! Sync error types.

use super::protocol::DecodeError;
use crate::store::StoreError;

/// Errors that can end a sync connection.
#[derive(Debug)]
pub enum SyncError {
    /// Failed to open the connection
    ConnectionError(String),
    /// Read or write on an open connection failed, or the peer went away
    TransportError(String),
    /// A frame could not be decoded; protocol state can no longer be trusted
    ProtocolDecodeError(DecodeError),
    /// The server did not acknowledge the init frame as expected
    HandshakeError(String),
    /// The index or an entity fetched during bootstrap is unusable
    InvalidBootstrapData(String),
    /// A delta could not be applied to an entity's current text
    DeltaApplyError(StoreError),
    /// The caller's bucket state refused an init or update
    StateError(String),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::ConnectionError(e) => write!(f, "Connection error: {}", e),
            SyncError::TransportError(e) => write!(f, "Transport error: {}", e),
            SyncError::ProtocolDecodeError(e) => write!(f, "Protocol decode error: {}", e),
            SyncError::HandshakeError(e) => write!(f, "Handshake failed: {}", e),
            SyncError::InvalidBootstrapData(e) => write!(f, "Invalid bootstrap data: {}", e),
            SyncError::DeltaApplyError(e) => write!(f, "Failed to apply change: {}", e),
            SyncError::StateError(e) => write!(f, "Bucket state error: {}", e),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::ProtocolDecodeError(e) => Some(e),
            SyncError::DeltaApplyError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DecodeError> for SyncError {
    fn from(e: DecodeError) -> Self {
        SyncError::ProtocolDecodeError(e)
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::DeltaApplyError(e)
    }
}
