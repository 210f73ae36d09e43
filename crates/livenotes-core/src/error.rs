//! Error types for Live Notes sync

use thiserror::Error;

use crate::sync::codec::DecodeError;

/// Main error type for sync engine operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Send attempted on a transport that has not confirmed bidirectional delivery
    #[error("Transport not ready: {0}")]
    NotReady(String),

    /// Operation is not meaningful for this transport's role
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Radio or socket capability missing (permissions, adapter off).
    /// Not retried until the host calls `start()` again.
    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// Expected service or channel missing after connect
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Inbound message could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Note rejected by the merge rules (blank title or content)
    #[error("Invalid note: {0}")]
    InvalidNote(String),

    /// Transient network failure
    #[error("Network error: {0}")]
    Network(String),

    /// WebSocket failure on the server link
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be loaded or is invalid
    #[error("Config error: {0}")]
    Config(String),

    /// Snapshot cache read/write failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// The engine or one of its workers has shut down
    #[error("Shut down: {0}")]
    Shutdown(String),
}

impl SyncError {
    /// Whether the failure is local and recovered by the transport's own retry loop
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::WebSocket(_) | SyncError::Io(_) | SyncError::Protocol(_)
        )
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::NotReady("central".to_string());
        assert_eq!(format!("{}", err), "Transport not ready: central");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let sync_err: SyncError = io_err.into();
        assert!(matches!(sync_err, SyncError::Io(_)));
        assert!(sync_err.is_transient());
    }

    #[test]
    fn test_capability_unavailable_is_not_transient() {
        let err = SyncError::CapabilityUnavailable("bluetooth off".into());
        assert!(!err.is_transient());
    }
}
