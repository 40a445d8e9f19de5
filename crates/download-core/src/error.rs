use crate::storage::StorageError;
use crate::transport::{FolderLocation, RemoteError, TransportError};
use thiserror::Error;

/// Why a download run ended without saving a file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("Transport rejected {operation} request: {source}")]
    TransportRejected {
        operation: &'static str,
        source: TransportError,
    },

    #[error("Remote {operation} failed: {source}")]
    RemoteOperationFailed {
        operation: &'static str,
        source: RemoteError,
    },

    #[error("Expected folder {expected}, device reported {actual}")]
    UnexpectedFolder {
        expected: FolderLocation,
        actual: FolderLocation,
    },

    #[error("Unexpected {callback} callback while {step}")]
    UnexpectedCallback {
        step: &'static str,
        callback: &'static str,
    },

    #[error("Requested {expected} but device returned {actual}")]
    UnexpectedItem { expected: String, actual: String },

    #[error("Retrieved file {name} has no contents")]
    MissingPayload { name: String },

    #[error("Saved folder is empty")]
    EmptyRemoteListing,

    #[error("Device connection dropped")]
    ConnectionLost,

    #[error("Transport binding lost")]
    TransportLost,

    #[error("Local storage error: {0}")]
    LocalPersistence(#[from] StorageError),

    #[error("Download cancelled")]
    Cancelled,
}

impl SyncError {
    /// Failures that only mean "nothing to do" and are logged as such.
    pub fn is_no_op(&self) -> bool {
        matches!(self, SyncError::EmptyRemoteListing)
    }
}
