use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during durable buffer operations
#[derive(Error, Debug)]
pub enum BufferError {
    /// A filesystem operation failed
    #[error("I/O error during {op} on {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The manifest exists on disk but could not be decoded.
    /// Pending messages may exist, so the buffer refuses to start empty.
    #[error("Manifest corrupted: path={}, reason={reason}", .path.display())]
    ManifestCorrupt { path: PathBuf, reason: String },

    /// Serialization error while encoding the manifest
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Node id cannot be used as a file name component
    #[error("Invalid node id: {0:?}")]
    InvalidNodeId(String),

    /// Timeout waiting for data
    #[error("Timeout waiting for data after {0:?}")]
    Timeout(Duration),

    /// A task on the blocking pool panicked or was cancelled
    #[error("Blocking task failed: {0}")]
    TaskFailed(String),

    /// Other storage layer error
    #[error("Storage error: {0}")]
    StorageError(#[from] anyhow::Error),
}

impl BufferError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BufferError::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// Returns true if the underlying file did not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BufferError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }

    /// Returns true if this error is temporary and a retry may succeed
    pub fn is_temporary(&self) -> bool {
        matches!(self, BufferError::Timeout(_))
    }

    /// Returns true if this error indicates corrupted persistent state
    pub fn is_corruption(&self) -> bool {
        matches!(self, BufferError::ManifestCorrupt { .. })
    }
}

pub type Result<T> = std::result::Result<T, BufferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let missing = BufferError::io(
            "read",
            "/tmp/nope",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(missing.is_not_found());
        assert!(!missing.is_temporary());

        let denied = BufferError::io(
            "write",
            "/tmp/nope",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(!denied.is_not_found());

        let timeout = BufferError::Timeout(Duration::from_secs(5));
        assert!(timeout.is_temporary());
        assert!(!timeout.is_corruption());

        let corrupt = BufferError::ManifestCorrupt {
            path: PathBuf::from("/tmp/manifest-a"),
            reason: "EOF".to_string(),
        };
        assert!(corrupt.is_corruption());
        assert!(corrupt.to_string().contains("manifest-a"));
    }
}
