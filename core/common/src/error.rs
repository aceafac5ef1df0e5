//! Common error types for polystore.

use thiserror::Error;

/// Top-level error type for storage operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No object or directory exists at the given path.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Session setup or authentication against a remote backend failed.
    #[error("Connection to '{target}' failed: {reason}")]
    Connection { target: String, reason: String },

    /// A native read, write, list or delete call failed.
    ///
    /// `status` carries the backend's own status code or error kind.
    #[error("I/O failure on '{path}' ({status}): {reason}")]
    Io {
        path: String,
        status: String,
        reason: String,
    },

    /// Post-write verification found a different digest than was written.
    #[error("Checksum mismatch for '{path}': wrote {expected}, stored {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// Unknown backend kind, malformed path or invalid filter.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Build an [`Error::Io`] from a path, a backend status and a message.
    pub fn io(
        path: impl Into<String>,
        status: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self::Io {
            path: path.into(),
            status: status.into(),
            reason: reason.to_string(),
        }
    }

    /// Build an [`Error::Connection`].
    pub fn connection(target: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Connection {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// Map a `std::io::Error` raised while touching `path`.
    pub fn from_io(path: impl Into<String>, err: std::io::Error) -> Self {
        let path = path.into();
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path),
            kind => Self::io(path, format!("{:?}", kind), err),
        }
    }

    /// Whether this error reports a missing object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::from_io("<unknown>", err)
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let err = Error::from_io(
            "root/a.txt",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn test_io_error_keeps_status() {
        let err = Error::from_io(
            "root/a.txt",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope"),
        );
        match err {
            Error::Io { path, status, .. } => {
                assert_eq!(path, "root/a.txt");
                assert_eq!(status, "PermissionDenied");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
