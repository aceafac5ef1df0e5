//! Storage descriptor: the metadata record every backend produces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// MIME type reported when the extension is unknown.
pub const UNKNOWN_MIME_TYPE: &str = "application/octet-stream";

/// Metadata for one stored object or directory.
///
/// Descriptors are produced fresh by `enumerate` and `stat` and are never
/// mutated afterwards. `logical_path` always starts with the name of the
/// facade that produced it, so it can be handed back to `read` or `delete`
/// on the same facade or on a combo facade holding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDescriptor {
    /// Base name of the object, without separators.
    pub name: String,
    /// Fully-qualified logical address.
    pub logical_path: String,
    /// Last modification time.
    pub timestamp: DateTime<Utc>,
    /// Whether this is a file (otherwise a directory).
    pub is_file: bool,
    /// Size in bytes (0 for directories).
    pub size_bytes: u64,
}

impl StorageDescriptor {
    /// Create a file descriptor.
    pub fn file(
        name: impl Into<String>,
        logical_path: impl Into<String>,
        timestamp: DateTime<Utc>,
        size_bytes: u64,
    ) -> Self {
        Self {
            name: name.into(),
            logical_path: logical_path.into(),
            timestamp,
            is_file: true,
            size_bytes,
        }
    }

    /// Create a directory descriptor.
    pub fn directory(
        name: impl Into<String>,
        logical_path: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            logical_path: logical_path.into(),
            timestamp,
            is_file: false,
            size_bytes: 0,
        }
    }

    /// Whether this is a directory.
    pub fn is_directory(&self) -> bool {
        !self.is_file
    }

    /// Text after the last `.` of the name, or the whole name if it has none.
    pub fn extension(&self) -> &str {
        match self.name.rfind('.') {
            Some(index) => &self.name[index + 1..],
            None => &self.name,
        }
    }

    /// MIME type derived from the extension.
    pub fn mime_type(&self) -> String {
        mime_guess::from_ext(self.extension())
            .first_raw()
            .unwrap_or(UNKNOWN_MIME_TYPE)
            .to_string()
    }
}

impl fmt::Display for StorageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.logical_path,
            self.is_file,
            self.timestamp.to_rfc3339(),
            self.mime_type(),
            self.size_bytes
        )
    }
}
