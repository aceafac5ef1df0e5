//! Handle-based SMB primitives.
//!
//! The wire protocol lives in a vendor client; these traits are the calls the
//! provider issues against it. Every call is blocking and is only ever made
//! from `spawn_blocking`, including the close issued when a handle drops: a
//! handle that outlives a blocking task is held in a [`HeldHandle`].

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

use polystore_common::{Error, Result};

use crate::config::{SmbAddress, SmbCredentials};

/// Server-assigned file id.
pub type HandleId = u64;

/// Disposition and access requested when opening a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open an existing directory for listing.
    Directory,
    /// Open an existing file for reading.
    Read,
    /// Create or truncate a file for writing.
    Overwrite,
    /// Open a directory, creating it when missing.
    CreateDirectory,
    /// Open an existing file so it can be marked for deletion.
    Delete,
}

/// One entry of a directory query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmbFileInfo {
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
    pub last_write: DateTime<Utc>,
    pub created: DateTime<Utc>,
}

impl SmbFileInfo {
    /// Later of the last-write and creation times.
    ///
    /// Copies onto a share keep the source's write time but get a fresh
    /// creation time.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.last_write.max(self.created)
    }

    /// Whether this is the `.` or `..` pseudo entry.
    pub fn is_dot_entry(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}

/// A tree-connected share.
///
/// Paths are share-relative with `\` separators; the empty string is the
/// share root.
pub trait SmbShare: Send + Sync {
    /// CreateFile with the disposition implied by `mode`.
    fn open(&self, path: &str, mode: OpenMode) -> Result<HandleId>;

    /// QueryDirectory on a handle opened with [`OpenMode::Directory`].
    fn query_directory(&self, handle: HandleId) -> Result<Vec<SmbFileInfo>>;

    /// ReadFile; an empty buffer means end of file.
    fn read(&self, handle: HandleId, offset: u64, length: usize) -> Result<Vec<u8>>;

    /// WriteFile; returns the number of bytes accepted.
    fn write(&self, handle: HandleId, offset: u64, data: &[u8]) -> Result<usize>;

    /// Mark the file to be removed when its handle closes.
    fn set_delete_pending(&self, handle: HandleId) -> Result<()>;

    fn close(&self, handle: HandleId) -> Result<()>;
}

/// Session setup and tree connect against a physical server.
pub trait SmbConnector: Send + Sync {
    /// # Errors
    /// - `Connection` if the server is unreachable or rejects the login
    fn connect(
        &self,
        address: &SmbAddress,
        credentials: &SmbCredentials,
    ) -> Result<Arc<dyn SmbShare>>;
}

/// An open handle, closed when dropped.
pub struct SmbHandle {
    share: Arc<dyn SmbShare>,
    id: HandleId,
    path: String,
}

impl SmbHandle {
    pub fn open(share: &Arc<dyn SmbShare>, path: &str, mode: OpenMode) -> Result<Self> {
        let id = share.open(path, mode)?;
        Ok(Self {
            share: share.clone(),
            id,
            path: path.to_string(),
        })
    }

    pub fn query_directory(&self) -> Result<Vec<SmbFileInfo>> {
        self.share.query_directory(self.id)
    }

    pub fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        self.share.read(self.id, offset, length)
    }

    /// Write all of `data` at `offset`, issuing as many calls as needed.
    pub fn write_all(&self, mut offset: u64, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let written = self.share.write(self.id, offset, data)?;
            if written == 0 {
                return Err(Error::io(
                    self.path.clone(),
                    "STATUS_DISK_FULL",
                    "write accepted no bytes",
                ));
            }
            offset += written as u64;
            data = &data[written..];
        }
        Ok(())
    }

    pub fn set_delete_pending(&self) -> Result<()> {
        self.share.set_delete_pending(self.id)
    }
}

impl Drop for SmbHandle {
    fn drop(&mut self) {
        if let Err(e) = self.share.close(self.id) {
            debug!("Failed to close handle for '{}': {}", self.path, e);
        }
    }
}

/// A handle kept across awaits by a stream or a chunked write.
///
/// Calls run on the blocking pool through [`HeldHandle::run`]. Dropping it
/// hands the close to the blocking pool instead of closing inline.
pub struct HeldHandle {
    handle: Option<SmbHandle>,
    path: String,
}

impl HeldHandle {
    pub fn new(handle: SmbHandle) -> Self {
        let path = handle.path.clone();
        Self {
            handle: Some(handle),
            path,
        }
    }

    /// Run `call` against the handle on the blocking pool.
    ///
    /// The handle travels with the task. If this future is dropped midway,
    /// the handle stays wrapped and still closes off the async thread.
    pub async fn run<T, F>(&mut self, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SmbHandle) -> Result<T> + Send + 'static,
    {
        let handle = self.handle.take().ok_or_else(|| {
            Error::io(self.path.clone(), "STATUS_INVALID_HANDLE", "handle already released")
        })?;

        let (held, result) = tokio::task::spawn_blocking(move || {
            let result = call(&handle);
            (HeldHandle::new(handle), result)
        })
        .await
        .map_err(|e| Error::io(self.path.clone(), "TASK_ABORTED", e))?;

        *self = held;
        result
    }

    /// Close on the blocking pool and wait for it.
    pub async fn release(mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let Err(e) = tokio::task::spawn_blocking(move || drop(handle)).await {
            debug!("Close of '{}' did not complete: {}", self.path, e);
        }
    }
}

impl Drop for HeldHandle {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || drop(handle));
            }
            // No runtime left to hand off to.
            Err(_) => drop(handle),
        }
    }
}
