//! SMB network share storage provider.

use async_trait::async_trait;
use futures::{stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use polystore_common::{join_logical, strip_name_prefix, Error, RelativePath, Result};

use crate::checksum::Md5Digest;
use crate::config::{SmbAddress, SmbConfig, SmbCredentials};
use crate::descriptor::StorageDescriptor;
use crate::filter::StorageFilter;
use crate::provider::{self, BackendKind, ByteStream, DescriptorStream, Listing, StorageProvider};
use crate::smb::session::SessionCache;
use crate::smb::share::{HeldHandle, OpenMode, SmbFileInfo, SmbHandle, SmbShare};

/// Native separator of share paths.
const SMB_SEPARATOR: char = '\\';

/// Everything a blocking call needs to reach the share.
#[derive(Clone)]
struct Target {
    name: String,
    address: SmbAddress,
    credentials: SmbCredentials,
    ttl: Duration,
    sessions: Arc<SessionCache>,
}

impl Target {
    fn share(&self) -> Result<Arc<dyn SmbShare>> {
        self.sessions
            .share(&self.name, &self.address, &self.credentials, self.ttl)
    }

    fn logical(&self, path: &RelativePath) -> String {
        join_logical(&self.name, &path.to_key())
    }

    fn describe(&self, path: &RelativePath, info: &SmbFileInfo) -> StorageDescriptor {
        let logical_path = self.logical(path);
        if info.is_directory {
            StorageDescriptor::directory(info.name.clone(), logical_path, info.timestamp())
        } else {
            StorageDescriptor::file(info.name.clone(), logical_path, info.timestamp(), info.size)
        }
    }
}

/// Storage provider over one SMB share.
///
/// Logical paths are `//<logical server>/<share>/<path>`. Connections go to
/// the physical server; the session is established on first use and shared
/// through the [`SessionCache`].
pub struct SmbProvider {
    target: Target,
    alias: String,
    read_chunk: usize,
}

impl SmbProvider {
    pub fn new(config: &SmbConfig, sessions: Arc<SessionCache>) -> Self {
        let address = config.address();
        let alias = format!(
            "//{}.{}/{}",
            address.logical_server, address.domain, address.share_name
        );

        Self {
            target: Target {
                name: config.name(),
                address,
                credentials: config.credentials(),
                ttl: config.session_ttl(),
                sessions,
            },
            alias,
            read_chunk: config.read_chunk.max(1),
        }
    }

    /// Share-relative path of a logical path.
    ///
    /// Accepts the share name or its domain-qualified alias.
    ///
    /// # Errors
    /// - `Configuration` if the path does not reach the share
    fn to_share_path(&self, logical: &str) -> Result<RelativePath> {
        let relative = strip_name_prefix(logical, &self.target.name)
            .or_else(|_| strip_name_prefix(logical, &self.alias))?;
        RelativePath::parse(&relative)
    }

    /// Run a blocking call against the cached share.
    ///
    /// A `Connection` failure means the session is gone, so it is dropped
    /// from the cache and the next call logs in again.
    async fn blocking<T, F>(&self, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Target, Arc<dyn SmbShare>) -> Result<T> + Send + 'static,
    {
        let target = self.target.clone();
        tokio::task::spawn_blocking(move || {
            let share = target.share()?;
            let result = call(&target, share);
            if let Err(Error::Connection { reason, .. }) = &result {
                warn!("Dropping session for {}: {}", target.name, reason);
                target.sessions.invalidate(&target.name);
            }
            result
        })
        .await
        .map_err(|e| Error::io(self.target.name.clone(), "TASK_ABORTED", e))?
    }

    /// One open/query/close round trip on a directory.
    async fn list_dir(&self, dir: RelativePath) -> Result<Listing<RelativePath>> {
        self.blocking(move |target, share| {
            let native = dir.to_native(SMB_SEPARATOR);
            let handle = SmbHandle::open(&share, &native, OpenMode::Directory)
                .map_err(|e| rename(e, target.logical(&dir)))?;
            let entries = handle.query_directory()?;

            let mut listing = Listing::default();
            for entry in entries.iter().filter(|e| !e.is_dot_entry()) {
                let child = dir.join(&entry.name)?;
                if entry.is_directory {
                    listing.directories.push(child);
                } else {
                    listing.files.push(target.describe(&child, entry));
                }
            }
            Ok(listing)
        })
        .await
    }
}

/// Report a share-level `NotFound` under the caller's logical path.
fn rename(err: Error, logical: String) -> Error {
    match err {
        Error::NotFound(_) => Error::NotFound(logical),
        other => other,
    }
}

type ReadState = Option<(HeldHandle, u64)>;

/// Read the next chunk; the handle is released once the file is exhausted,
/// a read fails or the stream is dropped.
async fn read_next(state: ReadState, chunk: usize) -> Result<Option<(Vec<u8>, ReadState)>> {
    let Some((mut handle, offset)) = state else {
        return Ok(None);
    };

    let data = match handle.run(move |open| open.read(offset, chunk)).await {
        Ok(data) => data,
        Err(e) => {
            handle.release().await;
            return Err(e);
        }
    };
    if data.is_empty() {
        handle.release().await;
        return Ok(None);
    }
    let next = offset + data.len() as u64;
    Ok(Some((data, Some((handle, next)))))
}

/// Stream `data` into the handle, returning the digest and byte count.
async fn write_chunks(handle: &mut HeldHandle, data: &mut ByteStream) -> Result<(String, u64)> {
    let mut digest = Md5Digest::new();
    let mut offset = 0u64;
    while let Some(chunk) = data.next().await {
        let chunk = chunk?;
        digest.update(&chunk);

        let len = chunk.len() as u64;
        handle.run(move |open| open.write_all(offset, &chunk)).await?;
        offset += len;
    }
    Ok((digest.finish(), offset))
}

#[async_trait]
impl StorageProvider for SmbProvider {
    fn name(&self) -> &str {
        &self.target.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Smb
    }

    fn enumerate<'a>(
        &'a self,
        root: &str,
        recursive: bool,
        filter: Option<&'a StorageFilter>,
    ) -> DescriptorStream<'a> {
        match self.to_share_path(root) {
            Ok(root) => {
                provider::depth_first(root, recursive, filter, move |dir| self.list_dir(dir))
            }
            Err(e) => provider::failed(e),
        }
    }

    async fn stat(&self, path: &str) -> Result<StorageDescriptor> {
        let relative = self.to_share_path(path)?;
        let logical = path.to_string();

        self.blocking(move |target, share| {
            let Some(parent) = relative.parent() else {
                let handle = SmbHandle::open(&share, "", OpenMode::Directory)?;
                let root = handle
                    .query_directory()?
                    .into_iter()
                    .find(|e| e.name == ".")
                    .ok_or_else(|| Error::NotFound(logical.clone()))?;
                let name = target.address.share_name.clone();
                return Ok(StorageDescriptor::directory(
                    name,
                    target.name.clone(),
                    root.timestamp(),
                ));
            };

            let name = relative.name().unwrap_or_default();
            let native = parent.to_native(SMB_SEPARATOR);
            let handle = SmbHandle::open(&share, &native, OpenMode::Directory)
                .map_err(|e| rename(e, logical.clone()))?;
            let entry = handle
                .query_directory()?
                .into_iter()
                .find(|e| !e.is_dot_entry() && e.name.eq_ignore_ascii_case(name))
                .ok_or_else(|| Error::NotFound(logical.clone()))?;
            Ok(target.describe(&relative, &entry))
        })
        .await
    }

    async fn read(&self, descriptor: &StorageDescriptor) -> Result<ByteStream> {
        if descriptor.is_directory() {
            return Err(Error::InvalidInput(format!(
                "Cannot read directory: {}",
                descriptor.logical_path
            )));
        }

        let relative = self.to_share_path(&descriptor.logical_path)?;
        let logical = descriptor.logical_path.clone();
        let handle = self
            .blocking(move |_, share| {
                SmbHandle::open(&share, &relative.to_native(SMB_SEPARATOR), OpenMode::Read)
                    .map(HeldHandle::new)
                    .map_err(|e| rename(e, logical))
            })
            .await?;

        let chunk = self.read_chunk;
        let stream = stream::try_unfold(Some((handle, 0u64)), move |state| {
            read_next(state, chunk)
        });
        Ok(Box::pin(stream))
    }

    async fn write(
        &self,
        path: &str,
        mut data: ByteStream,
        create_parent_directories: bool,
    ) -> Result<String> {
        let relative = self.to_share_path(path)?;
        let logical = path.to_string();

        let mut handle = self
            .blocking(move |target, share| {
                if create_parent_directories {
                    for ancestor in relative.ancestors() {
                        let native = ancestor.to_native(SMB_SEPARATOR);
                        SmbHandle::open(&share, &native, OpenMode::CreateDirectory)
                            .map_err(|e| rename(e, target.logical(&ancestor)))?;
                    }
                }
                SmbHandle::open(&share, &relative.to_native(SMB_SEPARATOR), OpenMode::Overwrite)
                    .map(HeldHandle::new)
                    .map_err(|e| rename(e, logical))
            })
            .await?;

        let written = write_chunks(&mut handle, &mut data).await;
        handle.release().await;
        let (checksum, size) = written?;

        debug!("Wrote {} bytes to {}", size, path);
        Ok(checksum)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let relative = self.to_share_path(path)?;
        let logical = path.to_string();

        self.blocking(move |_, share| {
            let native = relative.to_native(SMB_SEPARATOR);
            let handle = SmbHandle::open(&share, &native, OpenMode::Delete)
                .map_err(|e| rename(e, logical))?;
            handle.set_delete_pending()
        })
        .await
    }
}
