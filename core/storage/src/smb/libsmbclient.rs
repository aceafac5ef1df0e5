//! SMB shares over libsmbclient, through the `pavao` bindings.
//!
//! libsmbclient has no handle-level API that outlives a borrow of the client,
//! so a handle here is a path plus its open mode. Every read or write opens
//! the file, seeks and closes it again; delete-pending files are unlinked when
//! their handle closes.

use chrono::{DateTime, Utc};
use pavao::{
    SmbClient, SmbCredentials as PavaoCredentials, SmbDirentType, SmbError, SmbMode,
    SmbOpenOptions, SmbOptions,
};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;
use tracing::{debug, info};

use polystore_common::{Error, Result};

use crate::config::{SmbAddress, SmbCredentials};
use crate::smb::share::{HandleId, OpenMode, SmbConnector, SmbFileInfo, SmbShare};

/// Mode bits for directories created on the share.
const DIRECTORY_MODE: u32 = 0o755;

/// Connector that logs in with libsmbclient.
#[derive(Debug, Default)]
pub struct PavaoConnector;

impl PavaoConnector {
    pub fn new() -> Self {
        Self
    }
}

impl SmbConnector for PavaoConnector {
    fn connect(
        &self,
        address: &SmbAddress,
        credentials: &SmbCredentials,
    ) -> Result<Arc<dyn SmbShare>> {
        let target = format!("//{}/{}", address.physical_server, address.share_name);
        info!("Tree connect to {}", target);

        let client = SmbClient::new(
            PavaoCredentials::default()
                .server(format!("smb://{}", address.physical_server))
                .share(format!("/{}", address.share_name))
                .username(credentials.username.clone())
                .password(credentials.password.expose().to_string())
                .workgroup(credentials.domain.clone()),
            SmbOptions::default()
                .case_sensitive(false)
                .one_share_per_server(true),
        )
        .map_err(|e| Error::connection(target.as_str(), e))?;

        // The context is lazy; listing the root proves the login.
        client
            .list_dir("/")
            .map_err(|e| Error::connection(target.as_str(), e))?;

        Ok(Arc::new(PavaoShare {
            client: Mutex::new(client),
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }))
    }
}

struct OpenHandle {
    path: String,
    mode: OpenMode,
    delete_pending: bool,
}

/// A share reached through one libsmbclient context.
pub struct PavaoShare {
    client: Mutex<SmbClient>,
    handles: Mutex<HashMap<HandleId, OpenHandle>>,
    next_handle: AtomicU64,
}

/// libsmbclient path of a share-relative path: `/` separated and rooted.
fn client_path(path: &str) -> String {
    let joined = path
        .split(['\\', '/'])
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    format!("/{}", joined)
}

fn to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

/// Map a client failure, reporting a missing object as `NotFound`.
fn map_error(path: &str, err: SmbError) -> Error {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&err);
    while let Some(current) = source {
        if let Some(io) = current.downcast_ref::<std::io::Error>() {
            match io.kind() {
                ErrorKind::NotFound => return Error::NotFound(path.to_string()),
                ErrorKind::PermissionDenied => {
                    return Error::io(path, "STATUS_ACCESS_DENIED", io)
                }
                _ => {}
            }
        }
        source = current.source();
    }
    Error::io(path, "SMB", err)
}

impl PavaoShare {
    fn client(&self) -> std::sync::MutexGuard<'_, SmbClient> {
        self.client.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, handle: HandleId) -> Result<(String, OpenMode)> {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle)
            .map(|h| (h.path.clone(), h.mode))
            .ok_or_else(|| {
                Error::io(format!("handle {}", handle), "STATUS_INVALID_HANDLE", "unknown handle")
            })
    }

    fn is_directory(client: &SmbClient, path: &str) -> bool {
        client.list_dir(path).is_ok()
    }

    fn info(
        client: &SmbClient,
        path: &str,
        name: &str,
        is_directory: bool,
    ) -> Result<SmbFileInfo> {
        let stat = client.stat(path).map_err(|e| map_error(path, e))?;
        Ok(SmbFileInfo {
            name: name.to_string(),
            is_directory,
            size: if is_directory { 0 } else { stat.size },
            last_write: to_utc(stat.modified),
            created: to_utc(stat.created),
        })
    }
}

impl SmbShare for PavaoShare {
    fn open(&self, path: &str, mode: OpenMode) -> Result<HandleId> {
        let target = client_path(path);
        let client = self.client();

        match mode {
            OpenMode::Directory => {
                client.stat(&target).map_err(|e| map_error(path, e))?;
                if !Self::is_directory(&client, &target) {
                    return Err(Error::io(path, "STATUS_NOT_A_DIRECTORY", "not a directory"));
                }
            }
            OpenMode::Read | OpenMode::Delete => {
                client.stat(&target).map_err(|e| map_error(path, e))?;
                if Self::is_directory(&client, &target) {
                    return Err(Error::io(path, "STATUS_FILE_IS_A_DIRECTORY", "is a directory"));
                }
            }
            OpenMode::Overwrite => {
                let options = SmbOpenOptions::default().create(true).write(true).truncate(true);
                client
                    .open_with(&target, options)
                    .map_err(|e| map_error(path, e))?;
            }
            OpenMode::CreateDirectory => match client.stat(&target) {
                Ok(_) if Self::is_directory(&client, &target) => {}
                Ok(_) => {
                    return Err(Error::io(path, "STATUS_OBJECT_NAME_COLLISION", "file exists"));
                }
                Err(_) => {
                    debug!("Creating directory {}", target);
                    client
                        .mkdir(&target, SmbMode::from(DIRECTORY_MODE))
                        .map_err(|e| map_error(path, e))?;
                }
            },
        }

        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                OpenHandle {
                    path: target,
                    mode,
                    delete_pending: false,
                },
            );
        Ok(id)
    }

    fn query_directory(&self, handle: HandleId) -> Result<Vec<SmbFileInfo>> {
        let (path, mode) = self.handle(handle)?;
        if mode != OpenMode::Directory {
            return Err(Error::io(path, "STATUS_INVALID_PARAMETER", "not a directory handle"));
        }

        let client = self.client();
        let dot = Self::info(&client, &path, ".", true)?;
        let mut dot_dot = dot.clone();
        dot_dot.name = "..".to_string();
        let mut entries = vec![dot, dot_dot];

        let listing = client.list_dir(&path).map_err(|e| map_error(&path, e))?;
        for entry in listing {
            let is_directory = match entry.get_type() {
                SmbDirentType::Dir => true,
                SmbDirentType::File | SmbDirentType::Link => false,
                _ => continue,
            };
            let name = entry.name();
            if name == "." || name == ".." {
                continue;
            }
            let child = format!("{}/{}", path.trim_end_matches('/'), name);
            entries.push(Self::info(&client, &child, name, is_directory)?);
        }
        Ok(entries)
    }

    fn read(&self, handle: HandleId, offset: u64, length: usize) -> Result<Vec<u8>> {
        let (path, _) = self.handle(handle)?;
        let client = self.client();
        let mut file = client
            .open_with(&path, SmbOpenOptions::default().read(true))
            .map_err(|e| map_error(&path, e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Error::from_io(path.as_str(), e))?;

        let mut buffer = vec![0u8; length];
        let mut filled = 0;
        while filled < length {
            let read = file
                .read(&mut buffer[filled..])
                .map_err(|e| Error::from_io(path.as_str(), e))?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    fn write(&self, handle: HandleId, offset: u64, data: &[u8]) -> Result<usize> {
        let (path, mode) = self.handle(handle)?;
        if mode != OpenMode::Overwrite {
            return Err(Error::io(path, "STATUS_ACCESS_DENIED", "handle not open for writing"));
        }

        let client = self.client();
        let mut file = client
            .open_with(&path, SmbOpenOptions::default().write(true))
            .map_err(|e| map_error(&path, e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Error::from_io(path.as_str(), e))?;
        file.write_all(data).map_err(|e| Error::from_io(path.as_str(), e))?;
        Ok(data.len())
    }

    fn set_delete_pending(&self, handle: HandleId) -> Result<()> {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        let open = handles.get_mut(&handle).ok_or_else(|| {
            Error::io(format!("handle {}", handle), "STATUS_INVALID_HANDLE", "unknown handle")
        })?;
        if open.mode != OpenMode::Delete {
            return Err(Error::io(
                open.path.clone(),
                "STATUS_ACCESS_DENIED",
                "handle not open for delete",
            ));
        }
        open.delete_pending = true;
        Ok(())
    }

    fn close(&self, handle: HandleId) -> Result<()> {
        let open = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle);

        match open {
            Some(open) if open.delete_pending => self
                .client()
                .unlink(&open.path)
                .map_err(|e| map_error(&open.path, e)),
            Some(_) => Ok(()),
            None => Err(Error::io(
                format!("handle {}", handle),
                "STATUS_INVALID_HANDLE",
                "unknown handle",
            )),
        }
    }
}
