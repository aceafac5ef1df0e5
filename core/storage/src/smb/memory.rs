//! In-memory SMB share for testing.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use polystore_common::{Error, Result};

use crate::config::{SmbAddress, SmbCredentials};
use crate::smb::share::{HandleId, OpenMode, SmbConnector, SmbFileInfo, SmbShare};

#[derive(Debug, Clone)]
enum Node {
    File {
        name: String,
        data: Vec<u8>,
        created: DateTime<Utc>,
        modified: DateTime<Utc>,
    },
    Directory {
        name: String,
        created: DateTime<Utc>,
    },
}

impl Node {
    fn info(&self) -> SmbFileInfo {
        match self {
            Node::File {
                name,
                data,
                created,
                modified,
            } => SmbFileInfo {
                name: name.clone(),
                is_directory: false,
                size: data.len() as u64,
                last_write: *modified,
                created: *created,
            },
            Node::Directory { name, created } => SmbFileInfo {
                name: name.clone(),
                is_directory: true,
                size: 0,
                last_write: *created,
                created: *created,
            },
        }
    }
}

struct OpenHandle {
    key: String,
    mode: OpenMode,
    delete_pending: bool,
}

/// Case-insensitive lookup key of a share path.
fn key_of(path: &str) -> String {
    path.split(['\\', '/'])
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\\")
        .to_lowercase()
}

fn parent_key(key: &str) -> Option<&str> {
    if key.is_empty() {
        return None;
    }
    Some(key.rfind('\\').map_or("", |index| &key[..index]))
}

fn last_segment(path: &str) -> String {
    path.split(['\\', '/'])
        .filter(|s| !s.is_empty())
        .last()
        .unwrap_or_default()
        .to_string()
}

/// In-memory share.
///
/// Behaves like a case-insensitive NTFS share: directory queries include
/// `.` and `..`, files marked delete-pending vanish when their handle
/// closes, and handles are tracked so tests can check they were released.
pub struct MemoryShare {
    nodes: RwLock<BTreeMap<String, Node>>,
    handles: Mutex<HashMap<HandleId, OpenHandle>>,
    next_handle: AtomicU64,
}

impl MemoryShare {
    /// Create an empty share holding only its root directory.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            String::new(),
            Node::Directory {
                name: String::new(),
                created: Utc::now(),
            },
        );

        Self {
            nodes: RwLock::new(nodes),
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Number of handles currently open.
    pub fn open_handles(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Contents of a file, bypassing handles.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.read().unwrap_or_else(PoisonError::into_inner).get(&key_of(path)) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    /// Replace a file's contents out of band.
    pub fn tamper(&self, path: &str, data: Vec<u8>) {
        if let Some(Node::File { data: stored, .. }) = self
            .nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&key_of(path))
        {
            *stored = data;
        }
    }

    fn handle(&self, handle: HandleId) -> Result<(String, OpenMode)> {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle)
            .map(|h| (h.key.clone(), h.mode))
            .ok_or_else(|| invalid_handle(handle))
    }

    fn require_parent(nodes: &BTreeMap<String, Node>, path: &str, key: &str) -> Result<()> {
        match parent_key(key).and_then(|parent| nodes.get(parent)) {
            Some(Node::Directory { .. }) => Ok(()),
            _ => Err(Error::NotFound(format!(
                "STATUS_OBJECT_PATH_NOT_FOUND: {}",
                path
            ))),
        }
    }
}

impl Default for MemoryShare {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid_handle(handle: HandleId) -> Error {
    Error::io(format!("handle {}", handle), "STATUS_INVALID_HANDLE", "unknown handle")
}

impl SmbShare for MemoryShare {
    fn open(&self, path: &str, mode: OpenMode) -> Result<HandleId> {
        let key = key_of(path);
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);

        match (mode, nodes.get(&key)) {
            (OpenMode::Directory, Some(Node::Directory { .. }))
            | (OpenMode::CreateDirectory, Some(Node::Directory { .. }))
            | (OpenMode::Read, Some(Node::File { .. }))
            | (OpenMode::Delete, Some(Node::File { .. })) => {}
            (OpenMode::Directory | OpenMode::Read | OpenMode::Delete, None) => {
                return Err(Error::NotFound(format!(
                    "STATUS_OBJECT_NAME_NOT_FOUND: {}",
                    path
                )));
            }
            (OpenMode::Directory, Some(Node::File { .. })) => {
                return Err(Error::io(path, "STATUS_NOT_A_DIRECTORY", "not a directory"));
            }
            (
                OpenMode::Read | OpenMode::Delete | OpenMode::Overwrite,
                Some(Node::Directory { .. }),
            ) => {
                return Err(Error::io(path, "STATUS_FILE_IS_A_DIRECTORY", "is a directory"));
            }
            (OpenMode::CreateDirectory, Some(Node::File { .. })) => {
                return Err(Error::io(path, "STATUS_OBJECT_NAME_COLLISION", "file exists"));
            }
            (OpenMode::CreateDirectory, None) => {
                Self::require_parent(&nodes, path, &key)?;
                nodes.insert(
                    key.clone(),
                    Node::Directory {
                        name: last_segment(path),
                        created: Utc::now(),
                    },
                );
            }
            (OpenMode::Overwrite, existing) => {
                Self::require_parent(&nodes, path, &key)?;
                let now = Utc::now();
                let created = match existing {
                    Some(Node::File { created, .. }) => *created,
                    _ => now,
                };
                nodes.insert(
                    key.clone(),
                    Node::File {
                        name: last_segment(path),
                        data: Vec::new(),
                        created,
                        modified: now,
                    },
                );
            }
        }

        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                OpenHandle {
                    key,
                    mode,
                    delete_pending: false,
                },
            );
        Ok(id)
    }

    fn query_directory(&self, handle: HandleId) -> Result<Vec<SmbFileInfo>> {
        let (key, mode) = self.handle(handle)?;
        if mode != OpenMode::Directory {
            return Err(Error::io(key, "STATUS_INVALID_PARAMETER", "not a directory handle"));
        }

        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        let dir = nodes.get(&key).ok_or_else(|| Error::NotFound(key.clone()))?;

        let mut dot = dir.info();
        dot.name = ".".to_string();
        let mut dot_dot = dot.clone();
        dot_dot.name = "..".to_string();

        let mut entries = vec![dot, dot_dot];
        entries.extend(
            nodes
                .iter()
                .filter(|(child, _)| parent_key(child) == Some(key.as_str()))
                .map(|(_, node)| node.info()),
        );
        Ok(entries)
    }

    fn read(&self, handle: HandleId, offset: u64, length: usize) -> Result<Vec<u8>> {
        let (key, _) = self.handle(handle)?;
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        match nodes.get(&key) {
            Some(Node::File { data, .. }) => {
                let start = (offset as usize).min(data.len());
                let end = start.saturating_add(length).min(data.len());
                Ok(data[start..end].to_vec())
            }
            _ => Err(Error::NotFound(key)),
        }
    }

    fn write(&self, handle: HandleId, offset: u64, data: &[u8]) -> Result<usize> {
        let (key, mode) = self.handle(handle)?;
        if mode != OpenMode::Overwrite {
            return Err(Error::io(key, "STATUS_ACCESS_DENIED", "handle not open for writing"));
        }

        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        match nodes.get_mut(&key) {
            Some(Node::File {
                data: stored,
                modified,
                ..
            }) => {
                let offset = offset as usize;
                if stored.len() < offset + data.len() {
                    stored.resize(offset + data.len(), 0);
                }
                stored[offset..offset + data.len()].copy_from_slice(data);
                *modified = Utc::now();
                Ok(data.len())
            }
            _ => Err(Error::NotFound(key)),
        }
    }

    fn set_delete_pending(&self, handle: HandleId) -> Result<()> {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        let open = handles.get_mut(&handle).ok_or_else(|| invalid_handle(handle))?;
        if open.mode != OpenMode::Delete {
            return Err(Error::io(
                open.key.clone(),
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
            .remove(&handle)
            .ok_or_else(|| invalid_handle(handle))?;

        if open.delete_pending {
            self.nodes
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&open.key);
        }
        Ok(())
    }
}

/// Connector handing out [`MemoryShare`]s by share name.
///
/// Records the physical server of every login.
pub struct MemoryConnector {
    shares: Mutex<HashMap<String, Arc<MemoryShare>>>,
    connections: Mutex<Vec<String>>,
    password: Option<String>,
}

impl MemoryConnector {
    /// Connector accepting any credentials.
    pub fn new() -> Self {
        Self {
            shares: Mutex::new(HashMap::new()),
            connections: Mutex::new(Vec::new()),
            password: None,
        }
    }

    /// Connector rejecting every password but `password`.
    pub fn with_password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            ..Self::new()
        }
    }

    /// The share with this name, created on first use.
    pub fn share(&self, share_name: &str) -> Arc<MemoryShare> {
        self.shares
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(share_name.to_lowercase())
            .or_insert_with(|| Arc::new(MemoryShare::new()))
            .clone()
    }

    /// Physical servers logged into, in order.
    pub fn connections(&self) -> Vec<String> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl SmbConnector for MemoryConnector {
    fn connect(
        &self,
        address: &SmbAddress,
        credentials: &SmbCredentials,
    ) -> Result<Arc<dyn SmbShare>> {
        if let Some(expected) = &self.password {
            if credentials.password.expose() != expected {
                return Err(Error::connection(
                    format!("//{}/{}", address.physical_server, address.share_name),
                    "STATUS_LOGON_FAILURE",
                ));
            }
        }

        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(address.physical_server.clone());
        let share: Arc<dyn SmbShare> = self.share(&address.share_name);
        Ok(share)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overwrite_requires_parent() {
        let share = MemoryShare::new();
        let err = share.open(r"missing\a.txt", OpenMode::Overwrite).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_query_directory_lists_dots_and_children() {
        let share = MemoryShare::new();
        let dir = share.open("Docs", OpenMode::CreateDirectory).unwrap();
        share.close(dir).unwrap();
        let file = share.open(r"Docs\A.txt", OpenMode::Overwrite).unwrap();
        share.write(file, 0, b"hello").unwrap();
        share.close(file).unwrap();

        let handle = share.open("docs", OpenMode::Directory).unwrap();
        let names: Vec<String> = share
            .query_directory(handle)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        share.close(handle).unwrap();

        assert_eq!(names, vec![".", "..", "A.txt"]);
        assert_eq!(share.contents(r"DOCS\a.txt").unwrap(), b"hello");
        assert_eq!(share.open_handles(), 0);
    }

    #[test]
    fn test_delete_pending_removes_on_close() {
        let share = MemoryShare::new();
        let file = share.open("a.txt", OpenMode::Overwrite).unwrap();
        share.close(file).unwrap();

        let handle = share.open("a.txt", OpenMode::Delete).unwrap();
        share.set_delete_pending(handle).unwrap();
        assert!(share.contents("a.txt").is_some());
        share.close(handle).unwrap();
        assert!(share.contents("a.txt").is_none());
    }
}
