//! Storage provider trait definition.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use polystore_common::Result;

use crate::checksum;
use crate::descriptor::StorageDescriptor;
use crate::filter::{self, StorageFilter};

/// Byte stream type for upload/download operations.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Lazy, single-pass sequence of descriptors produced by `enumerate`.
pub type DescriptorStream<'a> = BoxStream<'a, Result<StorageDescriptor>>;

/// Backend family a provider talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Local filesystem.
    Local,
    /// SMB network share.
    Smb,
    /// Azure blob container, flat or hierarchical.
    Blob,
    /// S3-compatible object store.
    ObjectStore,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Local => "local",
            Self::Smb => "smb",
            Self::Blob => "blob",
            Self::ObjectStore => "object_store",
        };
        f.write_str(label)
    }
}

/// Storage provider trait for different backends.
///
/// Every path argument is a logical path: the provider's [`name`] followed by
/// a separator and the backend-relative path. Providers translate it to their
/// native addressing and back, so descriptors they return can be passed
/// straight to `read` and `delete`.
///
/// [`name`]: StorageProvider::name
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Routing name, lower-cased (e.g. `s3://bucket`).
    fn name(&self) -> &str;

    /// Backend family.
    fn kind(&self) -> BackendKind;

    /// Enumerate files under `root`.
    ///
    /// With `recursive` the walk is depth-first, entries of a directory
    /// before its subdirectories. `filter` applies to files only; directories
    /// are never returned, only descended into. Dropping the stream early
    /// releases any handle or cursor it holds.
    fn enumerate<'a>(
        &'a self,
        root: &str,
        recursive: bool,
        filter: Option<&'a StorageFilter>,
    ) -> DescriptorStream<'a>;

    /// Get metadata for a path.
    ///
    /// # Errors
    /// - `NotFound` if neither an object nor a directory exists there
    async fn stat(&self, path: &str) -> Result<StorageDescriptor>;

    /// Open an object for sequential reading.
    ///
    /// # Errors
    /// - `NotFound` if the object vanished since it was described
    /// - `InvalidInput` for directory descriptors
    async fn read(&self, descriptor: &StorageDescriptor) -> Result<ByteStream>;

    /// Overwrite the object at `path` with `data`.
    ///
    /// # Postconditions
    /// - Any previous object at `path` is replaced
    /// - Missing parents are created first when `create_parent_directories`
    ///   is set and the backend has real directories
    ///
    /// # Returns
    /// Base64 MD5 of the bytes actually transmitted.
    async fn write(
        &self,
        path: &str,
        data: ByteStream,
        create_parent_directories: bool,
    ) -> Result<String>;

    /// Delete an object.
    ///
    /// Whether deleting a missing object fails depends on the backend.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Re-read the stored object and digest it.
    async fn compute_checksum(&self, path: &str) -> Result<String> {
        let descriptor = self.stat(path).await?;
        let stream = self.read(&descriptor).await?;
        checksum::digest_stream(stream).await
    }
}

/// A stream yielding a single buffer.
pub fn bytes_stream(data: Vec<u8>) -> ByteStream {
    Box::pin(stream::once(async move { Ok(data) }))
}

/// Drain a byte stream into memory.
pub async fn collect_bytes(mut stream: ByteStream) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    while let Some(chunk) = stream.next().await {
        data.extend_from_slice(&chunk?);
    }
    Ok(data)
}

/// A stream that fails immediately, for errors detected before any I/O.
pub(crate) fn failed<'a>(err: polystore_common::Error) -> DescriptorStream<'a> {
    stream::once(async move { Err(err) }).boxed()
}

/// Files and subdirectories found by one directory round trip.
pub(crate) struct Listing<D> {
    pub files: Vec<StorageDescriptor>,
    pub directories: Vec<D>,
}

impl<D> Default for Listing<D> {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            directories: Vec::new(),
        }
    }
}

struct Walk<'a, D, F> {
    stack: Vec<D>,
    pending: VecDeque<StorageDescriptor>,
    recursive: bool,
    filter: Option<&'a StorageFilter>,
    list: F,
}

/// Depth-first walk over backends with real (or delimiter-emulated)
/// directories.
///
/// `list` performs exactly one directory round trip per call. The next
/// directory is only listed once every file of the previous one has been
/// consumed, so the caller paces the backend.
pub(crate) fn depth_first<'a, D, F, Fut>(
    root: D,
    recursive: bool,
    filter: Option<&'a StorageFilter>,
    list: F,
) -> DescriptorStream<'a>
where
    D: Send + 'a,
    F: Fn(D) -> Fut + Send + 'a,
    Fut: Future<Output = Result<Listing<D>>> + Send + 'a,
{
    let walk = Walk {
        stack: vec![root],
        pending: VecDeque::new(),
        recursive,
        filter,
        list,
    };

    stream::try_unfold(walk, step).boxed()
}

/// Produce the next matching file, listing directories as needed.
async fn step<'a, D, F, Fut>(
    mut walk: Walk<'a, D, F>,
) -> Result<Option<(StorageDescriptor, Walk<'a, D, F>)>>
where
    F: Fn(D) -> Fut,
    Fut: Future<Output = Result<Listing<D>>>,
{
    loop {
        if let Some(descriptor) = walk.pending.pop_front() {
            if filter::matches(walk.filter, &descriptor) {
                return Ok(Some((descriptor, walk)));
            }
            continue;
        }

        let Some(directory) = walk.stack.pop() else {
            return Ok(None);
        };

        let listing = (walk.list)(directory).await?;
        walk.pending.extend(listing.files);
        if walk.recursive {
            walk.stack.extend(listing.directories.into_iter().rev());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures::TryStreamExt;
    use std::collections::HashMap;

    fn tree() -> HashMap<&'static str, (Vec<&'static str>, Vec<&'static str>)> {
        HashMap::from([
            ("a", (vec!["a/1.txt", "a/2.csv"], vec!["a/b", "a/c"])),
            ("a/b", (vec!["a/b/3.txt"], vec!["a/b/d"])),
            ("a/b/d", (vec!["a/b/d/4.txt"], vec![])),
            ("a/c", (vec!["a/c/5.txt"], vec![])),
        ])
    }

    fn walk<'a>(
        recursive: bool,
        filter: Option<&'a StorageFilter>,
    ) -> DescriptorStream<'a> {
        let tree = tree();
        depth_first("a", recursive, filter, move |dir: &'static str| {
            let (files, dirs) = tree.get(dir).cloned().unwrap_or_default();
            async move {
                Ok(Listing {
                    files: files
                        .into_iter()
                        .map(|p| StorageDescriptor::file(p, p, Utc::now(), 1))
                        .collect(),
                    directories: dirs,
                })
            }
        })
    }

    #[tokio::test]
    async fn test_depth_first_order() {
        let paths: Vec<String> = walk(true, None)
            .map_ok(|d| d.logical_path)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(
            paths,
            vec!["a/1.txt", "a/2.csv", "a/b/3.txt", "a/b/d/4.txt", "a/c/5.txt"]
        );
    }

    #[tokio::test]
    async fn test_non_recursive_lists_one_level() {
        let paths: Vec<String> = walk(false, None)
            .map_ok(|d| d.logical_path)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(paths, vec!["a/1.txt", "a/2.csv"]);
    }

    #[tokio::test]
    async fn test_filter_applies_to_files_not_traversal() {
        let filter = StorageFilter::with_extensions([".txt"]);
        let paths: Vec<String> = walk(true, Some(&filter))
            .map_ok(|d| d.logical_path)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(paths, vec!["a/1.txt", "a/b/3.txt", "a/b/d/4.txt", "a/c/5.txt"]);
    }

    #[tokio::test]
    async fn test_error_ends_the_walk() {
        let mut stream = depth_first("x", true, None, |_dir: &'static str| async {
            Err::<Listing<&'static str>, _>(polystore_common::Error::NotFound("x".into()))
        });
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }
}
