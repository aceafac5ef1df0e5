//! Local filesystem storage provider.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

use polystore_common::{fold_case, join_logical, strip_name_prefix, Error, RelativePath, Result};

use crate::checksum::Md5Digest;
use crate::config::{LocalConfig, LOCAL_STORE_NAME};
use crate::descriptor::StorageDescriptor;
use crate::filter::StorageFilter;
use crate::provider::{self, BackendKind, ByteStream, DescriptorStream, Listing, StorageProvider};

/// Local filesystem storage provider.
///
/// An unrooted provider addresses plain OS paths and is named `local`. A
/// rooted provider has its own name and resolves `<name>/<relative>` under
/// its root directory.
pub struct LocalProvider {
    name: String,
    root: Option<PathBuf>,
}

impl LocalProvider {
    /// Provider over the whole filesystem; logical paths are OS paths.
    pub fn unrooted() -> Self {
        Self {
            name: LOCAL_STORE_NAME.to_string(),
            root: None,
        }
    }

    /// Create a provider named `name` over `root`.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - `Io` if the root cannot be created
    pub fn rooted(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            std::fs::create_dir_all(&root)
                .map_err(|e| Error::from_io(root.display().to_string(), e))?;
        }

        Ok(Self {
            name: fold_case(&name.into()),
            root: Some(root),
        })
    }

    pub fn from_config(config: &LocalConfig) -> Result<Self> {
        match &config.root {
            Some(root) => Self::rooted(config.name(), root),
            None => Ok(Self::unrooted()),
        }
    }

    /// Resolve a logical path to a filesystem path.
    fn to_fs_path(&self, logical: &str) -> Result<PathBuf> {
        let Some(root) = &self.root else {
            return Ok(PathBuf::from(logical));
        };

        let relative = RelativePath::parse(&strip_name_prefix(logical, &self.name)?)?;
        let mut fs_path = root.clone();
        for component in relative.components() {
            fs_path.push(component);
        }
        Ok(fs_path)
    }

    /// Inverse of [`to_fs_path`](Self::to_fs_path).
    fn to_logical(&self, fs_path: &Path) -> String {
        let relative = self
            .root
            .as_ref()
            .and_then(|root| fs_path.strip_prefix(root).ok());

        match relative {
            Some(relative) => {
                let components: Vec<String> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                join_logical(&self.name, &components.join("/"))
            }
            None => fs_path.to_string_lossy().into_owned(),
        }
    }

    fn describe(&self, fs_path: &Path, fs_meta: &std::fs::Metadata) -> StorageDescriptor {
        let modified: DateTime<Utc> = fs_meta
            .modified()
            .map(|t| t.into())
            .unwrap_or_else(|_| Utc::now());
        let name = fs_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let logical_path = self.to_logical(fs_path);

        if fs_meta.is_dir() {
            StorageDescriptor::directory(name, logical_path, modified)
        } else {
            StorageDescriptor::file(name, logical_path, modified, fs_meta.len())
        }
    }

    /// One `read_dir` round trip, sorted by name.
    ///
    /// Symlinks to files are reported as files; symlinked directories are not
    /// followed.
    async fn list_dir(&self, dir: PathBuf) -> Result<Listing<PathBuf>> {
        let io_err = |e| Error::from_io(self.to_logical(&dir), e);
        let mut entries = fs::read_dir(&dir).await.map_err(io_err)?;
        let mut listing = Listing::default();

        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let entry_path = entry.path();
            let file_type = entry.file_type().await.map_err(io_err)?;

            if file_type.is_dir() {
                listing.directories.push(entry_path);
                continue;
            }

            let fs_meta = match fs::metadata(&entry_path).await {
                Ok(meta) => meta,
                Err(e) if file_type.is_symlink() => {
                    debug!("Skipping dangling link {}: {}", entry_path.display(), e);
                    continue;
                }
                Err(e) => return Err(Error::from_io(self.to_logical(&entry_path), e)),
            };
            if fs_meta.is_file() {
                listing.files.push(self.describe(&entry_path, &fs_meta));
            }
        }

        listing.files.sort_by(|a, b| a.name.cmp(&b.name));
        listing.directories.sort();
        Ok(listing)
    }
}

#[async_trait]
impl StorageProvider for LocalProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn enumerate<'a>(
        &'a self,
        root: &str,
        recursive: bool,
        filter: Option<&'a StorageFilter>,
    ) -> DescriptorStream<'a> {
        match self.to_fs_path(root) {
            Ok(fs_root) => provider::depth_first(fs_root, recursive, filter, move |dir| {
                self.list_dir(dir)
            }),
            Err(e) => provider::failed(e),
        }
    }

    async fn stat(&self, path: &str) -> Result<StorageDescriptor> {
        let fs_path = self.to_fs_path(path)?;
        let fs_meta = fs::metadata(&fs_path)
            .await
            .map_err(|e| Error::from_io(path, e))?;
        Ok(self.describe(&fs_path, &fs_meta))
    }

    async fn read(&self, descriptor: &StorageDescriptor) -> Result<ByteStream> {
        if descriptor.is_directory() {
            return Err(Error::InvalidInput(format!(
                "Cannot read directory: {}",
                descriptor.logical_path
            )));
        }

        let logical = descriptor.logical_path.clone();
        let fs_path = self.to_fs_path(&logical)?;
        let file = fs::File::open(&fs_path)
            .await
            .map_err(|e| Error::from_io(logical.as_str(), e))?;

        let stream = ReaderStream::new(file).map(move |chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|e| Error::from_io(logical.as_str(), e))
        });
        Ok(Box::pin(stream))
    }

    async fn write(
        &self,
        path: &str,
        mut data: ByteStream,
        create_parent_directories: bool,
    ) -> Result<String> {
        let fs_path = self.to_fs_path(path)?;

        if create_parent_directories {
            if let Some(parent) = fs_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::from_io(self.to_logical(parent), e))?;
            }
        }

        let mut file = fs::File::create(&fs_path)
            .await
            .map_err(|e| Error::from_io(path, e))?;
        let mut digest = Md5Digest::new();

        while let Some(chunk) = data.next().await {
            let chunk = chunk?;
            digest.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::from_io(path, e))?;
        }
        file.flush().await.map_err(|e| Error::from_io(path, e))?;

        debug!("Wrote {}", fs_path.display());
        Ok(digest.finish())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let fs_path = self.to_fs_path(path)?;
        let fs_meta = fs::metadata(&fs_path)
            .await
            .map_err(|e| Error::from_io(path, e))?;

        if fs_meta.is_dir() {
            return Err(Error::InvalidInput(format!(
                "Cannot delete directory: {}",
                path
            )));
        }

        fs::remove_file(&fs_path)
            .await
            .map_err(|e| Error::from_io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum;
    use crate::provider::{bytes_stream, collect_bytes};
    use futures::TryStreamExt;
    use tempfile::TempDir;

    fn rooted(temp: &TempDir) -> LocalProvider {
        LocalProvider::rooted("Root", temp.path()).unwrap()
    }

    async fn paths(stream: DescriptorStream<'_>) -> Vec<String> {
        stream.map_ok(|d| d.logical_path).try_collect().await.unwrap()
    }

    #[tokio::test]
    async fn test_local_write_read() {
        let temp = TempDir::new().unwrap();
        let provider = rooted(&temp);
        let data = b"Hello, Local!".to_vec();

        let written = provider
            .write("root/a/b.txt", bytes_stream(data.clone()), true)
            .await
            .unwrap();
        assert_eq!(written, checksum::digest(&data));

        let descriptor = provider.stat("root/a/b.txt").await.unwrap();
        assert_eq!(descriptor.logical_path, "root/a/b.txt");
        assert_eq!(descriptor.size_bytes, data.len() as u64);

        let read = collect_bytes(provider.read(&descriptor).await.unwrap())
            .await
            .unwrap();
        assert_eq!(read, data);
    }

    #[tokio::test]
    async fn test_write_without_parents_fails() {
        let temp = TempDir::new().unwrap();
        let provider = rooted(&temp);

        let err = provider
            .write("root/missing/b.txt", bytes_stream(vec![1]), false)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_enumerate_depth_first_files_only() {
        let temp = TempDir::new().unwrap();
        let provider = rooted(&temp);
        for path in ["root/a.txt", "root/sub/b.txt", "root/sub/deep/c.csv", "root/z.txt"] {
            provider.write(path, bytes_stream(vec![0]), true).await.unwrap();
        }

        assert_eq!(
            paths(provider.enumerate("root", false, None)).await,
            vec!["root/a.txt", "root/z.txt"]
        );
        assert_eq!(
            paths(provider.enumerate("root", true, None)).await,
            vec!["root/a.txt", "root/z.txt", "root/sub/b.txt", "root/sub/deep/c.csv"]
        );

        let filter = StorageFilter::with_extensions([".csv"]);
        assert_eq!(
            paths(provider.enumerate("root", true, Some(&filter))).await,
            vec!["root/sub/deep/c.csv"]
        );
    }

    #[tokio::test]
    async fn test_enumerate_missing_directory_is_not_found() {
        let temp = TempDir::new().unwrap();
        let provider = rooted(&temp);

        let mut stream = provider.enumerate("root/nope", true, None);
        assert!(stream.next().await.unwrap().unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_then_stat_is_not_found() {
        let temp = TempDir::new().unwrap();
        let provider = rooted(&temp);
        provider
            .write("root/gone.txt", bytes_stream(vec![1, 2]), false)
            .await
            .unwrap();

        provider.delete("root/gone.txt").await.unwrap();
        assert!(provider.stat("root/gone.txt").await.unwrap_err().is_not_found());
        assert!(provider.delete("root/gone.txt").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_stat_directory() {
        let temp = TempDir::new().unwrap();
        let provider = rooted(&temp);
        std::fs::create_dir(temp.path().join("testa")).unwrap();

        let descriptor = provider.stat("ROOT/testa").await.unwrap();
        assert!(descriptor.is_directory());
        assert_eq!(descriptor.name, "testa");
    }

    #[tokio::test]
    async fn test_foreign_path_is_rejected() {
        let temp = TempDir::new().unwrap();
        let provider = rooted(&temp);

        let err = provider.stat("other/file.txt").await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_unrooted_uses_os_paths() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::unrooted();
        let file = temp.path().join("plain.txt");
        let logical = file.to_string_lossy().into_owned();

        provider
            .write(&logical, bytes_stream(b"x".to_vec()), false)
            .await
            .unwrap();

        let root = temp.path().to_string_lossy().into_owned();
        assert_eq!(paths(provider.enumerate(&root, false, None)).await, vec![logical]);
    }
}
