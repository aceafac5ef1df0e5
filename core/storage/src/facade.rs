//! Single-backend facade with checksum-validated writes.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use polystore_common::{Error, Result};

use crate::checksum;
use crate::descriptor::StorageDescriptor;
use crate::filter::StorageFilter;
use crate::provider::{self, BackendKind, ByteStream, DescriptorStream, StorageProvider};

/// Uniform operations over exactly one provider.
///
/// Cloning is cheap; clones share the provider and any sessions it caches.
#[derive(Clone)]
pub struct StorageFacade {
    provider: Arc<dyn StorageProvider>,
}

impl StorageFacade {
    pub fn new(provider: Arc<dyn StorageProvider>) -> Self {
        Self { provider }
    }

    /// Routing name of the wrapped provider.
    pub fn name(&self) -> &str {
        self.provider.name()
    }

    pub fn kind(&self) -> BackendKind {
        self.provider.kind()
    }

    /// Lazily enumerate files under `root`.
    pub fn enumerate<'a>(
        &'a self,
        root: &str,
        recursive: bool,
        filter: Option<&'a StorageFilter>,
    ) -> DescriptorStream<'a> {
        debug!(root, recursive, "enumerate");
        self.provider.enumerate(root, recursive, filter)
    }

    #[instrument(skip(self), fields(storage = %self.name()))]
    pub async fn stat(&self, path: &str) -> Result<StorageDescriptor> {
        self.provider.stat(path).await
    }

    #[instrument(
        skip(self, descriptor),
        fields(storage = %self.name(), path = %descriptor.logical_path)
    )]
    pub async fn read(&self, descriptor: &StorageDescriptor) -> Result<ByteStream> {
        self.provider.read(descriptor).await
    }

    /// Read a whole object into memory.
    pub async fn read_to_vec(&self, descriptor: &StorageDescriptor) -> Result<Vec<u8>> {
        provider::collect_bytes(self.read(descriptor).await?).await
    }

    /// Write `data` to `path`, returning the base64 MD5 of what was sent.
    ///
    /// # Postconditions
    /// - With `validate_checksum`, the stored object's digest equals the
    ///   returned one
    ///
    /// # Errors
    /// - `ChecksumMismatch` if validation recomputes a different digest
    #[instrument(skip(self, data), fields(storage = %self.name()))]
    pub async fn write(
        &self,
        path: &str,
        data: ByteStream,
        create_parent_directories: bool,
        validate_checksum: bool,
    ) -> Result<String> {
        if !validate_checksum {
            return self
                .provider
                .write(path, data, create_parent_directories)
                .await;
        }

        let (data, tap) = checksum::tap(data);
        self.provider
            .write(path, data, create_parent_directories)
            .await?;
        let sent = tap.finish();

        let stored = self.provider.compute_checksum(path).await?;
        if stored != sent {
            warn!(path, expected = %sent, actual = %stored, "checksum mismatch after write");
            return Err(Error::ChecksumMismatch {
                path: path.to_string(),
                expected: sent,
                actual: stored,
            });
        }

        debug!(path, checksum = %sent, "write validated");
        Ok(sent)
    }

    /// Write an in-memory buffer.
    pub async fn write_bytes(
        &self,
        path: &str,
        data: Vec<u8>,
        create_parent_directories: bool,
        validate_checksum: bool,
    ) -> Result<String> {
        self.write(
            path,
            provider::bytes_stream(data),
            create_parent_directories,
            validate_checksum,
        )
        .await
    }

    #[instrument(skip(self), fields(storage = %self.name()))]
    pub async fn delete(&self, path: &str) -> Result<()> {
        self.provider.delete(path).await
    }

    #[instrument(skip(self), fields(storage = %self.name()))]
    pub async fn compute_checksum(&self, path: &str) -> Result<String> {
        self.provider.compute_checksum(path).await
    }
}

impl fmt::Debug for StorageFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageFacade")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalProvider;
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Provider that flips the first byte of everything it stores.
    struct Corrupting(LocalProvider);

    #[async_trait]
    impl StorageProvider for Corrupting {
        fn name(&self) -> &str {
            self.0.name()
        }

        fn kind(&self) -> BackendKind {
            self.0.kind()
        }

        fn enumerate<'a>(
            &'a self,
            root: &str,
            recursive: bool,
            filter: Option<&'a StorageFilter>,
        ) -> DescriptorStream<'a> {
            self.0.enumerate(root, recursive, filter)
        }

        async fn stat(&self, path: &str) -> Result<StorageDescriptor> {
            self.0.stat(path).await
        }

        async fn read(&self, descriptor: &StorageDescriptor) -> Result<ByteStream> {
            self.0.read(descriptor).await
        }

        async fn write(&self, path: &str, data: ByteStream, create: bool) -> Result<String> {
            let mut bytes = provider::collect_bytes(data).await?;
            if let Some(first) = bytes.first_mut() {
                *first ^= 0xff;
            }
            self.0.write(path, provider::bytes_stream(bytes), create).await
        }

        async fn delete(&self, path: &str) -> Result<()> {
            self.0.delete(path).await
        }
    }

    #[tokio::test]
    async fn test_validated_write_round_trip() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::rooted("root", temp.path()).unwrap();
        let facade = StorageFacade::new(Arc::new(provider));
        let data = b"validated payload".to_vec();

        let sent = facade
            .write_bytes("root/v/a.txt", data.clone(), true, true)
            .await
            .unwrap();
        assert_eq!(sent, checksum::digest(&data));
        assert_eq!(facade.compute_checksum("root/v/a.txt").await.unwrap(), sent);

        let descriptor = facade.stat("root/v/a.txt").await.unwrap();
        assert_eq!(facade.read_to_vec(&descriptor).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_corruption_is_detected() {
        let temp = TempDir::new().unwrap();
        let inner = LocalProvider::rooted("root", temp.path()).unwrap();
        let facade = StorageFacade::new(Arc::new(Corrupting(inner)));

        let err = facade
            .write_bytes("root/a.txt", b"payload".to_vec(), false, true)
            .await
            .unwrap_err();
        match err {
            Error::ChecksumMismatch { path, expected, actual } => {
                assert_eq!(path, "root/a.txt");
                assert_eq!(expected, checksum::digest(b"payload"));
                assert_ne!(expected, actual);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unvalidated_write_trusts_provider() {
        let temp = TempDir::new().unwrap();
        let inner = LocalProvider::rooted("root", temp.path()).unwrap();
        let facade = StorageFacade::new(Arc::new(Corrupting(inner)));

        assert!(facade
            .write_bytes("root/a.txt", b"payload".to_vec(), false, false)
            .await
            .is_ok());
    }
}
