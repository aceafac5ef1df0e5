//! Facade factory: backend kind to provider construction.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use polystore_common::{Error, Result};

use crate::blob::BlobProvider;
use crate::config::ProviderConfig;
use crate::facade::StorageFacade;
use crate::local::LocalProvider;
use crate::object_store::ObjectStoreProvider;
use crate::provider::{BackendKind, StorageProvider};
use crate::smb::{SessionCache, SmbConnector, SmbProvider};

/// Builder function type for creating providers.
pub type ProviderBuilder =
    Box<dyn Fn(&ProviderConfig) -> Result<Arc<dyn StorageProvider>> + Send + Sync>;

/// Registry of provider builders keyed by backend kind.
pub struct FacadeFactory {
    builders: HashMap<BackendKind, ProviderBuilder>,
}

impl FacadeFactory {
    /// Create a factory with no backends.
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Factory with the local, blob and object store backends.
    ///
    /// SMB needs a client library; add it with
    /// [`with_smb_connector`](Self::with_smb_connector), e.g. the
    /// `PavaoConnector` built with the `smb` feature.
    pub fn with_defaults() -> Self {
        let mut builders: HashMap<BackendKind, ProviderBuilder> = HashMap::new();

        builders.insert(
            BackendKind::Local,
            Box::new(|config| match config {
                ProviderConfig::Local(c) => Ok(Arc::new(LocalProvider::from_config(c)?)),
                other => Err(mismatch(BackendKind::Local, other)),
            }),
        );

        builders.insert(
            BackendKind::Blob,
            Box::new(|config| match config {
                ProviderConfig::Blob(c) => Ok(Arc::new(BlobProvider::new(c)?)),
                other => Err(mismatch(BackendKind::Blob, other)),
            }),
        );

        builders.insert(
            BackendKind::ObjectStore,
            Box::new(|config| match config {
                ProviderConfig::ObjectStore(c) => Ok(Arc::new(ObjectStoreProvider::new(c)?)),
                other => Err(mismatch(BackendKind::ObjectStore, other)),
            }),
        );

        Self { builders }
    }

    /// Enable SMB shares reached through `connector`.
    ///
    /// Every SMB facade built afterwards shares one session cache.
    pub fn with_smb_connector(mut self, connector: Arc<dyn SmbConnector>) -> Self {
        let sessions = Arc::new(SessionCache::new(connector));
        self.builders.insert(
            BackendKind::Smb,
            Box::new(move |config| match config {
                ProviderConfig::Smb(c) => Ok(Arc::new(SmbProvider::new(c, sessions.clone()))),
                other => Err(mismatch(BackendKind::Smb, other)),
            }),
        );
        self
    }

    /// Register a provider builder.
    ///
    /// # Preconditions
    /// - `kind` must not be registered yet
    ///
    /// # Errors
    /// - `Configuration` if `kind` is already registered
    pub fn register(&mut self, kind: BackendKind, builder: ProviderBuilder) -> Result<()> {
        if self.builders.contains_key(&kind) {
            return Err(Error::Configuration(format!(
                "Backend '{}' is already registered",
                kind
            )));
        }
        self.builders.insert(kind, builder);
        Ok(())
    }

    /// Check if a backend kind is registered.
    pub fn supports(&self, kind: BackendKind) -> bool {
        self.builders.contains_key(&kind)
    }

    /// Registered backend kinds.
    pub fn kinds(&self) -> Vec<BackendKind> {
        self.builders.keys().copied().collect()
    }

    /// Build the facade for a configuration.
    ///
    /// # Errors
    /// - `Configuration` if the backend kind is not registered or the
    ///   configuration is invalid
    /// - `Connection` if the backend client cannot be initialized
    pub fn create(&self, config: &ProviderConfig) -> Result<StorageFacade> {
        let kind = config.kind();
        let builder = self.builders.get(&kind).ok_or_else(|| {
            Error::Configuration(format!("Backend '{}' is not registered", kind))
        })?;

        let provider = builder(config)?;
        info!("Created {} storage '{}'", kind, provider.name());
        Ok(StorageFacade::new(provider))
    }
}

impl Default for FacadeFactory {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn mismatch(expected: BackendKind, config: &ProviderConfig) -> Error {
    Error::Configuration(format!(
        "{} builder cannot build a {} configuration",
        expected,
        config.kind()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BlobConfig, LocalConfig, ObjectStoreConfig, SmbConfig};
    use crate::smb::MemoryConnector;
    use tempfile::TempDir;

    #[test]
    fn test_create_defaults() {
        let temp = TempDir::new().unwrap();
        let factory = FacadeFactory::with_defaults();

        let local = factory
            .create(&ProviderConfig::Local(LocalConfig::rooted("root", temp.path())))
            .unwrap();
        assert_eq!(local.name(), "root");
        assert_eq!(local.kind(), BackendKind::Local);

        let s3 = factory
            .create(&ProviderConfig::ObjectStore(ObjectStoreConfig::new(
                "id", "secret", "us-east-1", "bucketA",
            )))
            .unwrap();
        assert_eq!(s3.name(), "s3://bucketa");

        let blob = factory
            .create(&ProviderConfig::Blob(BlobConfig::with_account_key(
                "account", "a2V5", "container1",
            )))
            .unwrap();
        assert_eq!(blob.kind(), BackendKind::Blob);
    }

    #[test]
    fn test_unregistered_kind_fails() {
        let factory = FacadeFactory::with_defaults();
        let config = ProviderConfig::Smb(SmbConfig::new("filer", "share", "d", "u", "p"));

        assert!(!factory.supports(BackendKind::Smb));
        assert!(matches!(factory.create(&config), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_smb_connector_enables_smb() {
        let factory =
            FacadeFactory::with_defaults().with_smb_connector(Arc::new(MemoryConnector::new()));
        let config = ProviderConfig::Smb(SmbConfig::new("Filer", "Share", "d", "u", "p"));

        let facade = factory.create(&config).unwrap();
        assert_eq!(facade.name(), "//filer/share");
        assert_eq!(facade.kind(), BackendKind::Smb);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut factory = FacadeFactory::new();
        factory
            .register(
                BackendKind::Local,
                Box::new(|_| Ok(Arc::new(LocalProvider::unrooted()))),
            )
            .unwrap();

        let result = factory.register(
            BackendKind::Local,
            Box::new(|_| Ok(Arc::new(LocalProvider::unrooted()))),
        );
        assert!(result.is_err());
        assert_eq!(factory.kinds(), vec![BackendKind::Local]);
    }
}
