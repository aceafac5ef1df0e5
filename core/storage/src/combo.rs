//! Prefix routing across several named facades.

use std::sync::Arc;
use tracing::debug;

use polystore_common::{fold_case, split_name_prefix, Error, Result};

use crate::config::ProviderConfig;
use crate::descriptor::StorageDescriptor;
use crate::facade::StorageFacade;
use crate::factory::FacadeFactory;
use crate::filter::StorageFilter;
use crate::local::LocalProvider;
use crate::provider::{ByteStream, DescriptorStream};

/// Facade that dispatches every call by logical path.
///
/// A path goes to the member with the longest name that prefixes it under
/// [`fold_case`], the same rule each provider applies when it strips its
/// name, so a routed path is always one the member accepts. Paths no member
/// claims go to the default
/// local facade. Enumeration never crosses members: the whole walk stays in
/// the facade that owns the root.
#[derive(Clone)]
pub struct ComboFacade {
    members: Vec<(String, StorageFacade)>,
    default: StorageFacade,
}

impl ComboFacade {
    /// Combo over `members` with an unrooted local default.
    ///
    /// # Errors
    /// - `Configuration` if two members share a routing key
    pub fn new(members: impl IntoIterator<Item = StorageFacade>) -> Result<Self> {
        Self::with_default(members, StorageFacade::new(Arc::new(LocalProvider::unrooted())))
    }

    /// Combo with an explicit default facade.
    pub fn with_default(
        members: impl IntoIterator<Item = StorageFacade>,
        default: StorageFacade,
    ) -> Result<Self> {
        let mut routed: Vec<(String, StorageFacade)> = Vec::new();
        for facade in members {
            let key = fold_case(facade.name());
            if routed.iter().any(|(existing, _)| *existing == key) {
                return Err(Error::Configuration(format!(
                    "storage name '{}' is used by more than one provider",
                    key
                )));
            }
            routed.push((key, facade));
        }

        // Longest key first, so the first match is the most specific one.
        routed.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        Ok(Self {
            members: routed,
            default,
        })
    }

    /// Build every configuration through `factory`.
    pub fn from_configs(factory: &FacadeFactory, configs: &[ProviderConfig]) -> Result<Self> {
        let facades = configs
            .iter()
            .map(|config| factory.create(config))
            .collect::<Result<Vec<_>>>()?;
        Self::new(facades)
    }

    /// Facade that owns `path`.
    pub fn route(&self, path: &str) -> &StorageFacade {
        let facade = self
            .members
            .iter()
            .find(|(_, facade)| split_name_prefix(path, facade.name()).is_some())
            .map(|(_, facade)| facade)
            .unwrap_or(&self.default);
        debug!(path, storage = facade.name(), "routed");
        facade
    }

    /// Member facades, most specific routing key first.
    pub fn members(&self) -> impl Iterator<Item = &StorageFacade> {
        self.members.iter().map(|(_, facade)| facade)
    }

    pub fn default_facade(&self) -> &StorageFacade {
        &self.default
    }

    pub fn enumerate<'a>(
        &'a self,
        root: &str,
        recursive: bool,
        filter: Option<&'a StorageFilter>,
    ) -> DescriptorStream<'a> {
        self.route(root).enumerate(root, recursive, filter)
    }

    pub async fn stat(&self, path: &str) -> Result<StorageDescriptor> {
        self.route(path).stat(path).await
    }

    pub async fn read(&self, descriptor: &StorageDescriptor) -> Result<ByteStream> {
        self.route(&descriptor.logical_path).read(descriptor).await
    }

    pub async fn read_to_vec(&self, descriptor: &StorageDescriptor) -> Result<Vec<u8>> {
        self.route(&descriptor.logical_path)
            .read_to_vec(descriptor)
            .await
    }

    pub async fn write(
        &self,
        path: &str,
        data: ByteStream,
        create_parent_directories: bool,
        validate_checksum: bool,
    ) -> Result<String> {
        self.route(path)
            .write(path, data, create_parent_directories, validate_checksum)
            .await
    }

    pub async fn write_bytes(
        &self,
        path: &str,
        data: Vec<u8>,
        create_parent_directories: bool,
        validate_checksum: bool,
    ) -> Result<String> {
        self.route(path)
            .write_bytes(path, data, create_parent_directories, validate_checksum)
            .await
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.route(path).delete(path).await
    }

    pub async fn compute_checksum(&self, path: &str) -> Result<String> {
        self.route(path).compute_checksum(path).await
    }
}
