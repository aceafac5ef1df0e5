//! Azure blob container storage provider.
//!
//! Flat containers emulate directories with `/`-delimited names and are
//! listed with one recursive prefix listing. Hierarchical-namespace accounts
//! have real directories and are walked one level per round trip.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt, TryStreamExt};
use opendal::services::{Azblob, Azdls};
use opendal::{Entry, EntryMode, ErrorKind, Operator};
use std::time::SystemTime;
use tracing::{debug, warn};

use polystore_common::{
    file_name, fold_case, join_logical, strip_name_prefix, Error, RelativePath, Result,
};

use crate::checksum::Md5Digest;
use crate::config::BlobConfig;
use crate::descriptor::StorageDescriptor;
use crate::filter::{self, StorageFilter};
use crate::provider::{self, BackendKind, ByteStream, DescriptorStream, Listing, StorageProvider};

/// Storage provider over one blob container.
pub struct BlobProvider {
    name: String,
    op: Operator,
    hierarchical: bool,
}

impl BlobProvider {
    /// Build the container client.
    ///
    /// No request is made; credentials are checked by the first call.
    ///
    /// # Errors
    /// - `Configuration` if the endpoint is malformed or no credential is set
    pub fn new(config: &BlobConfig) -> Result<Self> {
        let endpoint = config.service_endpoint()?;
        let op = match (&config.account_key, config.sas()) {
            (Some(key), _) if config.is_hierarchical_namespace => {
                let builder = Azdls::default()
                    .filesystem(&config.container_name)
                    .endpoint(&endpoint.replace(".blob.", ".dfs."))
                    .account_name(&config.account_name)
                    .account_key(key.expose());
                Operator::new(builder).map_err(|e| config_error(config, e))?.finish()
            }
            (Some(key), _) => {
                let builder = Azblob::default()
                    .container(&config.container_name)
                    .endpoint(&endpoint)
                    .account_name(&config.account_name)
                    .account_key(key.expose());
                Operator::new(builder).map_err(|e| config_error(config, e))?.finish()
            }
            (None, Some(sas)) => {
                if config.is_hierarchical_namespace {
                    warn!(
                        "SAS access to {} uses the blob endpoint; \
                         directories are emulated by the service",
                        config.name()
                    );
                }
                let builder = Azblob::default()
                    .container(&config.container_name)
                    .endpoint(&endpoint)
                    .sas_token(&sas);
                Operator::new(builder).map_err(|e| config_error(config, e))?.finish()
            }
            (None, None) => {
                return Err(Error::Configuration(format!(
                    "blob container '{}' has neither an account key nor a SAS token",
                    config.name()
                )));
            }
        };

        Ok(Self::with_operator(
            config.name(),
            op,
            config.is_hierarchical_namespace,
        ))
    }

    /// Wrap an existing operator.
    pub fn with_operator(name: impl Into<String>, op: Operator, hierarchical: bool) -> Self {
        Self {
            name: fold_case(&name.into()),
            op,
            hierarchical,
        }
    }

    /// Blob name of a logical path, without leading or trailing `/`.
    fn to_key(&self, logical: &str) -> Result<String> {
        let relative = strip_name_prefix(logical, &self.name)?;
        Ok(RelativePath::parse(&relative)?.to_key())
    }

    /// Listing path of a directory key.
    fn dir_path(key: &str) -> String {
        if key.is_empty() {
            "/".to_string()
        } else {
            format!("{}/", key)
        }
    }

    async fn describe(&self, entry: &Entry) -> Result<StorageDescriptor> {
        let key = entry.path().trim_end_matches('/');
        let meta = entry.metadata();
        let logical_path = join_logical(&self.name, key);
        let name = file_name(key).to_string();

        if meta.is_dir() {
            return Ok(StorageDescriptor::directory(name, logical_path, Utc::now()));
        }

        // Some listings omit properties; fall back to a stat of the blob.
        let (modified, size) = match meta.last_modified() {
            Some(modified) => (Some(modified), meta.content_length()),
            None => {
                let stat = self
                    .op
                    .stat(key)
                    .await
                    .map_err(|e| map_error(&self.name, key, e))?;
                (stat.last_modified(), stat.content_length())
            }
        };
        Ok(StorageDescriptor::file(
            name,
            logical_path,
            to_utc(modified),
            size,
        ))
    }

    /// One delimiter listing on a hierarchical container.
    async fn list_dir(&self, key: String) -> Result<Listing<String>> {
        let dir_path = Self::dir_path(&key);
        let mut lister = self
            .op
            .lister_with(&dir_path)
            .await
            .map_err(|e| map_error(&self.name, &key, e))?;

        let mut listing = Listing::default();
        while let Some(entry) = lister
            .try_next()
            .await
            .map_err(|e| map_error(&self.name, &key, e))?
        {
            if entry.path() == dir_path || entry.path() == "/" {
                continue;
            }
            match entry.metadata().mode() {
                EntryMode::DIR => listing
                    .directories
                    .push(entry.path().trim_end_matches('/').to_string()),
                EntryMode::FILE => listing.files.push(self.describe(&entry).await?),
                _ => debug!("Skipping entry of unknown mode: {}", entry.path()),
            }
        }
        Ok(listing)
    }

    /// One recursive prefix listing on a flat container.
    fn enumerate_flat<'a>(
        &'a self,
        key: String,
        recursive: bool,
        filter: Option<&'a StorageFilter>,
    ) -> DescriptorStream<'a> {
        let dir_path = Self::dir_path(&key);
        let prefix = if key.is_empty() { String::new() } else { dir_path.clone() };
        let list_key = key.clone();

        stream::once(async move {
            self.op
                .lister_with(&dir_path)
                .recursive(true)
                .await
                .map_err(|e| map_error(&self.name, &list_key, e))
        })
        .map_ok(move |lister| {
            let key = key.clone();
            lister.map_err(move |e| map_error(&self.name, &key, e))
        })
        .try_flatten()
        .try_filter_map(move |entry| {
            let prefix = prefix.clone();
            async move {
                if entry.metadata().mode() != EntryMode::FILE {
                    return Ok::<_, Error>(None);
                }
                let relative = entry.path().strip_prefix(prefix.as_str()).unwrap_or(entry.path());
                if !recursive && relative.contains('/') {
                    return Ok(None);
                }
                let descriptor = self.describe(&entry).await?;
                Ok(filter::matches(filter, &descriptor).then_some(descriptor))
            }
        })
        .boxed()
    }

    /// Whether any blob exists under `key/`.
    async fn has_children(&self, key: &str) -> Result<bool> {
        let mut lister = self
            .op
            .lister_with(&Self::dir_path(key))
            .recursive(true)
            .await
            .map_err(|e| map_error(&self.name, key, e))?;
        while let Some(entry) = lister
            .try_next()
            .await
            .map_err(|e| map_error(&self.name, key, e))?
        {
            if entry.path().trim_end_matches('/') != key {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn to_utc<T: Into<SystemTime>>(modified: Option<T>) -> DateTime<Utc> {
    modified
        .map(|t| DateTime::<Utc>::from(t.into()))
        .unwrap_or_else(Utc::now)
}

fn config_error(config: &BlobConfig, err: opendal::Error) -> Error {
    Error::Configuration(format!("blob container '{}': {}", config.name(), err))
}

/// Translate an opendal error raised while touching `key`.
fn map_error(name: &str, key: &str, err: opendal::Error) -> Error {
    let path = join_logical(name, key);
    match err.kind() {
        ErrorKind::NotFound => Error::NotFound(path),
        ErrorKind::PermissionDenied => Error::connection(name, err),
        ErrorKind::ConfigInvalid => Error::Configuration(format!("{}: {}", path, err)),
        kind => Error::io(path, kind.to_string(), err),
    }
}

#[async_trait]
impl StorageProvider for BlobProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Blob
    }

    fn enumerate<'a>(
        &'a self,
        root: &str,
        recursive: bool,
        filter: Option<&'a StorageFilter>,
    ) -> DescriptorStream<'a> {
        let key = match self.to_key(root) {
            Ok(key) => key,
            Err(e) => return provider::failed(e),
        };

        if self.hierarchical {
            provider::depth_first(key, recursive, filter, move |dir| self.list_dir(dir))
        } else {
            self.enumerate_flat(key, recursive, filter)
        }
    }

    async fn stat(&self, path: &str) -> Result<StorageDescriptor> {
        let key = self.to_key(path)?;
        if key.is_empty() {
            return Ok(StorageDescriptor::directory(
                file_name(&self.name),
                self.name.clone(),
                Utc::now(),
            ));
        }

        match self.op.stat(&key).await {
            Ok(meta) if meta.is_file() => {
                Ok(StorageDescriptor::file(
                    file_name(&key),
                    join_logical(&self.name, &key),
                    to_utc(meta.last_modified()),
                    meta.content_length(),
                ))
            }
            Ok(_) => Ok(StorageDescriptor::directory(
                file_name(&key),
                join_logical(&self.name, &key),
                Utc::now(),
            )),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if self.has_children(&key).await? {
                    Ok(StorageDescriptor::directory(
                        file_name(&key),
                        join_logical(&self.name, &key),
                        Utc::now(),
                    ))
                } else {
                    Err(Error::NotFound(path.to_string()))
                }
            }
            Err(e) => Err(map_error(&self.name, &key, e)),
        }
    }

    async fn read(&self, descriptor: &StorageDescriptor) -> Result<ByteStream> {
        if descriptor.is_directory() {
            return Err(Error::InvalidInput(format!(
                "Cannot read directory: {}",
                descriptor.logical_path
            )));
        }

        let key = self.to_key(&descriptor.logical_path)?;
        let map = |e| map_error(&self.name, &key, e);
        self.op.stat(&key).await.map_err(map)?;

        let reader = self.op.reader(&key).await.map_err(map)?;
        let bytes = reader.into_bytes_stream(..).await.map_err(map)?;

        let logical = descriptor.logical_path.clone();
        let stream = bytes.map(move |chunk| {
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
        let key = self.to_key(path)?;
        let map = |e| map_error(&self.name, &key, e);

        if create_parent_directories
            && self.hierarchical
            && self.op.info().full_capability().create_dir
        {
            let relative = RelativePath::parse(&key)?;
            for ancestor in relative.ancestors() {
                self.op
                    .create_dir(&Self::dir_path(&ancestor.to_key()))
                    .await
                    .map_err(map)?;
            }
        }

        let mut writer = self.op.writer(&key).await.map_err(map)?;
        let mut digest = Md5Digest::new();

        let uploaded: Result<()> = async {
            while let Some(chunk) = data.next().await {
                let chunk = chunk?;
                digest.update(&chunk);
                writer.write(chunk).await.map_err(map)?;
            }
            writer.close().await.map_err(map)?;
            Ok(())
        }
        .await;

        if let Err(e) = uploaded {
            if let Err(abort) = writer.abort().await {
                warn!("Failed to abort upload of {}: {}", path, abort);
            }
            return Err(e);
        }

        debug!("Uploaded {}", path);
        Ok(digest.finish())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let key = self.to_key(path)?;
        self.op
            .delete(&key)
            .await
            .map_err(|e| map_error(&self.name, &key, e))
    }
}
