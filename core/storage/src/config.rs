//! Provider configurations, one variant per backend.
//!
//! Each configuration derives a canonical, lower-cased name. The name is the
//! prefix of every logical path the resulting facade produces and the key the
//! combo facade routes on.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use polystore_common::{Error, Result, Secret};

use crate::provider::BackendKind;

/// Name of the unrooted local store.
pub const LOCAL_STORE_NAME: &str = "local";

/// Default interval after which a cached SMB session is re-established.
pub const DEFAULT_SESSION_TTL_SECS: u64 = 600;

/// Default SMB read size.
pub const DEFAULT_READ_CHUNK: usize = 64 * 1024;

/// Configuration for any supported backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    Local(LocalConfig),
    Smb(SmbConfig),
    Blob(BlobConfig),
    ObjectStore(ObjectStoreConfig),
}

impl ProviderConfig {
    /// Backend family of this configuration.
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Local(_) => BackendKind::Local,
            Self::Smb(_) => BackendKind::Smb,
            Self::Blob(_) => BackendKind::Blob,
            Self::ObjectStore(_) => BackendKind::ObjectStore,
        }
    }

    /// Canonical routing name.
    pub fn name(&self) -> String {
        match self {
            Self::Local(c) => c.name(),
            Self::Smb(c) => c.name(),
            Self::Blob(c) => c.name(),
            Self::ObjectStore(c) => c.name(),
        }
    }
}

fn normalize_name(name: &str) -> String {
    polystore_common::fold_case(name)
        .trim_end_matches('/')
        .to_string()
}

/// Local filesystem configuration.
///
/// Without a `root` the store is unrooted: logical paths are plain OS paths.
/// With a `root`, logical paths are `<name>/<relative>` and resolve under it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub root: Option<PathBuf>,
}

impl LocalConfig {
    /// The unrooted local store.
    pub fn unrooted() -> Self {
        Self::default()
    }

    /// A local store named `name` whose paths resolve under `root`.
    pub fn rooted(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: Some(name.into()),
            root: Some(root.into()),
        }
    }

    pub fn name(&self) -> String {
        match &self.name {
            Some(name) => normalize_name(name),
            None => LOCAL_STORE_NAME.to_string(),
        }
    }
}

/// Server addressing for an SMB share.
///
/// `logical_server` appears in every externally visible path; the
/// `physical_server` is only used to open the connection. They differ when a
/// DFS alias points at a different host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmbAddress {
    pub logical_server: String,
    pub physical_server: String,
    pub domain: String,
    pub share_name: String,
}

/// Credentials used to log in to an SMB server.
#[derive(Debug, Clone)]
pub struct SmbCredentials {
    pub domain: String,
    pub username: String,
    pub password: Secret,
}

/// SMB network share configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmbConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub logical_server: String,
    #[serde(default)]
    pub physical_server: Option<String>,
    pub share_name: String,
    pub domain: String,
    pub username: String,
    pub password: Secret,
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
}

fn default_session_ttl_secs() -> u64 {
    DEFAULT_SESSION_TTL_SECS
}

fn default_read_chunk() -> usize {
    DEFAULT_READ_CHUNK
}

impl SmbConfig {
    pub fn new(
        logical_server: impl Into<String>,
        share_name: impl Into<String>,
        domain: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<Secret>,
    ) -> Self {
        Self {
            name: None,
            logical_server: logical_server.into(),
            physical_server: None,
            share_name: share_name.into(),
            domain: domain.into(),
            username: username.into(),
            password: password.into(),
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }

    /// Route connections for this share to a different host.
    pub fn with_physical_server(mut self, physical_server: impl Into<String>) -> Self {
        self.physical_server = Some(physical_server.into());
        self
    }

    /// Canonical name: `//<logical server>/<share>`.
    pub fn name(&self) -> String {
        match &self.name {
            Some(name) => normalize_name(name),
            None => {
                let address = self.address();
                format!("//{}/{}", address.logical_server, address.share_name)
            }
        }
    }

    pub fn address(&self) -> SmbAddress {
        let logical_server = normalize_name(&self.logical_server);
        let physical_server = self
            .physical_server
            .as_deref()
            .map(normalize_name)
            .unwrap_or_else(|| logical_server.clone());
        SmbAddress {
            logical_server,
            physical_server,
            domain: self.domain.to_lowercase(),
            share_name: self.share_name.to_lowercase(),
        }
    }

    pub fn credentials(&self) -> SmbCredentials {
        SmbCredentials {
            domain: self.domain.to_lowercase(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

/// Azure blob container configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub account_name: String,
    /// Shared key; `None` means SAS authentication via `endpoint`/`sas_token`.
    #[serde(default)]
    pub account_key: Option<Secret>,
    pub container_name: String,
    /// Pre-built service endpoint, optionally carrying a SAS query.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub sas_token: Option<Secret>,
    #[serde(default)]
    pub is_hierarchical_namespace: bool,
}

impl BlobConfig {
    /// Shared-key authenticated container.
    pub fn with_account_key(
        account_name: impl Into<String>,
        account_key: impl Into<Secret>,
        container_name: impl Into<String>,
    ) -> Self {
        Self {
            name: None,
            account_name: account_name.into(),
            account_key: Some(account_key.into()),
            container_name: container_name.into(),
            endpoint: None,
            sas_token: None,
            is_hierarchical_namespace: false,
        }
    }

    /// SAS authenticated container; `endpoint` carries the token as its query.
    pub fn with_sas_endpoint(
        account_name: impl Into<String>,
        endpoint: impl Into<String>,
        container_name: impl Into<String>,
    ) -> Self {
        Self {
            name: None,
            account_name: account_name.into(),
            account_key: None,
            container_name: container_name.into(),
            endpoint: Some(endpoint.into()),
            sas_token: None,
            is_hierarchical_namespace: false,
        }
    }

    /// Canonical name: `<service endpoint>/<container>`.
    pub fn name(&self) -> String {
        match &self.name {
            Some(name) => normalize_name(name),
            None => match self.service_endpoint() {
                Ok(endpoint) => format!("{}/{}", endpoint, self.container_name.to_lowercase()),
                Err(_) => format!(
                    "https://{}.blob.core.windows.net/{}",
                    self.account_name.to_lowercase(),
                    self.container_name.to_lowercase()
                ),
            },
        }
    }

    /// Blob service endpoint without query or trailing slash.
    ///
    /// # Errors
    /// - `Configuration` if `endpoint` is not a valid URL
    pub fn service_endpoint(&self) -> Result<String> {
        match &self.endpoint {
            Some(endpoint) => {
                let mut url = Url::parse(endpoint).map_err(|e| {
                    Error::Configuration(format!("invalid blob endpoint '{}': {}", endpoint, e))
                })?;
                url.set_query(None);
                Ok(url.as_str().trim_end_matches('/').to_lowercase())
            }
            None => Ok(format!(
                "https://{}.blob.core.windows.net",
                self.account_name.to_lowercase()
            )),
        }
    }

    /// SAS token from `sas_token`, or from the endpoint's query string.
    pub fn sas(&self) -> Option<String> {
        if let Some(token) = &self.sas_token {
            return Some(token.expose().trim_start_matches('?').to_string());
        }
        let url = Url::parse(self.endpoint.as_deref()?).ok()?;
        url.query().filter(|q| !q.is_empty()).map(str::to_string)
    }
}

/// S3-compatible object store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: Secret,
    pub region_name: String,
    pub bucket_name: String,
    /// Custom endpoint for S3-compatible services (MinIO, Backblaze, ...).
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl ObjectStoreConfig {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<Secret>,
        region_name: impl Into<String>,
        bucket_name: impl Into<String>,
    ) -> Self {
        Self {
            name: None,
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            region_name: region_name.into(),
            bucket_name: bucket_name.into(),
            endpoint: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Canonical name: `s3://<bucket>`.
    pub fn name(&self) -> String {
        match &self.name {
            Some(name) => normalize_name(name),
            None => format!("s3://{}", self.bucket_name.to_lowercase()),
        }
    }
}
