//! Backend-agnostic storage for polystore.
//!
//! One trait-based interface for hierarchical storage operations over a
//! local filesystem, SMB shares, Azure blob containers and S3-compatible
//! object stores. Callers address every object with a logical path made of
//! the facade name followed by the backend-relative path.
//!
//! # Design Principles
//! - Provider isolation: backend addressing never leaks past the provider
//! - Async operations: all I/O is async; blocking vendor calls run on the
//!   blocking pool
//! - Streaming support: enumeration and reads are lazy streams
//! - Unified error semantics: consistent error types across providers

pub mod blob;
pub mod checksum;
pub mod combo;
pub mod config;
pub mod descriptor;
pub mod facade;
pub mod factory;
pub mod filter;
pub mod local;
pub mod object_store;
pub mod provider;
pub mod smb;

pub use blob::BlobProvider;
pub use combo::ComboFacade;
pub use config::{
    BlobConfig, LocalConfig, ObjectStoreConfig, ProviderConfig, SmbAddress, SmbConfig,
    SmbCredentials,
};
pub use descriptor::StorageDescriptor;
pub use facade::StorageFacade;
pub use factory::{FacadeFactory, ProviderBuilder};
pub use filter::{DateRange, StorageFilter, StorageFilterBuilder};
pub use local::LocalProvider;
pub use object_store::ObjectStoreProvider;
pub use provider::{
    bytes_stream, collect_bytes, BackendKind, ByteStream, DescriptorStream, StorageProvider,
};
pub use smb::{MemoryConnector, SmbConnector, SmbProvider};
