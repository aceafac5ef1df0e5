//! SMB network share backend.
//!
//! The provider speaks to the share through [`SmbShare`] handles obtained
//! from an [`SmbConnector`]. With the `smb` feature, `PavaoConnector` logs
//! in through libsmbclient; [`MemoryConnector`] serves tests and development.

#[cfg(feature = "smb")]
pub mod libsmbclient;
pub mod memory;
pub mod provider;
pub mod session;
pub mod share;

#[cfg(feature = "smb")]
pub use libsmbclient::PavaoConnector;
pub use memory::{MemoryConnector, MemoryShare};
pub use provider::SmbProvider;
pub use session::SessionCache;
pub use share::{
    HandleId, HeldHandle, OpenMode, SmbConnector, SmbFileInfo, SmbHandle, SmbShare,
};
