//! Common utilities and types shared across polystore crates.
//!
//! This module provides the error taxonomy and the path primitives every
//! storage backend uses to translate logical paths into native ones.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    file_name, fold_case, join_logical, normalize_separators, prefix_len_ignore_case,
    split_name_prefix, strip_name_prefix, RelativePath, Secret, SEPARATOR,
};
