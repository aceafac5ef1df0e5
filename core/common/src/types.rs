//! Path and secret types shared by every backend.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroize;

use crate::{Error, Result};

/// Canonical separator of logical paths.
pub const SEPARATOR: char = '/';

/// Replace backslashes with the canonical `/` separator.
pub fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
}

/// Last path segment, accepting either separator.
pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches(['/', '\\']);
    match trimmed.rfind(['/', '\\']) {
        Some(index) => &trimmed[index + 1..],
        None => trimmed,
    }
}

/// Fold one character for name comparison: `\\` becomes `/` and letters
/// take their full Unicode lower-case mapping.
fn fold_char(c: char) -> std::char::ToLowercase {
    let c = if c == '\\' { SEPARATOR } else { c };
    c.to_lowercase()
}

/// Case- and separator-insensitive form of a storage name.
pub fn fold_case(value: &str) -> String {
    value.chars().flat_map(fold_char).collect()
}

/// Byte length of the head of `path` that equals `prefix` once both are
/// folded with [`fold_case`], or `None` if `path` does not start with it.
///
/// The length is measured in `path`, so it can be used to slice the
/// original string even when folding changed byte widths.
pub fn prefix_len_ignore_case(path: &str, prefix: &str) -> Option<usize> {
    let target: Vec<char> = fold_case(prefix).chars().collect();
    if target.is_empty() {
        return Some(0);
    }

    let mut matched = 0;
    for (index, c) in path.char_indices() {
        for folded in fold_char(c) {
            if target.get(matched) != Some(&folded) {
                return None;
            }
            matched += 1;
        }
        if matched == target.len() {
            return Some(index + c.len_utf8());
        }
    }
    None
}

/// Split a facade name off the front of a logical path.
///
/// The name must match under [`fold_case`] and be followed either by the end
/// of the string or by exactly one separator, which is consumed. The rest is
/// returned untouched, so doubled or leading separators survive.
pub fn split_name_prefix<'a>(logical: &'a str, name: &str) -> Option<&'a str> {
    let head = prefix_len_ignore_case(logical, name)?;
    let rest = &logical[head..];
    if rest.is_empty() || name.ends_with(['/', '\\']) {
        return Some(rest);
    }
    rest.strip_prefix(['/', '\\'])
}

/// Strip a facade name from the front of a logical path and normalize the
/// remainder's separators.
///
/// # Errors
/// - `Configuration` if `logical` is not addressed to `name`
pub fn strip_name_prefix(logical: &str, name: &str) -> Result<String> {
    split_name_prefix(logical, name)
        .map(normalize_separators)
        .ok_or_else(|| not_addressed(logical, &normalize_separators(name)))
}

/// Reassemble `name + "/" + relative`.
pub fn join_logical(name: &str, relative: &str) -> String {
    let relative = normalize_separators(relative);
    let relative = relative.trim_start_matches(SEPARATOR);
    if relative.is_empty() {
        name.to_string()
    } else if name.ends_with(SEPARATOR) {
        format!("{}{}", name, relative)
    } else {
        format!("{}{}{}", name, SEPARATOR, relative)
    }
}

fn not_addressed(logical: &str, name: &str) -> Error {
    Error::Configuration(format!(
        "path '{}' is not addressed to storage '{}'",
        logical, name
    ))
}

/// A backend-relative path, independent of the backend's separator.
///
/// This is the native half of a logical path once the facade name has been
/// stripped. Backends render it with their own separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelativePath {
    components: Vec<String>,
}

impl RelativePath {
    /// The empty path, addressing the root of the backend namespace.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Create a path from string components.
    ///
    /// # Errors
    /// - Returns error if any component is empty, contains a separator or
    ///   is a `.`/`..` traversal segment
    pub fn from_components(components: Vec<String>) -> Result<Self> {
        for comp in &components {
            validate_component(comp)?;
        }
        Ok(Self { components })
    }

    /// Parse a path accepting `/` or `\` separators.
    ///
    /// Empty segments (leading, trailing or doubled separators) are skipped.
    pub fn parse(path: &str) -> Result<Self> {
        let components: Vec<String> = path
            .split(['/', '\\'])
            .filter(|segment| !segment.is_empty())
            .map(String::from)
            .collect();
        Self::from_components(components)
    }

    /// Check if this is the root path.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Get the parent path, if any.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            let mut components = self.components.clone();
            components.pop();
            Some(Self { components })
        }
    }

    /// Every proper ancestor, shallowest first, excluding the root.
    pub fn ancestors(&self) -> Vec<Self> {
        (1..self.components.len())
            .map(|depth| Self {
                components: self.components[..depth].to_vec(),
            })
            .collect()
    }

    /// Get the file/directory name (last component).
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    /// Join this path with a child component.
    pub fn join(&self, child: &str) -> Result<Self> {
        validate_component(child)?;
        let mut components = self.components.clone();
        components.push(child.to_string());
        Ok(Self { components })
    }

    /// Get the path components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Render with a backend separator, e.g. `\` for SMB shares.
    pub fn to_native(&self, separator: char) -> String {
        self.components.join(&separator.to_string())
    }

    /// Render with `/`, the form used for object keys and logical paths.
    pub fn to_key(&self) -> String {
        self.to_native(SEPARATOR)
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_key())
    }
}

fn validate_component(comp: &str) -> Result<()> {
    if comp.is_empty() {
        return Err(Error::InvalidInput(
            "Path component cannot be empty".to_string(),
        ));
    }
    if comp.contains('/') || comp.contains('\\') {
        return Err(Error::InvalidInput(
            "Path component cannot contain separators".to_string(),
        ));
    }
    if comp == "." || comp == ".." {
        return Err(Error::InvalidInput(format!(
            "Path component '{}' is not allowed",
            comp
        )));
    }
    Ok(())
}

/// Credential string that zeroizes on drop and never prints itself.
#[derive(Clone, PartialEq, Eq, Zeroize, Serialize, Deserialize)]
#[zeroize(drop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wrap a credential.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the credential to a vendor client.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([REDACTED])")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}
