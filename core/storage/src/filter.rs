//! Declarative enumeration filter.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use polystore_common::{Error, Result};

use crate::descriptor::StorageDescriptor;

/// Half-open timestamp interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    /// Whether `timestamp` falls inside the interval.
    pub fn contains(&self, timestamp: &DateTime<Utc>) -> bool {
        self.start <= *timestamp && *timestamp < self.end
    }
}

/// Predicate applied to every file an enumeration produces.
///
/// Three optional clauses are AND-ed together:
/// - regex patterns, matched against the logical path (any pattern)
/// - extensions, matched against the end of the name (any, case-insensitive)
/// - a half-open date range on the timestamp
///
/// An empty clause always matches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "FilterSpec", into = "FilterSpec")]
pub struct StorageFilter {
    patterns: Vec<Regex>,
    extensions: Vec<String>,
    date_range: Option<DateRange>,
}

impl StorageFilter {
    /// Start building a filter.
    pub fn builder() -> StorageFilterBuilder {
        StorageFilterBuilder::default()
    }

    /// Filter on extensions only.
    pub fn with_extensions<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            extensions: extensions.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Evaluate the filter against one descriptor.
    pub fn is_match(&self, descriptor: &StorageDescriptor) -> bool {
        if !self.patterns.is_empty()
            && !self
                .patterns
                .iter()
                .any(|pattern| pattern.is_match(&descriptor.logical_path))
        {
            return false;
        }

        if !self.extensions.is_empty() {
            let name = descriptor.name.to_lowercase();
            if !self
                .extensions
                .iter()
                .any(|ext| name.ends_with(&ext.to_lowercase()))
            {
                return false;
            }
        }

        match &self.date_range {
            Some(range) => range.contains(&descriptor.timestamp),
            None => true,
        }
    }

    /// Configured regex sources.
    pub fn patterns(&self) -> Vec<&str> {
        self.patterns.iter().map(|p| p.as_str()).collect()
    }

    /// Configured extensions.
    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Configured date range.
    pub fn date_range(&self) -> Option<DateRange> {
        self.date_range
    }
}

/// Apply an optional filter; `None` matches everything.
pub fn matches(filter: Option<&StorageFilter>, descriptor: &StorageDescriptor) -> bool {
    filter.map_or(true, |f| f.is_match(descriptor))
}

/// Builder for [`StorageFilter`].
#[derive(Debug, Default)]
pub struct StorageFilterBuilder {
    patterns: Vec<String>,
    extensions: Vec<String>,
    date_range: Option<DateRange>,
}

impl StorageFilterBuilder {
    /// Add a regex pattern.
    pub fn regex(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    /// Add an extension such as `.csv`.
    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extensions.push(extension.into());
        self
    }

    /// Restrict to `start <= timestamp < end`.
    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.date_range = Some(DateRange { start, end });
        self
    }

    /// Compile the patterns.
    ///
    /// # Errors
    /// - `Configuration` if a pattern is not a valid regex
    pub fn build(self) -> Result<StorageFilter> {
        let patterns = self
            .patterns
            .iter()
            .map(|source| {
                Regex::new(source).map_err(|e| {
                    Error::Configuration(format!("invalid filter pattern '{}': {}", source, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(StorageFilter {
            patterns,
            extensions: self.extensions,
            date_range: self.date_range,
        })
    }
}

/// Serialized form of a filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FilterSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    regex_patterns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    extensions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    date_range: Option<DateRange>,
}

impl TryFrom<FilterSpec> for StorageFilter {
    type Error = Error;

    fn try_from(spec: FilterSpec) -> Result<Self> {
        let mut builder = StorageFilter::builder();
        for pattern in spec.regex_patterns {
            builder = builder.regex(pattern);
        }
        for extension in spec.extensions {
            builder = builder.extension(extension);
        }
        if let Some(range) = spec.date_range {
            builder = builder.between(range.start, range.end);
        }
        builder.build()
    }
}

impl From<StorageFilter> for FilterSpec {
    fn from(filter: StorageFilter) -> Self {
        Self {
            regex_patterns: filter
                .patterns
                .iter()
                .map(|p| p.as_str().to_string())
                .collect(),
            extensions: filter.extensions,
            date_range: filter.date_range,
        }
    }
}
