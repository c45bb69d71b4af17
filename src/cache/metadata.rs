//! Cacheability metadata.
//!
//! Every cacheable unit carries three accumulating facets: the cache contexts
//! it varies by, the invalidation tags it depends on, and how long it may be
//! kept. Metadata bubbles up the render tree by merging.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw integer used for permanent max-age at serialization boundaries.
pub const PERMANENT_RAW: i64 = -1;

/// Maximum age of a cache entry.
///
/// Ordering treats [`MaxAge::Permanent`] as larger than any finite age, so
/// `min` always picks the more restrictive value.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "i64", into = "i64")]
pub enum MaxAge {
    /// Valid for the given number of seconds. Zero means uncacheable.
    Seconds(u32),
    /// Never expires by age.
    #[default]
    Permanent,
}

impl MaxAge {
    /// An entry that must not be cached at all.
    pub const ZERO: MaxAge = MaxAge::Seconds(0);

    /// Parse the `-1 | 0..` integer convention.
    pub fn from_raw(raw: i64) -> Result<Self, MaxAgeError> {
        match raw {
            PERMANENT_RAW => Ok(MaxAge::Permanent),
            0.. => u32::try_from(raw)
                .map(MaxAge::Seconds)
                .map_err(|_| MaxAgeError::OutOfRange(raw)),
            _ => Err(MaxAgeError::OutOfRange(raw)),
        }
    }

    pub fn as_raw(self) -> i64 {
        match self {
            MaxAge::Seconds(seconds) => i64::from(seconds),
            MaxAge::Permanent => PERMANENT_RAW,
        }
    }

    pub fn is_zero(self) -> bool {
        self == MaxAge::ZERO
    }
}

impl TryFrom<i64> for MaxAge {
    type Error = MaxAgeError;

    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        MaxAge::from_raw(raw)
    }
}

impl From<MaxAge> for i64 {
    fn from(value: MaxAge) -> Self {
        value.as_raw()
    }
}

impl fmt::Display for MaxAge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaxAge::Seconds(seconds) => write!(f, "{seconds}s"),
            MaxAge::Permanent => f.write_str("permanent"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MaxAgeError {
    #[error("max-age must be -1 (permanent) or a non-negative number of seconds, got {0}")]
    OutOfRange(i64),
}

/// Contexts, tags and max-age of a cacheable unit.
///
/// Sets are kept sorted so that identifiers derived from them are
/// deterministic regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheabilityMetadata {
    pub contexts: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    #[serde(rename = "max-age")]
    pub max_age: MaxAge,
}

impl CacheabilityMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add cache context tokens.
    pub fn with_contexts<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.contexts.extend(tokens.into_iter().map(Into::into));
        self
    }

    /// Add invalidation tags.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_max_age(mut self, max_age: MaxAge) -> Self {
        self.max_age = max_age;
        self
    }

    /// Union of contexts and tags, the more restrictive of the two max-ages.
    pub fn merge(&self, other: &CacheabilityMetadata) -> CacheabilityMetadata {
        CacheabilityMetadata {
            contexts: self.contexts.union(&other.contexts).cloned().collect(),
            tags: self.tags.union(&other.tags).cloned().collect(),
            max_age: self.max_age.min(other.max_age),
        }
    }

    /// Returns false for max-age zero.
    pub fn is_cacheable(&self) -> bool {
        !self.max_age.is_zero()
    }
}
