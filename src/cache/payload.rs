//! Cacheable payload extraction.
//!
//! A rendered element carries more than what is worth caching: children,
//! callbacks and other build-time properties. Only markup, attachments,
//! cacheability and explicitly requested properties are stored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::metadata::CacheabilityMetadata;

/// What the render cache stores for a rendered element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderPayload {
    pub markup: String,
    /// Asset libraries, settings and other attachments, keyed by kind.
    pub attachments: BTreeMap<String, Value>,
    /// Properties preserved through `cache_properties`.
    pub properties: BTreeMap<String, Value>,
    pub cacheability: CacheabilityMetadata,
}

impl RenderPayload {
    pub fn new(markup: impl Into<String>) -> Self {
        Self {
            markup: markup.into(),
            ..Default::default()
        }
    }

    pub fn with_cacheability(mut self, cacheability: CacheabilityMetadata) -> Self {
        self.cacheability = cacheability;
        self
    }
}

/// A rendered element as handed over by the render tree walker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderElement {
    pub markup: String,
    pub attachments: BTreeMap<String, Value>,
    pub cacheability: CacheabilityMetadata,
    /// Arbitrary element properties; most are build-time only.
    pub properties: BTreeMap<String, Value>,
    /// Names of properties that must survive caching.
    pub cache_properties: Vec<String>,
    pub children: Vec<RenderElement>,
}

impl RenderElement {
    pub fn new(markup: impl Into<String>) -> Self {
        Self {
            markup: markup.into(),
            ..Default::default()
        }
    }

    /// Project the element onto the subset that is stored in the cache.
    pub fn cacheable_payload(&self) -> RenderPayload {
        let properties = self
            .cache_properties
            .iter()
            .filter_map(|name| {
                self.properties
                    .get(name)
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect();

        RenderPayload {
            markup: self.markup.clone(),
            attachments: self.attachments.clone(),
            properties,
            cacheability: self.cacheability.clone(),
        }
    }
}
