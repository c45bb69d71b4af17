//! Cache identity and cache id construction.
//!
//! A cacheable unit is addressed by its stable key parts plus the
//! request-specific fragments its cache contexts resolve to. The cache id is
//! a pure function of those two lists.

use thiserror::Error;

use super::metadata::{CacheabilityMetadata, MaxAge};

/// Separator between key parts and context fragments in a cache id.
pub const CID_DELIMITER: &str = ":";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    /// The item has no stable key parts and therefore is not cacheable.
    #[error("cache identity has no key parts")]
    InvalidIdentity,
}

/// Join key parts and resolved context fragments into a cache id.
pub fn build_id<K, F>(keys: &[K], fragments: &[F]) -> Result<String, KeyError>
where
    K: AsRef<str>,
    F: AsRef<str>,
{
    if keys.is_empty() {
        return Err(KeyError::InvalidIdentity);
    }

    let parts: Vec<&str> = keys
        .iter()
        .map(AsRef::as_ref)
        .chain(fragments.iter().map(AsRef::as_ref))
        .collect();
    Ok(parts.join(CID_DELIMITER))
}

/// Caller-facing identity of a cacheable unit, as known before its subtree
/// has rendered.
///
/// `cacheability.contexts` holds context *tokens*; they are resolved to key
/// fragments per request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheIdentity {
    pub keys: Vec<String>,
    pub cacheability: CacheabilityMetadata,
    /// Cache bin; `None` selects the configured default bin.
    pub bin: Option<String>,
}

impl CacheIdentity {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_contexts<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cacheability = self.cacheability.with_contexts(tokens);
        self
    }

    pub fn with_max_age(mut self, max_age: MaxAge) -> Self {
        self.cacheability = self.cacheability.with_max_age(max_age);
        self
    }

    pub fn with_bin(mut self, bin: impl Into<String>) -> Self {
        self.bin = Some(bin.into());
        self
    }

    /// An identity without keys, or with max-age zero, is never cached.
    pub fn is_cacheable(&self) -> bool {
        !self.keys.is_empty() && self.cacheability.is_cacheable()
    }

    /// The bin this identity lives in, falling back to `default_bin`.
    pub fn bin_or<'a>(&'a self, default_bin: &'a str) -> &'a str {
        self.bin.as_deref().unwrap_or(default_bin)
    }
}

/// Key parts together with the context fragments resolved for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub keys: Vec<String>,
    pub fragments: Vec<String>,
}

impl ResolvedIdentity {
    pub fn new(keys: Vec<String>, fragments: Vec<String>) -> Self {
        Self { keys, fragments }
    }

    pub fn cid(&self) -> Result<String, KeyError> {
        build_id(&self.keys, &self.fragments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_id_joins_keys_then_fragments() {
        let cid = build_id(&["entity_view", "node", "1"], &["[theme]=olivero"])
            .expect("keys present");
        assert_eq!(cid, "entity_view:node:1:[theme]=olivero");
    }

    #[test]
    fn build_id_without_fragments() {
        let no_fragments: [&str; 0] = [];
        assert_eq!(build_id(&["foo"], &no_fragments).as_deref(), Ok("foo"));
    }

    #[test]
    fn build_id_rejects_empty_keys() {
        let keys: [&str; 0] = [];
        assert_eq!(build_id(&keys, &["B1"]), Err(KeyError::InvalidIdentity));
    }

    #[test]
    fn build_id_is_deterministic() {
        let resolved = ResolvedIdentity::new(vec!["foo".into()], vec!["B1".into()]);
        assert_eq!(resolved.cid(), resolved.clone().cid());
        assert_eq!(resolved.cid().as_deref(), Ok("foo:B1"));
    }

    #[test]
    fn identity_cacheability() {
        assert!(CacheIdentity::new(["foo"]).is_cacheable());
        assert!(!CacheIdentity::new(Vec::<String>::new()).is_cacheable());
        assert!(
            !CacheIdentity::new(["foo"])
                .with_max_age(MaxAge::ZERO)
                .is_cacheable()
        );
    }

    #[test]
    fn identity_bin_falls_back_to_default() {
        let identity = CacheIdentity::new(["foo"]);
        assert_eq!(identity.bin_or("render"), "render");
        assert_eq!(identity.with_bin("data").bin_or("render"), "data");
    }
}
