//! Render cache with cache-context redirection.
//!
//! Before an element renders, only the contexts it declares itself are
//! known; its children may add more while rendering. The element is looked
//! up under its pre-bubbling cache id, but its payload can only be stored
//! under the id that includes every bubbled context. When the two differ, a
//! [`RedirectRecord`] is left at the pre-bubbling id pointing at the full
//! context set.
//!
//! The record's contexts are the union of every context set observed for
//! that id. Requests that exercise different conditional branches therefore
//! converge on one superset instead of overwriting each other's redirect:
//!
//! ```text
//! foo            -> Redirect { contexts: [b] }
//! foo:[b]=B1     -> Payload
//! foo:[b]=B2     -> Payload
//! ```
//!
//! Nothing here is fatal. Store and context failures degrade to a miss on
//! read and a dropped write; rendering proceeds as if nothing were cached.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use metrics::counter;
use tracing::{debug, instrument, warn};

use super::config::{CacheConfig, RENDERED_TAG};
use super::context::RequestContext;
use super::expiry::to_expiry;
use super::keys::{CacheIdentity, ResolvedIdentity};
use super::metadata::CacheabilityMetadata;
use super::payload::{RenderElement, RenderPayload};
use super::store::{CacheEntry, CacheFactory, CacheStore, RedirectRecord, StoredValue};

pub(crate) const METRIC_CACHE_HIT: &str = "render_cache_hit_total";
pub(crate) const METRIC_CACHE_MISS: &str = "render_cache_miss_total";
pub(crate) const METRIC_CACHE_WRITE: &str = "render_cache_write_total";
pub(crate) const METRIC_REDIRECT_WRITE: &str = "render_cache_redirect_write_total";
pub(crate) const METRIC_REDIRECT_FOLLOW: &str = "render_cache_redirect_follow_total";
pub(crate) const METRIC_DEGRADED: &str = "render_cache_degraded_total";

/// Where a payload ended up after [`RedirectResolver::set`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheWrite {
    pub bin: String,
    /// Cache id the payload is stored under.
    pub cid: String,
    /// Pre-bubbling id holding the redirect, when the payload was redirected.
    pub redirect_cid: Option<String>,
    /// Whether this write created or grew the redirect record.
    pub redirect_updated: bool,
}

impl CacheWrite {
    pub fn is_redirected(&self) -> bool {
        self.redirect_cid.is_some()
    }
}

/// Reads and writes rendered payloads, maintaining redirect records.
pub struct RedirectResolver {
    config: CacheConfig,
    factory: Arc<dyn CacheFactory>,
}

impl RedirectResolver {
    pub fn new(config: CacheConfig, factory: Arc<dyn CacheFactory>) -> Self {
        Self { config, factory }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up the payload cached for `identity`, following redirects.
    ///
    /// Returns `None` on a miss and whenever the item or request is not
    /// cacheable.
    #[instrument(level = "debug", skip_all, fields(keys = ?identity.keys))]
    pub fn get(&self, identity: &CacheIdentity, request: &RequestContext<'_>) -> Option<RenderPayload> {
        if !self.accepts(identity, request) {
            return None;
        }

        let mut target = identity.clone();
        let mut visited = HashSet::new();
        for hop in 0..=self.config.max_redirect_hops {
            let bin = target.bin_or(&self.config.default_bin).to_string();
            let (cid, _) = self.cache_id(&target.keys, &target.cacheability.contexts, request)?;
            if !visited.insert((bin.clone(), cid.clone())) {
                warn!(bin, cid, hops = hop, "render cache redirect cycle, treating as miss");
                degraded("redirect_cycle");
                return None;
            }

            let store = self.store(&bin)?;
            let entry = match store.get(&cid) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    debug!(bin, cid, hops = hop, outcome = "miss", "render cache lookup");
                    counter!(METRIC_CACHE_MISS).increment(1);
                    return None;
                }
                Err(error) => {
                    warn!(bin, cid, error = %error, "render cache read failed, treating as miss");
                    degraded("store_get");
                    return None;
                }
            };

            match entry.data {
                StoredValue::Payload(payload) => {
                    debug!(bin, cid, hops = hop, outcome = "hit", "render cache lookup");
                    counter!(METRIC_CACHE_HIT).increment(1);
                    return Some(payload);
                }
                StoredValue::Redirect(record) if record.is_consistent() => {
                    debug!(
                        bin,
                        cid,
                        hops = hop,
                        contexts = ?record.cacheability.contexts,
                        "following render cache redirect"
                    );
                    counter!(METRIC_REDIRECT_FOLLOW).increment(1);
                    target = record.target();
                }
                StoredValue::Redirect(_) => {
                    warn!(bin, cid, "inconsistent redirect record, treating as miss");
                    degraded("inconsistent_redirect");
                    counter!(METRIC_CACHE_MISS).increment(1);
                    return None;
                }
            }
        }

        warn!(
            max_hops = self.config.max_redirect_hops,
            "render cache redirect chain too long, treating as miss"
        );
        degraded("redirect_hops");
        None
    }

    /// Store `payload` for an element whose subtree has finished rendering.
    ///
    /// `pre` is the identity the element was looked up with; `post` is the
    /// cacheability bubbled up from its subtree. Returns where the payload
    /// was stored, or `None` when nothing was written.
    #[instrument(level = "debug", skip_all, fields(keys = ?pre.keys))]
    pub fn set(
        &self,
        pre: &CacheIdentity,
        post: &CacheabilityMetadata,
        payload: RenderPayload,
        request: &RequestContext<'_>,
    ) -> Option<CacheWrite> {
        if !self.accepts(pre, request) || !post.is_cacheable() {
            debug!("render cache write skipped, element is not cacheable");
            return None;
        }

        let bin = pre.bin_or(&self.config.default_bin).to_string();
        let store = self.store(&bin)?;
        let (pre_cid, _) = self.cache_id(&pre.keys, &pre.cacheability.contexts, request)?;

        let mut data = pre.cacheability.merge(post);
        let (mut cid, implied) = self.cache_id(&pre.keys, &data.contexts, request)?;
        data = data.merge(&implied);
        if !data.is_cacheable() {
            debug!(cid, "render cache write skipped, contexts made element uncacheable");
            return None;
        }

        let redirected = pre_cid != cid;
        let mut redirect_updated = false;
        let mut target_bin = bin.clone();
        let mut target_store = Arc::clone(&store);

        if redirected {
            let existing = self.stored_redirect(store.as_ref(), &bin, &pre_cid);
            let stored = existing
                .as_ref()
                .map(|record| record.cacheability.clone())
                .unwrap_or_default();
            let union = data.merge(&stored);

            if union.contexts != stored.contexts {
                // Keys and bin belong to whoever created the record first.
                let (keys, record_bin) = match existing {
                    Some(record) => (record.keys, record.bin),
                    None => (pre.keys.clone(), bin.clone()),
                };
                let entry = CacheEntry {
                    tags: with_rendered_tag(&union.tags),
                    expiry: to_expiry(union.max_age, request.now),
                    data: StoredValue::Redirect(RedirectRecord {
                        keys,
                        cacheability: union.clone(),
                        bin: record_bin.clone(),
                    }),
                };
                redirect_updated = self.write(store.as_ref(), &bin, &pre_cid, entry);
                if redirect_updated {
                    debug!(
                        bin,
                        cid = pre_cid,
                        contexts = ?union.contexts,
                        "render cache redirect written"
                    );
                    counter!(METRIC_REDIRECT_WRITE).increment(1);
                }
                if record_bin != bin {
                    target_store = self.store(&record_bin)?;
                    target_bin = record_bin;
                }
            } else if let Some(record) = existing.filter(|record| record.bin != bin) {
                target_store = self.store(&record.bin)?;
                target_bin = record.bin;
            }

            // The record knows contexts this request did not exercise; store
            // under the full set so the redirect lands on this entry.
            if union.contexts != data.contexts {
                data.contexts = union.contexts;
                let (union_cid, implied) = self.cache_id(&pre.keys, &data.contexts, request)?;
                data = data.merge(&implied);
                cid = union_cid;
                if !data.is_cacheable() {
                    debug!(cid, "render cache write skipped, contexts made element uncacheable");
                    return None;
                }
            }
        }

        let entry = CacheEntry {
            tags: with_rendered_tag(&data.tags),
            expiry: to_expiry(data.max_age, request.now),
            data: StoredValue::Payload(RenderPayload {
                cacheability: data,
                ..payload
            }),
        };
        if !self.write(target_store.as_ref(), &target_bin, &cid, entry) {
            return None;
        }

        let kind = if redirected { "redirected" } else { "direct" };
        debug!(bin = target_bin, cid, kind, "render cache payload written");
        counter!(METRIC_CACHE_WRITE, "kind" => kind).increment(1);

        Some(CacheWrite {
            bin: target_bin,
            cid,
            redirect_cid: redirected.then_some(pre_cid),
            redirect_updated,
        })
    }

    /// Store a rendered element, using its bubbled cacheability as the
    /// post-bubbling metadata.
    pub fn set_element(
        &self,
        pre: &CacheIdentity,
        element: &RenderElement,
        request: &RequestContext<'_>,
    ) -> Option<CacheWrite> {
        let payload = element.cacheable_payload();
        self.set(pre, &element.cacheability, payload, request)
    }

    fn accepts(&self, identity: &CacheIdentity, request: &RequestContext<'_>) -> bool {
        self.config.enabled && request.cacheable_method && identity.is_cacheable()
    }

    /// Cache id for `keys` under `tokens`, plus the cacheability the
    /// resolved contexts imply.
    fn cache_id(
        &self,
        keys: &[String],
        tokens: &BTreeSet<String>,
        request: &RequestContext<'_>,
    ) -> Option<(String, CacheabilityMetadata)> {
        let resolved = match request.resolver.resolve(tokens) {
            Ok(resolved) => resolved,
            Err(error) => {
                warn!(error = %error, "cache contexts not resolvable, skipping render cache");
                degraded("context");
                return None;
            }
        };
        let cid = ResolvedIdentity::new(keys.to_vec(), resolved.fragments)
            .cid()
            .ok()?;
        Some((cid, resolved.cacheability))
    }

    fn store(&self, bin: &str) -> Option<Arc<dyn CacheStore>> {
        match self.factory.bin(bin) {
            Ok(store) => Some(store),
            Err(error) => {
                warn!(bin, error = %error, "render cache bin unavailable");
                degraded("bin");
                None
            }
        }
    }

    fn stored_redirect(&self, store: &dyn CacheStore, bin: &str, cid: &str) -> Option<RedirectRecord> {
        match store.get(cid) {
            Ok(Some(CacheEntry {
                data: StoredValue::Redirect(record),
                ..
            })) if record.is_consistent() => Some(record),
            Ok(Some(CacheEntry {
                data: StoredValue::Redirect(_),
                ..
            })) => {
                warn!(bin, cid, "inconsistent redirect record, replacing it");
                degraded("inconsistent_redirect");
                None
            }
            Ok(_) => None,
            Err(error) => {
                warn!(bin, cid, error = %error, "redirect record read failed");
                degraded("store_get");
                None
            }
        }
    }

    fn write(&self, store: &dyn CacheStore, bin: &str, cid: &str, entry: CacheEntry) -> bool {
        match store.set(cid, entry) {
            Ok(()) => true,
            Err(error) => {
                warn!(bin, cid, error = %error, "render cache write dropped");
                degraded("store_set");
                false
            }
        }
    }
}

fn with_rendered_tag(tags: &BTreeSet<String>) -> BTreeSet<String> {
    let mut tags = tags.clone();
    tags.insert(RENDERED_TAG.to_string());
    tags
}

fn degraded(reason: &'static str) {
    counter!(METRIC_DEGRADED, "reason" => reason).increment(1);
}
