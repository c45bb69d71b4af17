//! Cache store interface and the in-memory bin implementation.
//!
//! The resolver only ever talks to [`CacheStore`] through a
//! [`CacheFactory`], which hands out one store per bin. [`MemoryStore`] is an
//! LRU-bounded store with tag invalidation and age-based expiry.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};

use lru::LruCache;
use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;

use super::config::CacheConfig;
use super::expiry::Expiry;
use super::keys::CacheIdentity;
use super::lock::{rw_read, rw_write};
use super::metadata::CacheabilityMetadata;
use super::payload::RenderPayload;
use super::registry::TagRegistry;

const SOURCE: &str = "cache::store";
pub(crate) const METRIC_CACHE_EVICT: &str = "render_cache_evict_total";

/// Indirection stored under a pre-bubbling cache id.
///
/// Points at the context-complete identity the payload actually lives
/// under. Contexts only ever grow across writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectRecord {
    pub keys: Vec<String>,
    pub cacheability: CacheabilityMetadata,
    pub bin: String,
}

impl RedirectRecord {
    /// A record without keys or bin cannot be followed.
    pub fn is_consistent(&self) -> bool {
        !self.keys.is_empty() && !self.bin.is_empty()
    }

    /// Identity to look up next when following this record.
    pub fn target(&self) -> CacheIdentity {
        CacheIdentity::new(self.keys.iter().cloned())
            .with_contexts(self.cacheability.contexts.iter().cloned())
            .with_bin(self.bin.clone())
    }
}

/// Either a rendered payload or a redirect to one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredValue {
    Payload(RenderPayload),
    Redirect(RedirectRecord),
}

impl StoredValue {
    pub fn is_redirect(&self) -> bool {
        matches!(self, StoredValue::Redirect(_))
    }
}

/// One stored item with its invalidation tags and expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub data: StoredValue,
    pub tags: BTreeSet<String>,
    pub expiry: Expiry,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("cache bin `{bin}` is unavailable: {message}")]
    Unavailable { bin: String, message: String },
    #[error("unknown cache bin `{0}`")]
    UnknownBin(String),
}

impl StoreError {
    pub fn unavailable(bin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            bin: bin.into(),
            message: message.into(),
        }
    }
}

/// Key/value store for one cache bin.
///
/// Implementations are shared between concurrent requests. The resolver
/// never holds a lock across calls, so a read followed by a write is not
/// atomic and the last writer wins.
pub trait CacheStore: Send + Sync {
    fn get(&self, cid: &str) -> Result<Option<CacheEntry>, StoreError>;

    fn set(&self, cid: &str, entry: CacheEntry) -> Result<(), StoreError>;

    fn delete(&self, cid: &str) -> Result<(), StoreError>;

    /// Drop every entry carrying any of `tags`; returns how many were dropped.
    fn invalidate_tags(&self, tags: &BTreeSet<String>) -> Result<usize, StoreError>;
}

/// Hands out the store backing a named bin.
pub trait CacheFactory: Send + Sync {
    fn bin(&self, name: &str) -> Result<Arc<dyn CacheStore>, StoreError>;
}

/// Source of the current time for expiry checks.
pub type Clock = Arc<dyn Fn() -> OffsetDateTime + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(OffsetDateTime::now_utc)
}

/// LRU-bounded in-memory store for a single bin.
pub struct MemoryStore {
    bin: String,
    entries: RwLock<LruCache<String, CacheEntry>>,
    tags: TagRegistry,
    clock: Clock,
}

impl MemoryStore {
    pub fn new(bin: impl Into<String>, capacity: NonZeroUsize) -> Self {
        Self {
            bin: bin.into(),
            entries: RwLock::new(LruCache::new(capacity)),
            tags: TagRegistry::new(),
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Look at an entry without touching recency or expiry.
    pub fn peek(&self, cid: &str) -> Option<CacheEntry> {
        rw_read(&self.entries, SOURCE, "peek").peek(cid).cloned()
    }

    /// All stored cache ids, sorted.
    pub fn cids(&self) -> Vec<String> {
        let mut cids: Vec<String> = rw_read(&self.entries, SOURCE, "cids")
            .iter()
            .map(|(cid, _)| cid.clone())
            .collect();
        cids.sort();
        cids
    }

    pub fn tag_registry(&self) -> &TagRegistry {
        &self.tags
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("bin", &self.bin)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, cid: &str) -> Result<Option<CacheEntry>, StoreError> {
        let now = (self.clock)();
        let mut entries = rw_write(&self.entries, SOURCE, "get");
        match entries.get(cid) {
            None => return Ok(None),
            Some(entry) if !entry.expiry.is_expired(now) => return Ok(Some(entry.clone())),
            Some(_) => {}
        }

        entries.pop(cid);
        self.tags.unregister(cid);
        drop(entries);
        debug!(bin = %self.bin, cid, "dropped expired render cache entry");
        Ok(None)
    }

    fn set(&self, cid: &str, entry: CacheEntry) -> Result<(), StoreError> {
        let tags = entry.tags.clone();
        // The tag index is only touched under the entries lock, so it always
        // describes the entry currently stored.
        let mut entries = rw_write(&self.entries, SOURCE, "set");
        let displaced = entries.push(cid.to_string(), entry);

        let evicted = displaced
            .filter(|(displaced_cid, _)| displaced_cid != cid)
            .map(|(evicted, _)| evicted);
        if let Some(evicted) = &evicted {
            self.tags.unregister(evicted);
        }
        self.tags.register(cid, &tags);
        drop(entries);

        if let Some(evicted) = evicted {
            counter!(METRIC_CACHE_EVICT, "bin" => self.bin.clone()).increment(1);
            debug!(bin = %self.bin, cid = %evicted, "evicted render cache entry");
        }
        Ok(())
    }

    fn delete(&self, cid: &str) -> Result<(), StoreError> {
        let mut entries = rw_write(&self.entries, SOURCE, "delete");
        entries.pop(cid);
        self.tags.unregister(cid);
        Ok(())
    }

    fn invalidate_tags(&self, tags: &BTreeSet<String>) -> Result<usize, StoreError> {
        let mut entries = rw_write(&self.entries, SOURCE, "invalidate_tags");
        let affected = self.tags.take_tagged(tags);
        let dropped = affected
            .iter()
            .filter(|cid| entries.pop(cid.as_str()).is_some())
            .count();
        debug!(bin = %self.bin, dropped, "invalidated render cache tags");
        Ok(dropped)
    }
}

/// Creates one [`MemoryStore`] per bin on first use.
pub struct MemoryCacheFactory {
    capacity: NonZeroUsize,
    clock: Clock,
    bins: RwLock<HashMap<String, Arc<MemoryStore>>>,
}

impl MemoryCacheFactory {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            clock: system_clock(),
            bins: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.memory_capacity_non_zero())
    }

    /// Clock shared by every bin created afterwards.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// The concrete store behind `name`, created if missing.
    pub fn memory_bin(&self, name: &str) -> Arc<MemoryStore> {
        if let Some(store) = rw_read(&self.bins, SOURCE, "memory_bin.read").get(name) {
            return Arc::clone(store);
        }

        let mut bins = rw_write(&self.bins, SOURCE, "memory_bin.write");
        let store = bins.entry(name.to_string()).or_insert_with(|| {
            Arc::new(MemoryStore::new(name, self.capacity).with_clock(Arc::clone(&self.clock)))
        });
        Arc::clone(store)
    }

    /// Names of bins created so far, sorted.
    pub fn bin_names(&self) -> Vec<String> {
        let mut names: Vec<String> = rw_read(&self.bins, SOURCE, "bin_names")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl fmt::Debug for MemoryCacheFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCacheFactory")
            .field("capacity", &self.capacity)
            .field("bins", &self.bin_names())
            .finish_non_exhaustive()
    }
}

impl CacheFactory for MemoryCacheFactory {
    fn bin(&self, name: &str) -> Result<Arc<dyn CacheStore>, StoreError> {
        let store: Arc<dyn CacheStore> = self.memory_bin(name);
        Ok(store)
    }
}
