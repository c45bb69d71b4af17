//! Render cache.
//!
//! Rendered fragments are cached under ids built from their keys and the
//! cache contexts they vary by. Contexts added while rendering are only
//! known afterwards, so the cache is two-tier:
//!
//! - **Pre-bubbling id**: keys plus the element's own contexts. Holds the
//!   payload directly, or a redirect record when more contexts bubbled up.
//! - **Final id**: keys plus every context the subtree reported. Holds the
//!   payload.
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `render-cache.toml`:
//!
//! ```toml
//! [cache]
//! enabled = true
//! default_bin = "render"
//! max_redirect_hops = 5
//! memory_capacity = 1000
//! ```

mod config;
mod context;
mod expiry;
mod keys;
mod lock;
mod metadata;
mod payload;
mod redirect;
mod registry;
mod store;

pub use config::{CacheConfig, RENDERED_TAG};
pub use context::{
    CacheContext, ContextError, ContextRegistry, ContextResolver, FixedContext, RequestContext,
    ResolvedContexts,
};
pub use expiry::{Expiry, to_expiry};
pub use keys::{CID_DELIMITER, CacheIdentity, KeyError, ResolvedIdentity, build_id};
pub use metadata::{CacheabilityMetadata, MaxAge, MaxAgeError, PERMANENT_RAW};
pub use payload::{RenderElement, RenderPayload};
pub use redirect::{CacheWrite, RedirectResolver};
pub use registry::TagRegistry;
pub use store::{
    CacheEntry, CacheFactory, CacheStore, Clock, MemoryCacheFactory, MemoryStore, RedirectRecord,
    StoreError, StoredValue, system_clock,
};
