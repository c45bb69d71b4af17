use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use render_cache::cache::{
    CacheConfig, CacheIdentity, CacheStore, CacheabilityMetadata, Clock, MaxAge,
    MemoryCacheFactory, MemoryStore, RENDERED_TAG, RedirectResolver, RenderPayload, RequestContext,
    StoredValue,
};
use time::OffsetDateTime;
use time::macros::datetime;

const NOW: OffsetDateTime = datetime!(2024-05-01 12:00 UTC);

struct Harness {
    factory: Arc<MemoryCacheFactory>,
    cache: RedirectResolver,
    seconds: Arc<AtomicI64>,
}

impl Harness {
    /// A cache whose stores read time from a manual clock starting at `NOW`.
    fn new() -> Self {
        let seconds = Arc::new(AtomicI64::new(NOW.unix_timestamp()));
        let handle = Arc::clone(&seconds);
        let clock: Clock = Arc::new(move || {
            OffsetDateTime::from_unix_timestamp(handle.load(Ordering::SeqCst))
                .unwrap_or(OffsetDateTime::UNIX_EPOCH)
        });
        let factory = Arc::new(
            MemoryCacheFactory::new(NonZeroUsize::new(128).expect("non-zero capacity"))
                .with_clock(clock),
        );
        let cache = RedirectResolver::new(CacheConfig::default(), factory.clone());
        Self {
            factory,
            cache,
            seconds,
        }
    }

    fn advance(&self, seconds: i64) {
        self.seconds.fetch_add(seconds, Ordering::SeqCst);
    }

    fn render_bin(&self) -> Arc<MemoryStore> {
        self.factory.memory_bin("render")
    }

    fn redirect_contexts(&self, cid: &str) -> BTreeSet<String> {
        match self.render_bin().peek(cid).map(|entry| entry.data) {
            Some(StoredValue::Redirect(record)) => record.cacheability.contexts,
            other => panic!("expected redirect at {cid}, found {other:?}"),
        }
    }
}

fn values(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
    move |token: &str| {
        pairs
            .iter()
            .find(|(name, _)| *name == token)
            .map(|(_, value)| value.to_string())
    }
}

fn contexts(tokens: &[&str]) -> BTreeSet<String> {
    tokens.iter().map(|token| token.to_string()).collect()
}

fn bubbled(tokens: &[&str]) -> CacheabilityMetadata {
    CacheabilityMetadata::new().with_contexts(tokens.iter().copied())
}

#[test]
fn bubbled_context_writes_redirect_and_payload() {
    let harness = Harness::new();
    let resolve = values(&[("b", "B1")]);
    let request = RequestContext::new(NOW, &resolve);
    let foo = CacheIdentity::new(["foo"]);

    let write = harness
        .cache
        .set(&foo, &bubbled(&["b"]), RenderPayload::new("<p>B1</p>"), &request)
        .expect("written");

    assert_eq!(write.cid, "foo:B1");
    assert_eq!(write.redirect_cid.as_deref(), Some("foo"));
    assert_eq!(harness.redirect_contexts("foo"), contexts(&["b"]));
    assert_eq!(harness.render_bin().cids(), vec!["foo", "foo:B1"]);

    let payload = harness.cache.get(&foo, &request).expect("hit");
    assert_eq!(payload.markup, "<p>B1</p>");
}

#[test]
fn second_variant_heals_without_touching_redirect() {
    let harness = Harness::new();
    let foo = CacheIdentity::new(["foo"]);

    let first = values(&[("b", "B1")]);
    let first_request = RequestContext::new(NOW, &first);
    harness
        .cache
        .set(&foo, &bubbled(&["b"]), RenderPayload::new("B1"), &first_request)
        .expect("first write");

    let second = values(&[("b", "B2")]);
    let second_request = RequestContext::new(NOW, &second);
    assert!(harness.cache.get(&foo, &second_request).is_none());
    let write = harness
        .cache
        .set(&foo, &bubbled(&["b"]), RenderPayload::new("B2"), &second_request)
        .expect("second write");

    assert!(!write.redirect_updated);
    assert_eq!(harness.redirect_contexts("foo"), contexts(&["b"]));

    let hit = |request: &RequestContext<'_>| harness.cache.get(&foo, request).map(|p| p.markup);
    assert_eq!(hit(&first_request).as_deref(), Some("B1"));
    assert_eq!(hit(&second_request).as_deref(), Some("B2"));
}

#[test]
fn redirect_contexts_only_grow() {
    let harness = Harness::new();
    let foo = CacheIdentity::new(["foo"]);
    let resolve = values(&[("b", "B1"), ("c", "C1"), ("d", "D1")]);
    let request = RequestContext::new(NOW, &resolve);

    harness
        .cache
        .set(&foo, &bubbled(&["b", "c"]), RenderPayload::new("bc"), &request)
        .expect("write b,c");
    assert_eq!(harness.redirect_contexts("foo"), contexts(&["b", "c"]));

    let write = harness
        .cache
        .set(&foo, &bubbled(&["b", "d"]), RenderPayload::new("bd"), &request)
        .expect("write b,d");
    assert!(write.redirect_updated);
    assert_eq!(write.cid, "foo:B1:C1:D1");
    assert_eq!(harness.redirect_contexts("foo"), contexts(&["b", "c", "d"]));

    // A narrower set never shrinks the record again.
    let write = harness
        .cache
        .set(&foo, &bubbled(&["b"]), RenderPayload::new("b"), &request)
        .expect("write b");
    assert!(!write.redirect_updated);
    assert_eq!(write.cid, "foo:B1:C1:D1");
    assert_eq!(harness.redirect_contexts("foo"), contexts(&["b", "c", "d"]));

    let payload = harness.cache.get(&foo, &request).expect("hit");
    assert_eq!(payload.markup, "b");
}

#[test]
fn matching_contexts_write_directly() {
    let harness = Harness::new();
    let resolve = values(&[("a", "A1")]);
    let request = RequestContext::new(NOW, &resolve);
    let element = CacheIdentity::new(["block", "branding"]).with_contexts(["a"]);

    let write = harness
        .cache
        .set(&element, &bubbled(&["a"]), RenderPayload::new("logo"), &request)
        .expect("written");

    assert!(!write.is_redirected());
    assert_eq!(harness.render_bin().cids(), vec!["block:branding:A1"]);
    let stored = harness.render_bin().peek("block:branding:A1").expect("entry");
    assert!(!stored.data.is_redirect());
    assert!(stored.tags.contains(RENDERED_TAG));
}

#[test]
fn round_trip_preserves_payload() {
    let harness = Harness::new();
    let resolve = values(&[("b", "B1")]);
    let request = RequestContext::new(NOW, &resolve);
    let identity = CacheIdentity::new(["entity_view", "node", "7", "teaser"]);

    let mut payload = RenderPayload::new("<article>teaser</article>");
    payload
        .attachments
        .insert("library".into(), serde_json::json!(["core/drupal"]));
    payload
        .properties
        .insert("#weight".into(), serde_json::json!(3));
    let post = bubbled(&["b"])
        .with_tags(["node:7"])
        .with_max_age(MaxAge::Seconds(600));

    harness
        .cache
        .set(&identity, &post, payload.clone(), &request)
        .expect("written");
    let cached = harness.cache.get(&identity, &request).expect("hit");

    assert_eq!(cached.markup, payload.markup);
    assert_eq!(cached.attachments, payload.attachments);
    assert_eq!(cached.properties, payload.properties);
    assert_eq!(cached.cacheability.contexts, contexts(&["b"]));
    assert_eq!(cached.cacheability.max_age, MaxAge::Seconds(600));
}

#[test]
fn empty_keys_are_never_cached() {
    let harness = Harness::new();
    let resolve = values(&[("b", "B1")]);
    let request = RequestContext::new(NOW, &resolve);
    let keyless = CacheIdentity::new(Vec::<String>::new());

    assert!(harness.cache.get(&keyless, &request).is_none());
    assert!(
        harness
            .cache
            .set(&keyless, &bubbled(&["b"]), RenderPayload::new("x"), &request)
            .is_none()
    );
    assert!(harness.factory.bin_names().is_empty());
}

#[test]
fn tag_invalidation_flushes_redirect_and_payload() {
    let harness = Harness::new();
    let resolve = values(&[("b", "B1")]);
    let request = RequestContext::new(NOW, &resolve);
    let foo = CacheIdentity::new(["foo"]);

    harness
        .cache
        .set(
            &foo,
            &bubbled(&["b"]).with_tags(["node:1"]),
            RenderPayload::new("x"),
            &request,
        )
        .expect("written");

    let dropped = harness
        .render_bin()
        .invalidate_tags(&contexts(&["node:1"]))
        .expect("invalidate");
    assert_eq!(dropped, 2);
    assert!(harness.cache.get(&foo, &request).is_none());
}

#[test]
fn expired_entries_miss_at_read_time() {
    let harness = Harness::new();
    let resolve = values(&[("b", "B1")]);
    let request = RequestContext::new(NOW, &resolve);
    let foo = CacheIdentity::new(["foo"]);

    let write = harness
        .cache
        .set(
            &foo,
            &bubbled(&["b"]).with_max_age(MaxAge::Seconds(60)),
            RenderPayload::new("stale"),
            &request,
        )
        .expect("written");
    assert!(write.is_redirected());

    harness.advance(59);
    assert!(harness.cache.get(&foo, &request).is_some());

    harness.advance(1);
    assert!(harness.cache.get(&foo, &request).is_none());
}
