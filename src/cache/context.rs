//! Cache context resolution.
//!
//! Context tokens such as `user.roles` or `url.query_args:page` name a
//! dimension a rendering varies by. Resolving them for the current request
//! yields the key fragments that go into the cache id, plus any cacheability
//! the contexts themselves carry.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use thiserror::Error;
use time::OffsetDateTime;

use super::metadata::CacheabilityMetadata;

/// Separates a context name from its parameter in a token.
const PARAMETER_SEPARATOR: char = ':';

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("unknown cache context `{0}`")]
    Unknown(String),
}

/// Fragments and implied cacheability for a set of context tokens.
///
/// Merging `cacheability` back into the element is the caller's job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedContexts {
    pub fragments: Vec<String>,
    pub cacheability: CacheabilityMetadata,
}

/// Maps context tokens to request-specific key fragments.
pub trait ContextResolver {
    fn resolve(&self, tokens: &BTreeSet<String>) -> Result<ResolvedContexts, ContextError>;
}

/// A plain function from token to fragment resolves contexts that carry no
/// cacheability of their own. `None` marks an unknown token.
impl<F> ContextResolver for F
where
    F: Fn(&str) -> Option<String>,
{
    fn resolve(&self, tokens: &BTreeSet<String>) -> Result<ResolvedContexts, ContextError> {
        let fragments = tokens
            .iter()
            .map(|token| {
                self(token.as_str()).ok_or_else(|| ContextError::Unknown(token.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ResolvedContexts {
            fragments,
            cacheability: CacheabilityMetadata::default(),
        })
    }
}

/// A single named cache context.
pub trait CacheContext: Send + Sync {
    /// Value of this context for the current request.
    fn key(&self, parameter: Option<&str>) -> String;

    /// Cacheability the context value itself depends on.
    fn cacheability(&self, _parameter: Option<&str>) -> CacheabilityMetadata {
        CacheabilityMetadata::default()
    }
}

/// A context whose value is fixed for the lifetime of the registry, e.g. one
/// built per request from already-known request attributes.
#[derive(Debug, Clone)]
pub struct FixedContext {
    value: String,
    cacheability: CacheabilityMetadata,
}

impl FixedContext {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            cacheability: CacheabilityMetadata::default(),
        }
    }

    pub fn with_cacheability(mut self, cacheability: CacheabilityMetadata) -> Self {
        self.cacheability = cacheability;
        self
    }
}

impl CacheContext for FixedContext {
    fn key(&self, _parameter: Option<&str>) -> String {
        self.value.clone()
    }

    fn cacheability(&self, _parameter: Option<&str>) -> CacheabilityMetadata {
        self.cacheability.clone()
    }
}

/// Registry of named cache contexts.
///
/// Tokens are `name` or `name:parameter`. Fragments are rendered as
/// `[token]=value` so that different contexts with equal values never
/// collide.
#[derive(Default)]
pub struct ContextRegistry {
    contexts: HashMap<String, Box<dyn CacheContext>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, context: impl CacheContext + 'static) {
        self.contexts.insert(name.into(), Box::new(context));
    }

    pub fn with(mut self, name: impl Into<String>, context: impl CacheContext + 'static) -> Self {
        self.register(name, context);
        self
    }

    fn lookup<'t>(
        &self,
        token: &'t str,
    ) -> Result<(&dyn CacheContext, Option<&'t str>), ContextError> {
        let (name, parameter) = parse_token(token);
        self.contexts
            .get(name)
            .map(|context| (context.as_ref(), parameter))
            .ok_or_else(|| ContextError::Unknown(token.to_string()))
    }

    /// Drop tokens already covered by an ancestor token.
    ///
    /// `user` covers `user.roles`, and `route` covers `route:node`. A
    /// context that is itself uncacheable (max-age zero) is never dropped.
    pub fn optimize_tokens(
        &self,
        tokens: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, ContextError> {
        let mut optimized = BTreeSet::new();
        for token in tokens {
            let covered = ancestors(token).any(|ancestor| tokens.contains(ancestor));
            if covered {
                let (context, parameter) = self.lookup(token)?;
                if context.cacheability(parameter).is_cacheable() {
                    continue;
                }
            }
            optimized.insert(token.clone());
        }
        Ok(optimized)
    }
}

impl fmt::Debug for ContextRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.contexts.keys().collect();
        names.sort();
        f.debug_struct("ContextRegistry")
            .field("contexts", &names)
            .finish()
    }
}

impl ContextResolver for ContextRegistry {
    fn resolve(&self, tokens: &BTreeSet<String>) -> Result<ResolvedContexts, ContextError> {
        let optimized = self.optimize_tokens(tokens)?;
        let mut resolved = ResolvedContexts::default();
        for token in &optimized {
            let (context, parameter) = self.lookup(token)?;
            resolved
                .fragments
                .push(format!("[{token}]={}", context.key(parameter)));
            resolved.cacheability = resolved.cacheability.merge(&context.cacheability(parameter));
        }
        Ok(resolved)
    }
}

fn parse_token(token: &str) -> (&str, Option<&str>) {
    match token.split_once(PARAMETER_SEPARATOR) {
        Some((name, parameter)) => (name, Some(parameter)),
        None => (token, None),
    }
}

/// Every strictly shorter token that covers `token`.
fn ancestors(token: &str) -> impl Iterator<Item = &str> {
    let (name, parameter) = parse_token(token);
    let unparameterized = parameter.map(|_| name);
    let dotted = name
        .match_indices('.')
        .map(move |(index, _)| &name[..index]);
    unparameterized.into_iter().chain(dotted)
}

/// Per-request inputs to the resolver.
///
/// `now` is read once at the start of the request so every write in the
/// request shares one expiry base.
#[derive(Clone, Copy)]
pub struct RequestContext<'a> {
    pub now: OffsetDateTime,
    pub resolver: &'a dyn ContextResolver,
    /// Only safe methods (`GET`, `HEAD`) read or write the render cache.
    pub cacheable_method: bool,
}

impl<'a> RequestContext<'a> {
    pub fn new(now: OffsetDateTime, resolver: &'a dyn ContextResolver) -> Self {
        Self {
            now,
            resolver,
            cacheable_method: true,
        }
    }

    /// Set method cacheability from an HTTP method name.
    pub fn for_method(mut self, method: &str) -> Self {
        self.cacheable_method =
            method.eq_ignore_ascii_case("GET") || method.eq_ignore_ascii_case("HEAD");
        self
    }
}

impl fmt::Debug for RequestContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("now", &self.now)
            .field("cacheable_method", &self.cacheable_method)
            .finish_non_exhaustive()
    }
}
