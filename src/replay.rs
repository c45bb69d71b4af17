//! Scenario replay.
//!
//! Replays a scripted sequence of requests against a fresh in-memory cache
//! and reports what each request did and what the bins hold afterwards. Each
//! request looks its identity up first and, on a miss, stores its markup with
//! the post-bubbling cacheability it declares.
//!
//! ```toml
//! start_unix = 1714564800
//!
//! [[requests]]
//! label = "first visit"
//! keys = ["foo"]
//! markup = "<p>B1</p>"
//! values = { b = "B1" }
//! post = { contexts = ["b"] }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use metrics::histogram;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::cache::{
    CacheConfig, CacheIdentity, CacheStore, CacheabilityMetadata, Clock, ContextRegistry,
    FixedContext, MemoryCacheFactory, RedirectResolver, RenderPayload, RequestContext,
    StoreError, StoredValue,
};

const METRIC_REPLAY_MS: &str = "render_cache_replay_ms";

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("failed to read scenario `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse scenario: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("scenario time out of range: {0}")]
    Timestamp(#[from] time::error::ComponentRange),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A scripted sequence of requests.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Scenario {
    /// Unix time the first request is made at.
    pub start_unix: i64,
    pub requests: Vec<ScenarioRequest>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScenarioRequest {
    pub label: Option<String>,
    pub keys: Vec<String>,
    pub bin: Option<String>,
    pub method: String,
    /// Seconds after `start_unix` the request is made at.
    pub at_secs: i64,
    /// Contexts the element declares before rendering.
    pub pre_contexts: Vec<String>,
    /// Context values for this request, by token.
    pub values: BTreeMap<String, String>,
    /// Cacheability bubbled up while rendering.
    pub post: CacheabilityMetadata,
    pub markup: String,
    /// Tags invalidated across every bin before the lookup.
    pub invalidate_tags: BTreeSet<String>,
}

impl Default for ScenarioRequest {
    fn default() -> Self {
        Self {
            label: None,
            keys: Vec::new(),
            bin: None,
            method: "GET".to_string(),
            at_secs: 0,
            pre_contexts: Vec::new(),
            values: BTreeMap::new(),
            post: CacheabilityMetadata::default(),
            markup: String::new(),
            invalidate_tags: BTreeSet::new(),
        }
    }
}

impl ScenarioRequest {
    fn identity(&self) -> CacheIdentity {
        let identity = CacheIdentity::new(self.keys.iter().cloned())
            .with_contexts(self.pre_contexts.iter().cloned());
        match &self.bin {
            Some(bin) => identity.with_bin(bin.clone()),
            None => identity,
        }
    }

    fn contexts(&self) -> ContextRegistry {
        self.values
            .iter()
            .fold(ContextRegistry::new(), |registry, (token, value)| {
                registry.with(token.clone(), FixedContext::new(value.clone()))
            })
    }
}

impl Scenario {
    pub fn from_toml_str(source: &str) -> Result<Self, ReplayError> {
        Ok(toml::from_str(source)?)
    }

    pub fn load(path: &Path) -> Result<Self, ReplayError> {
        let source = std::fs::read_to_string(path).map_err(|source| ReplayError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Hit {
        markup: String,
    },
    Stored {
        bin: String,
        cid: String,
        redirect_cid: Option<String>,
    },
    Uncached,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestReport {
    pub index: usize,
    pub label: Option<String>,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredEntry {
    pub bin: String,
    pub cid: String,
    pub kind: &'static str,
    /// Contexts a redirect points at; empty for payloads.
    pub contexts: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub requests: Vec<RequestReport>,
    pub entries: Vec<StoredEntry>,
}

impl ReplayReport {
    pub fn entry(&self, cid: &str) -> Option<&StoredEntry> {
        self.entries.iter().find(|entry| entry.cid == cid)
    }
}

impl fmt::Display for ReplayReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for request in &self.requests {
            write!(f, "#{}", request.index)?;
            if let Some(label) = &request.label {
                write!(f, " {label}")?;
            }
            match &request.outcome {
                Outcome::Hit { markup } => writeln!(f, ": hit {markup}")?,
                Outcome::Stored {
                    bin,
                    cid,
                    redirect_cid: Some(redirect),
                } => writeln!(f, ": stored {bin}/{cid} via {redirect}")?,
                Outcome::Stored { bin, cid, .. } => writeln!(f, ": stored {bin}/{cid}")?,
                Outcome::Uncached => writeln!(f, ": uncached")?,
            }
        }

        writeln!(f, "entries:")?;
        for entry in &self.entries {
            write!(f, "  {}/{} {}", entry.bin, entry.cid, entry.kind)?;
            if !entry.contexts.is_empty() {
                write!(f, " [{}]", entry.contexts.join(", "))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Replay `scenario` against a fresh in-memory cache.
pub fn run(scenario: &Scenario, config: &CacheConfig) -> Result<ReplayReport, ReplayError> {
    let started = Instant::now();
    let seconds = Arc::new(AtomicI64::new(scenario.start_unix));
    let handle = Arc::clone(&seconds);
    let clock: Clock = Arc::new(move || {
        OffsetDateTime::from_unix_timestamp(handle.load(Ordering::SeqCst))
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    });
    let factory = Arc::new(MemoryCacheFactory::from_config(config).with_clock(clock));
    let resolver = RedirectResolver::new(config.clone(), factory.clone());

    let mut report = ReplayReport::default();
    for (offset, request) in scenario.requests.iter().enumerate() {
        let unix = scenario.start_unix.saturating_add(request.at_secs);
        let now = OffsetDateTime::from_unix_timestamp(unix)?;
        seconds.store(unix, Ordering::SeqCst);

        if !request.invalidate_tags.is_empty() {
            for bin in factory.bin_names() {
                let dropped = factory
                    .memory_bin(&bin)
                    .invalidate_tags(&request.invalidate_tags)?;
                debug!(bin, dropped, tags = ?request.invalidate_tags, "replay invalidation");
            }
        }

        let contexts = request.contexts();
        let context = RequestContext::new(now, &contexts).for_method(&request.method);
        let identity = request.identity();

        let outcome = match resolver.get(&identity, &context) {
            Some(payload) => Outcome::Hit {
                markup: payload.markup,
            },
            None => {
                let payload = RenderPayload::new(request.markup.clone());
                match resolver.set(&identity, &request.post, payload, &context) {
                    Some(write) => Outcome::Stored {
                        bin: write.bin,
                        cid: write.cid,
                        redirect_cid: write.redirect_cid,
                    },
                    None => Outcome::Uncached,
                }
            }
        };

        report.requests.push(RequestReport {
            index: offset + 1,
            label: request.label.clone(),
            outcome,
        });
    }

    for bin in factory.bin_names() {
        let store = factory.memory_bin(&bin);
        for cid in store.cids() {
            let Some(entry) = store.peek(&cid) else {
                continue;
            };
            let (kind, contexts) = match entry.data {
                StoredValue::Payload(_) => ("payload", Vec::new()),
                StoredValue::Redirect(record) => (
                    "redirect",
                    record.cacheability.contexts.into_iter().collect(),
                ),
            };
            report.entries.push(StoredEntry {
                bin: bin.clone(),
                cid,
                kind,
                contexts,
            });
        }
    }

    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    histogram!(METRIC_REPLAY_MS).record(elapsed_ms);
    info!(
        requests = report.requests.len(),
        entries = report.entries.len(),
        elapsed_ms,
        "scenario replayed"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONVERGENCE: &str = r#"
start_unix = 1714564800

[[requests]]
label = "b is B1"
keys = ["foo"]
markup = "<p>B1</p>"
values = { b = "B1" }
post = { contexts = ["b"] }

[[requests]]
label = "b is B2"
keys = ["foo"]
markup = "<p>B2</p>"
values = { b = "B2" }
post = { contexts = ["b"] }

[[requests]]
label = "b is B1 again"
keys = ["foo"]
markup = "<p>unused</p>"
values = { b = "B1" }
post = { contexts = ["b"] }
"#;

    fn replay(source: &str) -> ReplayReport {
        let scenario = Scenario::from_toml_str(source).expect("valid scenario");
        run(&scenario, &CacheConfig::default()).expect("replay")
    }

    #[test]
    fn convergence_scenario_keeps_both_variants() {
        let report = replay(CONVERGENCE);

        assert_eq!(
            report.requests[0].outcome,
            Outcome::Stored {
                bin: "render".into(),
                cid: "foo:[b]=B1".into(),
                redirect_cid: Some("foo".into()),
            }
        );
        assert_eq!(
            report.requests[2].outcome,
            Outcome::Hit {
                markup: "<p>B1</p>".into()
            }
        );

        let redirect = report.entry("foo").expect("redirect entry");
        assert_eq!(redirect.kind, "redirect");
        assert_eq!(redirect.contexts, vec!["b"]);
        assert_eq!(report.entry("foo:[b]=B2").map(|e| e.kind), Some("payload"));
        assert_eq!(report.entries.len(), 3);
    }

    #[test]
    fn requests_default_to_get_and_permanent() {
        let scenario = Scenario::from_toml_str("[[requests]]\nkeys = [\"a\"]\n").expect("parse");
        let request = &scenario.requests[0];

        assert_eq!(request.method, "GET");
        assert!(request.post.is_cacheable());
        assert_eq!(request.at_secs, 0);
    }

    #[test]
    fn expiry_and_invalidation_force_rerender() {
        let report = replay(
            r#"
start_unix = 1000

[[requests]]
keys = ["teaser"]
markup = "v1"
post = { tags = ["node:1"], max-age = 60 }

[[requests]]
keys = ["teaser"]
at_secs = 30
markup = "unused"

[[requests]]
keys = ["teaser"]
at_secs = 60
markup = "v2"
post = { tags = ["node:1"] }

[[requests]]
keys = ["teaser"]
at_secs = 61
markup = "v3"
invalidate_tags = ["node:1"]
"#,
        );

        let outcomes: Vec<_> = report
            .requests
            .iter()
            .map(|request| match &request.outcome {
                Outcome::Hit { .. } => "hit",
                Outcome::Stored { .. } => "stored",
                Outcome::Uncached => "uncached",
            })
            .collect();
        assert_eq!(outcomes, vec!["stored", "hit", "stored", "stored"]);
    }

    #[test]
    fn unsafe_method_is_never_cached() {
        let report = replay("[[requests]]\nkeys = [\"form\"]\nmethod = \"POST\"\n");
        assert_eq!(report.requests[0].outcome, Outcome::Uncached);
        assert!(report.entries.is_empty());
    }

    #[test]
    fn text_report_lists_requests_and_entries() {
        let text = replay(CONVERGENCE).to_string();

        assert!(text.contains("#1 b is B1: stored render/foo:[b]=B1 via foo"));
        assert!(text.contains("#3 b is B1 again: hit <p>B1</p>"));
        assert!(text.contains("  render/foo redirect [b]"));
    }

    #[test]
    fn json_report_tags_outcomes() {
        let json = serde_json::to_value(replay(CONVERGENCE)).expect("serialize");
        assert_eq!(json["requests"][0]["outcome"], "stored");
        assert_eq!(json["requests"][2]["outcome"], "hit");
        assert_eq!(json["entries"][0]["kind"], "redirect");
    }

    #[test]
    fn malformed_scenario_is_a_parse_error() {
        let err = Scenario::from_toml_str("requests = 3").expect_err("must fail");
        assert!(matches!(err, ReplayError::Parse(_)));
    }

    #[test]
    fn missing_scenario_file_is_an_io_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = Scenario::load(&dir.path().join("missing.toml")).expect_err("must fail");
        assert!(matches!(err, ReplayError::Io { .. }));
    }
}
