use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the render cache emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "render_cache_hit_total",
            Unit::Count,
            "Total number of render cache lookups answered with a payload."
        );
        describe_counter!(
            "render_cache_miss_total",
            Unit::Count,
            "Total number of render cache lookups that found nothing usable."
        );
        describe_counter!(
            "render_cache_write_total",
            Unit::Count,
            "Total number of payloads written, labelled direct or redirected."
        );
        describe_counter!(
            "render_cache_redirect_write_total",
            Unit::Count,
            "Total number of redirect records created or grown."
        );
        describe_counter!(
            "render_cache_redirect_follow_total",
            Unit::Count,
            "Total number of redirect records followed during lookups."
        );
        describe_counter!(
            "render_cache_degraded_total",
            Unit::Count,
            "Total number of cache operations skipped after a store or context failure."
        );
        describe_counter!(
            "render_cache_evict_total",
            Unit::Count,
            "Total number of in-memory entries evicted due to capacity."
        );
        describe_histogram!(
            "render_cache_replay_ms",
            Unit::Milliseconds,
            "Scenario replay latency in milliseconds."
        );
    });
}
