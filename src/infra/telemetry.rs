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

/// Install the global tracing subscriber for the `hearth` binary.
///
/// `RUST_LOG` directives take precedence over `logging.level`.
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
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| InfraError::telemetry(format!("tracing subscriber already set: {err}")))
}

/// Register units and help text for every metric the crate emits. Safe to
/// call more than once.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "hearth_cache_hit_total",
            Unit::Count,
            "Queries served from a fresh cache entry."
        );
        describe_counter!(
            "hearth_cache_miss_total",
            Unit::Count,
            "Queries that had to go to the network."
        );
        describe_counter!(
            "hearth_cache_stale_marked_total",
            Unit::Count,
            "Cache entries flipped to stale by invalidation."
        );
        describe_counter!(
            "hearth_cache_evict_total",
            Unit::Count,
            "Unobserved cache entries evicted by garbage collection."
        );
        describe_counter!(
            "hearth_fetch_deduplicated_total",
            Unit::Count,
            "Fetches that joined an outstanding request for the same identity."
        );
        describe_counter!(
            "hearth_mutation_total",
            Unit::Count,
            "Mutations by outcome (confirmed, rolled_back, invalid)."
        );
        describe_histogram!(
            "hearth_mutation_ms",
            Unit::Milliseconds,
            "Time from optimistic write to settle, in milliseconds."
        );
        describe_counter!(
            "hearth_feed_event_total",
            Unit::Count,
            "Change-feed activity by outcome (invalidated, ignored, disconnected, open_failed)."
        );
    });
}
