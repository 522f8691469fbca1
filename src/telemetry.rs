use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};
use crate::error::TelemetryError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), TelemetryError> {
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
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| TelemetryError::Subscriber(err.to_string()))
}

/// Register descriptions for every metric this crate emits. Safe to call
/// repeatedly; only the first call registers.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "cachesync_cache_hit_total",
            Unit::Count,
            "Reads served from a dataset cache, tombstones included."
        );
        describe_counter!(
            "cachesync_cache_miss_total",
            Unit::Count,
            "Reads that had to load from the dataset store."
        );
        describe_counter!(
            "cachesync_full_reload_total",
            Unit::Count,
            "Full reloads of a single dataset cache."
        );
        describe_counter!(
            "cachesync_changelog_appended_total",
            Unit::Count,
            "Change-log records appended to the store."
        );
        describe_counter!(
            "cachesync_changelog_append_failed_total",
            Unit::Count,
            "Change-log records dropped because the append failed."
        );
        describe_gauge!(
            "cachesync_changelog_pending",
            Unit::Count,
            "Change-log records enqueued but not yet appended."
        );
        describe_counter!(
            "cachesync_reconcile_failed_total",
            Unit::Count,
            "Reconcile cycles aborted by a scan or apply failure."
        );
        describe_counter!(
            "cachesync_reconcile_full_reload_total",
            Unit::Count,
            "Reconcile cycles that reloaded every dataset after exhausting retries."
        );
        describe_histogram!(
            "cachesync_reconcile_cycle_ms",
            Unit::Milliseconds,
            "Reconcile cycle latency in milliseconds."
        );
    });
}
