use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};
use crate::error::EngineError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), EngineError> {
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
        .map_err(|err| {
            EngineError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "lemma_cache_get_total",
            Unit::Count,
            "Coordinator get operations, labelled by outcome (hit/miss)."
        );
        describe_counter!(
            "lemma_cache_set_total",
            Unit::Count,
            "Coordinator set operations, labelled by outcome (ok/failed)."
        );
        describe_counter!(
            "lemma_cache_promotion_total",
            Unit::Count,
            "Entries promoted into a faster layer after a hit."
        );
        describe_counter!(
            "lemma_cache_layer_fault_total",
            Unit::Count,
            "Layer backend faults degraded to misses, labelled by layer."
        );
        describe_counter!(
            "lemma_cache_memory_evict_total",
            Unit::Count,
            "Memory layer evictions due to LRU capacity."
        );
        describe_counter!(
            "lemma_cache_worker_stale_total",
            Unit::Count,
            "Expired entries served by the worker layer within offline grace."
        );
        describe_counter!(
            "lemma_cache_invalidation_batch_total",
            Unit::Count,
            "Invalidation batch executions, labelled by final state."
        );
        describe_counter!(
            "lemma_cache_alert_total",
            Unit::Count,
            "Alerts raised by the performance monitor, labelled by threshold."
        );
        describe_gauge!(
            "lemma_cache_invalidation_queue_len",
            Unit::Count,
            "Pending invalidation executions awaiting the active batch."
        );
        describe_histogram!(
            "lemma_cache_get_ms",
            Unit::Milliseconds,
            "Coordinator get latency in milliseconds."
        );
        describe_histogram!(
            "lemma_cache_set_ms",
            Unit::Milliseconds,
            "Coordinator set latency in milliseconds."
        );
        describe_histogram!(
            "lemma_cache_invalidation_ms",
            Unit::Milliseconds,
            "Invalidation batch latency in milliseconds."
        );
        describe_histogram!(
            "lemma_cache_warm_session_ms",
            Unit::Milliseconds,
            "Warming session duration in milliseconds."
        );
    });
}
