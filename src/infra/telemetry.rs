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

/// Per-statement sqlx logs and redis driver chatter drown out cache events at
/// debug level.
const QUIET_DIRECTIVES: &[&str] = &["sqlx::query=warn", "redis=info"];

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let mut env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();
    for directive in QUIET_DIRECTIVES {
        let directive = directive.parse().map_err(|err| {
            InfraError::telemetry(format!("invalid log directive `{directive}`: {err}"))
        })?;
        env_filter = env_filter.add_directive(directive);
    }

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
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "balcao_cache_hit_total",
            Unit::Count,
            "Total number of cache hits, labelled by tier."
        );
        describe_counter!(
            "balcao_cache_miss_total",
            Unit::Count,
            "Total number of lookups that missed both tiers."
        );
        describe_counter!(
            "balcao_cache_distributed_error_total",
            Unit::Count,
            "Distributed tier operations that failed and were degraded."
        );
        describe_counter!(
            "balcao_cache_invalidated_total",
            Unit::Count,
            "Keys removed by pattern invalidation or namespace clears."
        );
        describe_counter!(
            "balcao_cache_policy_lookup_error_total",
            Unit::Count,
            "Endpoint policy lookups that fell back to the default policy."
        );
        describe_counter!(
            "balcao_cache_event_dropped_total",
            Unit::Count,
            "Total number of cache events dropped due to buffer overflow."
        );
        describe_counter!(
            "balcao_redis_reconnect_total",
            Unit::Count,
            "Reconnect attempts made against the distributed tier."
        );
        describe_histogram!(
            "balcao_cache_warm_ms",
            Unit::Milliseconds,
            "Cache warmup latency in milliseconds."
        );
    });
}
