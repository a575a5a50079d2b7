use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
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
        describe_gauge!(
            "jsbrain_pool_slots",
            Unit::Count,
            "Session slots currently allocated in this worker's pool."
        );
        describe_gauge!(
            "jsbrain_pool_busy",
            Unit::Count,
            "Session slots currently held by a render job."
        );
        describe_counter!(
            "jsbrain_pool_exhausted_total",
            Unit::Count,
            "Acquisitions rejected because every slot was busy."
        );
        describe_counter!(
            "jsbrain_pool_sessions_opened_total",
            Unit::Count,
            "Browser sessions opened for new or reclaimed slots."
        );
        describe_counter!(
            "jsbrain_pool_open_failures_total",
            Unit::Count,
            "Browser session opens that failed or timed out."
        );
        describe_counter!(
            "jsbrain_pool_sessions_reclaimed_total",
            Unit::Count,
            "Idle browser sessions closed after the grace period."
        );
        describe_histogram!(
            "jsbrain_render_ms",
            Unit::Milliseconds,
            "Render job latency in milliseconds."
        );
        describe_counter!(
            "jsbrain_render_failures_total",
            Unit::Count,
            "Render jobs that ended with an error, labelled by kind."
        );
        describe_counter!(
            "jsbrain_render_rejected_total",
            Unit::Count,
            "Render jobs turned away by the concurrent render limit."
        );
        describe_counter!(
            "jsbrain_worker_launch_failures_total",
            Unit::Count,
            "Worker launches that failed and were scheduled for retry."
        );
        describe_counter!(
            "jsbrain_worker_restarts_total",
            Unit::Count,
            "Worker processes respawned by the supervisor."
        );
    });
}
