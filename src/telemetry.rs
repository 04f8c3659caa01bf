use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Installs the global tracing subscriber. `RUST_LOG` wins over the
/// configured level when set.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = fmt().with_env_filter(filter).with_target(false);
    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Installs the global metrics recorder and returns the handle that renders
/// the Prometheus text served at `/metrics`.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe();
    Ok(handle)
}

fn describe() {
    metrics::describe_counter!("tally_tasks_total", "Tasks resolved by consumers, by queue and outcome");
    metrics::describe_histogram!(
        "tally_task_duration_seconds",
        metrics::Unit::Seconds,
        "Time spent handling one delivery"
    );
    metrics::describe_counter!("tally_intake_total", "Intake submissions by kind and outcome (accepted, rejected, broker_error)");
}
