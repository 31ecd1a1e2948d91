use crate::config::{LogFormat, TelemetryConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Install the tracing subscriber and, when enabled, the Prometheus
/// exporter. Call once at process start, before any collection work.
pub fn init(config: &TelemetryConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = match config.log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_target(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    // Every log line from a worker shares this process context, which is
    // what distinguishes overlapping deployments writing to one sink.
    tracing::info!(
        pid = std::process::id(),
        host = hostname().as_deref().unwrap_or("unknown"),
        "Telemetry initialized"
    );

    if config.metrics_enabled {
        let addr: SocketAddr = ([0, 0, 0, 0], config.metrics_port).into();
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| anyhow::anyhow!("failed to start metrics exporter: {e}"))?;

        tracing::info!(
            port = config.metrics_port,
            "Prometheus metrics exposed on /metrics"
        );
    }

    Ok(())
}

/// Best-effort host name for log context.
fn hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.is_empty())
}

pub fn shutdown() {
    tracing::info!("Telemetry shut down");
}
