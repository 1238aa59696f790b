use crate::config::{LogFormat, TelemetryConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Dependencies that log every statement or connection at `info`.
const QUIET_TARGETS: &[&str] = &["sqlx", "hyper", "hyper_util", "reqwest", "h2"];

/// Filter directives for a configured level. A bare level also turns the
/// chattiest dependencies down to `warn`; anything with a target
/// (`syncer=debug,sqlx=info`) is taken as-is.
pub fn filter_directives(level: &str) -> String {
    let level = level.trim();
    if level.contains('=') || level.contains(',') {
        return level.to_string();
    }

    let mut directives = vec![level.to_string()];
    directives.extend(QUIET_TARGETS.iter().map(|target| format!("{target}=warn")));
    directives.join(",")
}

/// Installs the global subscriber and, when enabled, the Prometheus
/// exporter. Every exported metric carries a `service` label.
pub fn init(service: &'static str, config: &TelemetryConfig) -> anyhow::Result<()> {
    // RUST_LOG wins over the configured level
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_directives(&config.log_level)))?;

    let fmt_layer = match config.log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
        LogFormat::Pretty => fmt::layer().compact().with_target(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    if config.metrics_enabled {
        let addr: SocketAddr = ([0, 0, 0, 0], config.metrics_port).into();
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .add_global_label("service", service)
            .install()?;
    }

    tracing::info!(
        service,
        version = env!("CARGO_PKG_VERSION"),
        metrics_port = ?config.metrics_enabled.then_some(config.metrics_port),
        "Telemetry initialized"
    );

    Ok(())
}

pub fn shutdown(service: &'static str) {
    tracing::info!(service, "Shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn bare_level_quiets_dependencies() {
        assert_eq!(
            filter_directives("info"),
            "info,sqlx=warn,hyper=warn,hyper_util=warn,reqwest=warn,h2=warn"
        );
        assert!(EnvFilter::try_new(filter_directives("debug")).is_ok());
    }

    #[test]
    fn explicit_directives_are_kept() {
        assert_eq!(filter_directives("syncer=debug,sqlx=info"), "syncer=debug,sqlx=info");
        assert_eq!(filter_directives(" warn,syncer=trace "), "warn,syncer=trace");
    }
}
