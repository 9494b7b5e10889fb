//! Telemetry setup.
//!
//! Tracing with an env-filterable log level, plus a Prometheus metrics
//! exporter behind the `prometheus` feature.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize tracing; `RUST_LOG` overrides the verbosity default.
///
/// With the `prometheus` feature, also starts the metrics exporter when
/// `SPLITROUTESD_PROMETHEUS_ADDR` names a listen address.
pub fn init(verbose: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let default_filter = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    #[cfg(feature = "prometheus")]
    if let Ok(addr) = std::env::var("SPLITROUTESD_PROMETHEUS_ADDR") {
        start_prometheus_exporter(addr.parse()?)?;
    }

    Ok(())
}

/// Start the Prometheus metrics HTTP exporter.
#[cfg(feature = "prometheus")]
fn start_prometheus_exporter(
    addr: std::net::SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    PrometheusBuilder::new().with_http_listener(addr).install()?;

    tracing::info!(%addr, "Prometheus metrics exporter started");

    Ok(())
}
