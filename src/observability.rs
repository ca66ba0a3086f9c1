// src/observability.rs
//! Tracing and metrics initialization.

use anyhow::{anyhow, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber
///
/// The filter comes from `RUST_LOG` (default `info`); setting
/// `AGORA_LOG_JSON=1` switches to JSON output.
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = if std::env::var("AGORA_LOG_JSON").is_ok() {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow!("failed to initialize tracing: {}", e))
}

/// Install the Prometheus metrics exporter when a listen address is given
///
/// Without an address, metrics are recorded into the no-op recorder and
/// this is a no-op.
pub fn init_metrics(listen: Option<&str>) -> Result<()> {
    let Some(listen) = listen else {
        return Ok(());
    };
    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| anyhow!("invalid metrics listen address '{}': {}", listen, e))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow!("failed to install metrics exporter: {}", e))?;
    info!(%addr, "prometheus metrics exporter listening");
    Ok(())
}
