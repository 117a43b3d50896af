//! Prometheus exporter for the pipeline's `metrics` facade.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use crate::error::{WorkerError, WorkerResult};

/// Install the global Prometheus recorder with an HTTP scrape endpoint.
///
/// Must be called from inside a Tokio runtime.
pub fn install_prometheus(addr: SocketAddr) -> WorkerResult<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| WorkerError::TelemetryFailed(e.to_string()))?;
    info!(%addr, "Prometheus exporter listening");
    Ok(())
}
