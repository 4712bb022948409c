//! Ambient Prometheus metrics exposition for operators running this under
//! a supervisor. Entirely separate from the collector's own Logger Sink:
//! this is `/metrics` scrape surface, not the severity-tagged log file.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Failure installing the global metrics recorder.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unable to install prometheus recorder: {0}")]
    Build(#[from] metrics_exporter_prometheus::BuildError),
}

/// Install the Prometheus recorder and start its HTTP listener on `addr`.
///
/// # Errors
///
/// Returns [`Error`] if the recorder can't be built or installed (a bind
/// failure on `addr`, or a recorder already installed globally).
pub fn install(addr: SocketAddr) -> Result<(), Error> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install_recorder()?;
    info!("prometheus metrics exporter listening on http://{addr}/metrics");
    Ok(())
}
