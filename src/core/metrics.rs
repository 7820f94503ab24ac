use std::net::{Ipv4Addr, SocketAddr};

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::core::config::Settings;

/// Installs the Prometheus exporter with its own scrape listener; the engine
/// has no other HTTP surface to mount a render endpoint on.
pub(crate) fn init(settings: &Settings) -> anyhow::Result<()> {
    if !settings.telemetry().prometheus_enabled {
        return Ok(());
    }

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, settings.telemetry().prometheus_port));
    PrometheusBuilder::new().with_http_listener(addr).install()?;

    tracing::info!(port = settings.telemetry().prometheus_port, "Prometheus exporter listening");
    Ok(())
}
