//! `ctdbd` binary entrypoint: parse configuration, wire up logging and
//! metrics, build the daemon, and run it to completion.

use std::sync::Arc;

use clap::Parser;
use ctdbd::log_ring::LogRingLayer;
use ctdbd::{Daemon, DaemonConfig};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

fn init_tracing(log_json: bool, log_ring: Arc<ctdbd::log_ring::LogRing>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let ring_layer = LogRingLayer::new(log_ring);
    if log_json {
        tracing_subscriber::registry().with(filter).with(ring_layer).with(fmt::layer().json()).init();
    } else {
        tracing_subscriber::registry().with(filter).with(ring_layer).with(fmt::layer()).init();
    }
}

fn init_metrics(addr: &str) -> anyhow::Result<()> {
    let socket_addr: std::net::SocketAddr = addr.parse()?;
    metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(socket_addr).install()?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DaemonConfig::parse();
    let log_ring = Arc::new(ctdbd::log_ring::LogRing::default());
    init_tracing(config.log_json, log_ring.clone());

    if let Some(addr) = config.metrics_addr.clone() {
        init_metrics(&addr)?;
    }

    tracing::info!(pnn = config.pnn, "starting ctdbd");
    let daemon = Daemon::new(config, log_ring)?;
    daemon.serve().await
}
