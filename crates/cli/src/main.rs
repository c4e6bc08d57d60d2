//! provisd: runs the state controllers that keep the in-memory cluster
//! projection synchronized with the API server.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use provis_cluster::Cluster;
use provis_controller::{Controller, DaemonSetController, Manager};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "provisd", version, about = "DaemonSet-aware cluster state reconciler")]
struct Cli {
    /// Prometheus exporter listen address, e.g. 127.0.0.1:9090
    #[arg(long = "metrics-addr", env = "PROVIS_METRICS_ADDR")]
    metrics_addr: Option<String>,
}

fn init_tracing() {
    let env = std::env::var("PROVIS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr else { return };
    match addr.parse::<std::net::SocketAddr>() {
        Ok(sock) => {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        }
        Err(_) => warn!(addr = %addr, "invalid metrics address; expected host:port"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    init_metrics(cli.metrics_addr.as_deref());

    let client = kube::Client::try_default().await?;
    let cluster = Arc::new(Cluster::new());

    let mut manager = Manager::new(client);
    let controller = Arc::new(DaemonSetController::for_client(manager.client(), cluster));
    controller.build(&mut manager)?;

    let shutdown = manager.shutdown_token();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
        }
        shutdown.cancel();
    });

    manager.run().await
}
