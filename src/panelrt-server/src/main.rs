//! The `panelrt-server` binary: loads `RuntimeConfig`, assembles the
//! orchestrator stack, installs the Prometheus recorder, and serves the
//! HTTP + WebSocket surface (§6).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use panelrt_core::RuntimeConfig;
use tracing_subscriber::filter::EnvFilter;

/// The panel execution runtime's HTTP + WebSocket server.
#[derive(Debug, Parser)]
#[command(name = "panelrt-server", version, about)]
struct Args {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,panelrt=debug"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install the Prometheus metrics recorder");

    let config = RuntimeConfig::load()?;
    tracing::info!(?config, "loaded runtime configuration");

    let (orchestrator, panels, extensions) = panelrt_core::build_runtime(config.clone())?;
    let state = panelrt_server::AppState {
        orchestrator,
        panels,
        extensions,
        config: Arc::new(config),
        prometheus,
        started_at: Instant::now(),
    };

    let app = panelrt_server::router(state);
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(addr = %args.bind, "panelrt-server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
