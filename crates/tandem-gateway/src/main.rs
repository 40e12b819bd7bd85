#![doc = include_str!("../README.md")]

use clap::Parser;
use std::sync::Arc;
use tandem_core::events::{EventLog, Service};
use tandem_core::store::MemoryStore;
use tandem_core::telemetry::init_telemetry;
use tandem_gateway::server::{
    config::{GatewayArgs, GatewayConfig},
    handler::Gateway,
    http::{self, AppState},
};
use tokio::net::TcpListener;
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = GatewayArgs::parse();
    let config = GatewayConfig::try_from(args)?;

    let providers = init_telemetry("tandem-gateway")?;

    let gateway = Gateway::connect_lazy(
        Arc::new(MemoryStore::new()),
        EventLog::new(Service::Gateway),
        &config,
    )?;
    let state = AppState::new(gateway, &config.default_message, config.request_timeout);

    let listener = TcpListener::bind(config.http_addr).await?;
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting gateway on {} with full config: {:#?}",
            config.http_addr,
            config
        );
    } else {
        tracing::info!(
            "Starting gateway on {} (worker at {})",
            config.http_addr,
            config.worker_addr
        );
    }

    let res = http::serve(listener, state, shutdown_signal()).await;

    providers.shutdown();
    res
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                core::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = core::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
            core::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }
    tracing::info!("Shutdown signal received, terminating gracefully...");
}
