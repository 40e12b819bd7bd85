#![doc = include_str!("../README.md")]

use clap::Parser;
use std::sync::Arc;
use tandem_core::events::{EventLog, Service};
use tandem_core::store::MemoryStore;
use tandem_core::telemetry::init_telemetry;
use tandem_worker::server::{
    self,
    config::{CliArgs, WorkerConfig},
    service::handler::Worker,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_stream::wrappers::TcpListenerStream;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = WorkerConfig::try_from(args)?;

    let providers = init_telemetry("tandem-worker")?;

    let listener = TcpListener::bind(&config.server_addr).await?;
    log_startup_info(&config);

    let worker = Worker::from_config(
        Arc::new(MemoryStore::new()),
        EventLog::new(Service::Worker),
        &config,
    );
    let incoming = TcpListenerStream::new(listener);
    let res = server::serve_with_incoming(worker, &config, incoming, shutdown_signal()).await;

    providers.shutdown();
    res
}

fn log_startup_info(config: &WorkerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting worker on {} with full config: {:#?}",
            config.server_addr,
            config
        );
    } else {
        tracing::info!(
            "Starting worker on {} (work {:?}, poll {:?})",
            config.server_addr,
            config.work_duration,
            config.poll_interval
        );
    }
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
}
