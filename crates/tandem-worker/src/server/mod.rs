//! Worker server: configuration, the bounded work loop and the gRPC service,
//! plus the bootstrap that wires them onto a listener.

pub mod config;
pub mod service;
pub mod work;

use config::WorkerConfig;
use core::future::Future;
use service::handler::Worker;
use tandem_core::proto::worker_service_server::WorkerServiceServer;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_stream::Stream;
use tonic::transport::{Server, server::Connected};

type BoxError = Box<dyn core::error::Error + Send + Sync>;

/// Serves `worker` on `incoming` until `shutdown` resolves.
///
/// Also serves `grpc.health.v1`, reporting the worker as not serving as soon
/// as shutdown begins. Connections carry HTTP/2 keepalive pings per
/// `config`, so a peer that silently disappears is detected and its
/// in-flight calls are cancelled.
pub async fn serve_with_incoming<I, IO, IE, F>(
    worker: Worker,
    config: &WorkerConfig,
    incoming: I,
    shutdown: F,
) -> anyhow::Result<()>
where
    I: Stream<Item = Result<IO, IE>>,
    IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
    IO::ConnectInfo: Clone + Send + Sync + 'static,
    IE: Into<BoxError>,
    F: Future<Output = ()>,
{
    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<WorkerServiceServer<Worker>>()
        .await;

    let shutdown = async move {
        shutdown.await;
        tracing::info!("Shutdown signal received, terminating gracefully...");
        health_reporter
            .set_not_serving::<WorkerServiceServer<Worker>>()
            .await;
    };

    Server::builder()
        .http2_keepalive_interval(config.keepalive_interval)
        .http2_keepalive_timeout(Some(config.keepalive_timeout))
        .add_service(health_service)
        .add_service(WorkerServiceServer::new(worker))
        .serve_with_incoming_shutdown(incoming, shutdown)
        .await?;

    tracing::info!("Worker shut down successfully");
    Ok(())
}
