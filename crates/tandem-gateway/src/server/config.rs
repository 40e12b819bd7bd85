use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use std::net::SocketAddr;
use tandem_core::signal::MAX_TIMEOUT;

/// Runtime configuration for the `tandem-gateway` binary.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "tandem-gateway",
    version,
    about = "An HTTP gateway whose transaction commits only if the downstream worker commits"
)]
pub struct GatewayArgs {
    /// Address the HTTP listener binds to.
    ///
    /// Environment variable: `HTTP_ADDR`
    #[arg(long, env = "HTTP_ADDR", default_value_t = SocketAddr::from(([0, 0, 0, 0], 8080)))]
    pub http_addr: SocketAddr,

    /// URI of the worker's gRPC endpoint.
    ///
    /// Environment variable: `WORKER_ADDR`
    #[arg(long, env = "WORKER_ADDR", default_value_t = String::from("http://127.0.0.1:50051"))]
    pub worker_addr: String,

    /// Timeout for establishing the connection to the worker, in
    /// milliseconds.
    ///
    /// Environment variable: `CONNECT_TIMEOUT_MS`
    #[arg(long, env = "CONNECT_TIMEOUT_MS", default_value_t = 5_000)]
    pub connect_timeout_ms: u64,

    /// End-to-end deadline applied to requests that do not carry their own
    /// `timeout_ms`, in milliseconds. `0` means no deadline.
    ///
    /// Environment variable: `REQUEST_TIMEOUT_MS`
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value_t = 0)]
    pub request_timeout_ms: u64,

    /// Message echoed when a request does not supply one.
    ///
    /// Environment variable: `DEFAULT_MESSAGE`
    #[arg(long, env = "DEFAULT_MESSAGE", default_value_t = String::from("Hello"))]
    pub default_message: String,

    /// HTTP/2 keepalive ping interval on the worker channel, in
    /// milliseconds. `0` disables keepalive.
    ///
    /// Environment variable: `KEEPALIVE_INTERVAL_MS`
    #[arg(long, env = "KEEPALIVE_INTERVAL_MS", default_value_t = 10_000)]
    pub keepalive_interval_ms: u64,

    /// How long to wait for a keepalive acknowledgement, in milliseconds.
    ///
    /// Environment variable: `KEEPALIVE_TIMEOUT_MS`
    #[arg(long, env = "KEEPALIVE_TIMEOUT_MS", default_value_t = 5_000)]
    pub keepalive_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub http_addr: SocketAddr,
    pub worker_addr: String,
    pub connect_timeout: Duration,
    pub request_timeout: Option<Duration>,
    pub default_message: String,
    pub keepalive_interval: Option<Duration>,
    pub keepalive_timeout: Duration,
}

impl GatewayConfig {
    /// Defaults pointed at `worker_addr`, for in-process use.
    pub fn for_worker(worker_addr: impl Into<String>) -> Self {
        Self {
            http_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            worker_addr: worker_addr.into(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: None,
            default_message: String::from("Hello"),
            keepalive_interval: None,
            keepalive_timeout: Duration::from_secs(5),
        }
    }
}

impl TryFrom<GatewayArgs> for GatewayConfig {
    type Error = anyhow::Error;

    fn try_from(args: GatewayArgs) -> Result<Self, Self::Error> {
        if !(args.worker_addr.starts_with("http://") || args.worker_addr.starts_with("https://")) {
            bail!(
                "WORKER_ADDR must be an http:// or https:// URI, got {:?}",
                args.worker_addr
            );
        }

        if args.connect_timeout_ms == 0 {
            bail!("CONNECT_TIMEOUT_MS must be greater than 0");
        }

        if Duration::from_millis(args.request_timeout_ms) > MAX_TIMEOUT {
            bail!(
                "REQUEST_TIMEOUT_MS must not exceed {}",
                MAX_TIMEOUT.as_millis()
            );
        }

        if args.keepalive_interval_ms > 0 && args.keepalive_timeout_ms == 0 {
            bail!("KEEPALIVE_TIMEOUT_MS must be greater than 0 when keepalive is enabled");
        }

        Ok(Self {
            http_addr: args.http_addr,
            worker_addr: args.worker_addr,
            connect_timeout: Duration::from_millis(args.connect_timeout_ms),
            request_timeout: (args.request_timeout_ms > 0)
                .then(|| Duration::from_millis(args.request_timeout_ms)),
            default_message: args.default_message,
            keepalive_interval: (args.keepalive_interval_ms > 0)
                .then(|| Duration::from_millis(args.keepalive_interval_ms)),
            keepalive_timeout: Duration::from_millis(args.keepalive_timeout_ms),
        })
    }
}
