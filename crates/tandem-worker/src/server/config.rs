use anyhow::bail;
use clap::Parser;
use core::time::Duration;

/// Runtime configuration for the `tandem-worker` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file is loaded first), with defaults matching a 3 second unit of
/// work polled every 100ms.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "tandem-worker",
    version,
    about = "A gRPC worker that rolls back its transaction when the caller cancels"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:50051"))]
    pub server_addr: String,

    /// Total duration of one unit of work, in milliseconds.
    ///
    /// Environment variable: `WORK_DURATION_MS`
    #[arg(long, env = "WORK_DURATION_MS", default_value_t = 3_000)]
    pub work_duration_ms: u64,

    /// Interval at which the work loop checks the cancellation signal, in
    /// milliseconds. This bounds the cancellation detection latency.
    ///
    /// Environment variable: `POLL_INTERVAL_MS`
    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 100)]
    pub poll_interval_ms: u64,

    /// HTTP/2 keepalive ping interval, in milliseconds. A peer that stops
    /// answering pings is treated as disconnected, which cancels its calls.
    /// `0` disables keepalive.
    ///
    /// Environment variable: `KEEPALIVE_INTERVAL_MS`
    #[arg(long, env = "KEEPALIVE_INTERVAL_MS", default_value_t = 10_000)]
    pub keepalive_interval_ms: u64,

    /// How long to wait for a keepalive ping acknowledgement, in
    /// milliseconds.
    ///
    /// Environment variable: `KEEPALIVE_TIMEOUT_MS`
    #[arg(long, env = "KEEPALIVE_TIMEOUT_MS", default_value_t = 5_000)]
    pub keepalive_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub server_addr: String,
    pub work_duration: Duration,
    pub poll_interval: Duration,
    pub keepalive_interval: Option<Duration>,
    pub keepalive_timeout: Duration,
}

impl WorkerConfig {
    /// Configuration suitable for in-process use: no listen address is
    /// needed and keepalive is off.
    pub fn with_work(work_duration: Duration, poll_interval: Duration) -> Self {
        Self {
            server_addr: String::from("127.0.0.1:0"),
            work_duration,
            poll_interval,
            keepalive_interval: None,
            keepalive_timeout: Duration::from_secs(5),
        }
    }
}

impl TryFrom<CliArgs> for WorkerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.work_duration_ms == 0 {
            bail!("WORK_DURATION_MS must be greater than 0");
        }

        if args.poll_interval_ms == 0 {
            bail!("POLL_INTERVAL_MS must be greater than 0");
        }

        if args.poll_interval_ms > args.work_duration_ms {
            bail!(
                "POLL_INTERVAL_MS ({}) must not exceed WORK_DURATION_MS ({})",
                args.poll_interval_ms,
                args.work_duration_ms
            );
        }

        if args.keepalive_interval_ms > 0 && args.keepalive_timeout_ms == 0 {
            bail!("KEEPALIVE_TIMEOUT_MS must be greater than 0 when keepalive is enabled");
        }

        Ok(Self {
            server_addr: args.server_addr,
            work_duration: Duration::from_millis(args.work_duration_ms),
            poll_interval: Duration::from_millis(args.poll_interval_ms),
            keepalive_interval: (args.keepalive_interval_ms > 0)
                .then(|| Duration::from_millis(args.keepalive_interval_ms)),
            keepalive_timeout: Duration::from_millis(args.keepalive_timeout_ms),
        })
    }
}
