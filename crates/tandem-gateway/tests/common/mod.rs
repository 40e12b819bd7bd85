//! In-process harness: a real worker gRPC server, a real gateway HTTP server,
//! and an optional TCP relay between them that can be severed or made to hold
//! the worker's replies.

#![allow(dead_code)]

use core::time::Duration;
use std::net::SocketAddr;
use std::sync::Arc;
use tandem_core::CorrelationId;
use tandem_core::events::{EventLog, Outcome, Service};
use tandem_core::store::MemoryStore;
use tandem_gateway::server::{
    config::GatewayConfig,
    handler::Gateway,
    http::{self, AppState},
};
use tandem_worker::server::{
    config::WorkerConfig, serve_with_incoming, service::handler::Worker, work::BoundedWork,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;

pub const WORK_DURATION: Duration = Duration::from_secs(3);
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const OUTCOME_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Harness {
    pub gateway_addr: SocketAddr,
    pub gateway_store: MemoryStore,
    pub worker_store: MemoryStore,
    pub gateway_events: EventLog,
    pub worker_events: EventLog,
    relay: Option<Relay>,
    tasks: Vec<JoinHandle<()>>,
}

impl Harness {
    pub async fn start() -> Self {
        Self::start_with(WORK_DURATION, POLL_INTERVAL, false).await
    }

    pub async fn start_relayed() -> Self {
        Self::start_with(WORK_DURATION, POLL_INTERVAL, true).await
    }

    pub async fn start_with(work_duration: Duration, poll_interval: Duration, relayed: bool) -> Self {
        let worker_store = MemoryStore::new();
        let worker_events = EventLog::new(Service::Worker);
        let worker_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let worker_addr = worker_listener.local_addr().unwrap();

        let worker = Worker::new(
            Arc::new(worker_store.clone()),
            worker_events.clone(),
            BoundedWork::new(work_duration, poll_interval),
        );
        let worker_config = WorkerConfig::with_work(work_duration, poll_interval);
        let mut tasks = vec![tokio::spawn(async move {
            serve_with_incoming(
                worker,
                &worker_config,
                TcpListenerStream::new(worker_listener),
                core::future::pending(),
            )
            .await
            .unwrap();
        })];

        let relay = if relayed {
            Some(Relay::start(worker_addr).await)
        } else {
            None
        };
        let upstream = relay.as_ref().map_or(worker_addr, |r| r.addr);

        let gateway_store = MemoryStore::new();
        let gateway_events = EventLog::new(Service::Gateway);
        let config = GatewayConfig::for_worker(format!("http://{upstream}"));
        let gateway = Gateway::connect_lazy(
            Arc::new(gateway_store.clone()),
            gateway_events.clone(),
            &config,
        )
        .unwrap();
        let state = AppState::new(gateway, &config.default_message, config.request_timeout);

        let gateway_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gateway_addr = gateway_listener.local_addr().unwrap();
        tasks.push(tokio::spawn(async move {
            http::serve(gateway_listener, state, core::future::pending())
                .await
                .unwrap();
        }));

        Self {
            gateway_addr,
            gateway_store,
            worker_store,
            gateway_events,
            worker_events,
            relay,
            tasks,
        }
    }

    /// Drops every connection between gateway and worker.
    pub fn sever(&self) {
        if let Some(relay) = &self.relay {
            relay.sever();
        }
    }

    /// Stops forwarding bytes from the worker to the gateway. Requests still
    /// reach the worker, but its replies never arrive.
    pub fn hold_worker_replies(&self) {
        if let Some(relay) = &self.relay {
            relay.held.send_replace(true);
        }
    }

    pub async fn outcomes(&self, id: &CorrelationId) -> (Option<Outcome>, Option<Outcome>) {
        let gateway = self.gateway_events.wait_for_outcome(id, OUTCOME_TIMEOUT).await;
        let worker = self.worker_events.wait_for_outcome(id, OUTCOME_TIMEOUT).await;
        (gateway, worker)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// TCP relay whose connections can all be cut at once, simulating the loss
/// of the gateway-worker link.
struct Relay {
    addr: SocketAddr,
    severed: watch::Sender<bool>,
    held: watch::Sender<bool>,
    accept: JoinHandle<()>,
}

impl Relay {
    async fn start(target: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (severed, watcher) = watch::channel(false);
        let (held, hold) = watch::channel(false);

        let accept = tokio::spawn(async move {
            loop {
                let Ok((inbound, _)) = listener.accept().await else {
                    return;
                };
                if *watcher.borrow() {
                    continue;
                }
                let Ok(outbound) = TcpStream::connect(target).await else {
                    continue;
                };
                let mut cut = watcher.clone();
                let hold = hold.clone();
                tokio::spawn(async move {
                    let (from_gateway, to_gateway) = inbound.into_split();
                    let (from_worker, to_worker) = outbound.into_split();
                    tokio::select! {
                        () = pump(from_gateway, to_worker, None) => {}
                        () = pump(from_worker, to_gateway, Some(hold)) => {}
                        _ = cut.wait_for(|severed| *severed) => {}
                    }
                });
            }
        });

        Self {
            addr,
            severed,
            held,
            accept,
        }
    }

    fn sever(&self) {
        self.severed.send_replace(true);
    }
}

/// Copies `from` into `to` until either side closes, pausing while `hold` is
/// set.
async fn pump(mut from: OwnedReadHalf, mut to: OwnedWriteHalf, mut hold: Option<watch::Receiver<bool>>) {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = match from.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        if let Some(hold) = hold.as_mut() {
            if hold.wait_for(|held| !*held).await.is_err() {
                return;
            }
        }
        if to.write_all(&buf[..n]).await.is_err() {
            return;
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

/// Sends `GET <path>` and returns the status code and JSON body.
pub async fn get(addr: SocketAddr, path: &str) -> (u16, serde_json::Value) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let raw = String::from_utf8(raw).unwrap();

    let (head, body) = raw.split_once("\r\n\r\n").unwrap();
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap();
    (status, serde_json::from_str(body).unwrap())
}

/// Sends `GET <path>` without waiting for the reply. Dropping the returned
/// stream disconnects the client mid-request.
pub async fn start_get(addr: SocketAddr, path: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    stream
}

pub fn id(raw: &str) -> CorrelationId {
    CorrelationId::parse(raw).unwrap()
}
