//! Gateway request lifecycle.
//!
//! [`Gateway::handle`] drives one request through the protocol:
//!
//! 1. open the local transaction, scoped to the request's signal;
//! 2. record the provisional row (a failure here ends the request before any
//!    downstream call);
//! 3. call the worker's `DoWork`, forwarding the correlation id and the
//!    signal's deadline;
//! 4. commit after a successful reply, roll back after anything else.
//!
//! If the signal fires while the call is in flight, the call future is
//! dropped. tonic resets the HTTP/2 stream, and the worker sees that reset as
//! its own cancellation.

use crate::server::config::GatewayConfig;
use serde::Serialize;
use std::sync::Arc;
use tandem_core::{
    CorrelationId, Error,
    events::{EventKind, EventLog, RollbackReason},
    proto::{WorkRequest, worker_service_client::WorkerServiceClient},
    signal::{CancelCause, CancellationSignal},
    store::Store,
    txn::TransactionHandle,
};
use tonic::transport::{Channel, Endpoint};

/// Successful reply to an echo request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EchoResponse {
    pub correlation_id: String,
    pub success: bool,
    pub message: String,
    /// What the worker reported after committing its half.
    pub worker_message: String,
}

#[derive(Clone)]
pub struct Gateway {
    store: Arc<dyn Store>,
    events: EventLog,
    client: WorkerServiceClient<Channel>,
}

impl Gateway {
    pub fn new(store: Arc<dyn Store>, events: EventLog, channel: Channel) -> Self {
        Self {
            store,
            events,
            client: WorkerServiceClient::new(channel),
        }
    }

    /// Builds a gateway whose worker channel connects on first use.
    pub fn connect_lazy(
        store: Arc<dyn Store>,
        events: EventLog,
        config: &GatewayConfig,
    ) -> Result<Self, Error> {
        Ok(Self::new(store, events, worker_channel(config)?))
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Runs one request to a terminal state.
    ///
    /// The local transaction is committed or rolled back before this returns.
    ///
    /// # Errors
    ///
    /// - [`Error::Transaction`] if the store refused to begin or insert; the
    ///   worker is not called;
    /// - [`Error::RequestCancelled`] / [`Error::DeadlineExceeded`] if
    ///   `signal` fired, or the worker reported that it did;
    /// - [`Error::Transport`] if the worker could not be reached or the
    ///   connection broke;
    /// - [`Error::Internal`] for any other worker failure;
    /// - [`Error::Commit`] if the local commit failed after the worker had
    ///   already committed.
    #[tracing::instrument(skip_all, fields(%correlation_id))]
    pub async fn handle(
        &self,
        correlation_id: CorrelationId,
        message: &str,
        signal: &CancellationSignal,
    ) -> Result<EchoResponse, Error> {
        self.events.record(&correlation_id, EventKind::Received);

        let mut txn = TransactionHandle::begin(
            self.store.as_ref(),
            correlation_id.clone(),
            signal,
            &self.events,
        )?;
        txn.insert(message)?;

        let mut request = tonic::Request::new(WorkRequest {
            task_id: correlation_id.to_string(),
            data: message.to_string(),
        });
        correlation_id.attach(request.metadata_mut())?;
        signal.propagate(&mut request);

        let mut client = self.client.clone();
        // A reply that arrives after the signal fired is never read, even if
        // the worker committed before sending it. That leaves the worker
        // committed and this side rolled back.
        let reply = tokio::select! {
            biased;
            cause = signal.fired() => Err(Error::from(cause)),
            reply = client.do_work(request) => reply
                .map(tonic::Response::into_inner)
                .map_err(|status| Error::from_status(&status)),
        };

        match reply {
            Ok(reply) if reply.success => {
                // The worker has committed; a late cancel must not undo our
                // half.
                txn.detach_scope();
                txn.commit()?;
                tracing::info!(worker_message = %reply.message, "worker committed");
                Ok(EchoResponse {
                    correlation_id: correlation_id.to_string(),
                    success: true,
                    message: message.to_string(),
                    worker_message: reply.message,
                })
            }
            Ok(reply) => {
                txn.rollback(RollbackReason::DownstreamFailed);
                Err(Error::Internal {
                    context: format!("worker reported failure: {}", reply.message),
                })
            }
            Err(err) => {
                let err = reconcile(err, signal);
                if let Some(cause) = cancel_cause(&err) {
                    self.events
                        .record(&correlation_id, EventKind::Cancelled(cause));
                }
                txn.rollback(rollback_reason(&err));
                tracing::warn!(error = %err, "worker call failed");
                Err(err)
            }
        }
    }
}

/// Builds the lazily connected channel to the worker, with keepalive pings
/// when configured.
pub fn worker_channel(config: &GatewayConfig) -> Result<Channel, Error> {
    let mut endpoint = Endpoint::from_shared(config.worker_addr.clone())
        .map_err(|e| Error::InvalidRequest {
            reason: format!("invalid worker address {:?}: {e}", config.worker_addr),
        })?
        .connect_timeout(config.connect_timeout);

    if let Some(interval) = config.keepalive_interval {
        endpoint = endpoint
            .http2_keep_alive_interval(interval)
            .keep_alive_timeout(config.keepalive_timeout)
            .keep_alive_while_idle(true);
    }

    Ok(endpoint.connect_lazy())
}

/// Settles which error a failed call reports.
///
/// A fired local signal is authoritative. Otherwise a `Cancelled` reply can
/// only come from the worker's transport enforcing the propagated
/// `grpc-timeout` a moment before the local deadline, since the gateway never
/// receives a reply to a call it abandoned itself.
fn reconcile(err: Error, signal: &CancellationSignal) -> Error {
    match signal.cause() {
        Some(cause) => Error::from(cause),
        None if err == Error::RequestCancelled && signal.deadline().is_some() => {
            Error::DeadlineExceeded
        }
        None => err,
    }
}

fn cancel_cause(err: &Error) -> Option<CancelCause> {
    match err {
        Error::RequestCancelled => Some(CancelCause::Cancelled),
        Error::DeadlineExceeded => Some(CancelCause::DeadlineExceeded),
        _ => None,
    }
}

fn rollback_reason(err: &Error) -> RollbackReason {
    match err {
        Error::RequestCancelled => RollbackReason::Cancelled,
        Error::DeadlineExceeded => RollbackReason::DeadlineExceeded,
        Error::Transport { .. } => RollbackReason::TransportFailed,
        _ => RollbackReason::DownstreamFailed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use tandem_core::events::{Outcome, Service};
    use tandem_core::store::MemoryStore;

    // Nothing listens on port 1, so calls fail fast with `Unavailable`.
    const UNREACHABLE: &str = "http://127.0.0.1:1";

    fn gateway(store: &MemoryStore) -> Gateway {
        let config = GatewayConfig::for_worker(UNREACHABLE);
        Gateway::connect_lazy(
            Arc::new(store.clone()),
            EventLog::new(Service::Gateway),
            &config,
        )
        .unwrap()
    }

    fn id(raw: &str) -> CorrelationId {
        CorrelationId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn insert_failure_never_reaches_the_worker() {
        let store = MemoryStore::new();
        store.reject_inserts(true);
        let gateway = gateway(&store);

        let err = gateway
            .handle(id("insert-fail"), "Hello", &CancellationSignal::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Transaction(_)));
        assert_eq!(
            gateway.events().events_for(&id("insert-fail")),
            vec![
                EventKind::Received,
                EventKind::RolledBack(RollbackReason::InsertFailed)
            ]
        );
    }

    #[tokio::test]
    async fn unreachable_worker_rolls_back_as_transport_failure() {
        let store = MemoryStore::new();
        let gateway = gateway(&store);

        let err = gateway
            .handle(
                id("no-worker"),
                "Hello",
                &CancellationSignal::with_timeout(Duration::from_secs(5)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Transport { .. }), "got {err:?}");
        assert!(store.is_empty());
        assert_eq!(
            gateway.events().outcome(&id("no-worker")),
            Some(Outcome::RolledBack(RollbackReason::TransportFailed))
        );
        assert!(!gateway.events().was_cancelled(&id("no-worker")));
    }

    #[tokio::test]
    async fn fired_signal_rejects_before_opening_a_transaction() {
        let store = MemoryStore::new();
        let gateway = gateway(&store);
        let signal = CancellationSignal::new();
        signal.cancel();

        let err = gateway
            .handle(id("late"), "Hello", &signal)
            .await
            .unwrap_err();

        assert_eq!(err, Error::RequestCancelled);
        assert!(store.is_empty());
        assert!(gateway.events().was_cancelled(&id("late")));
    }

    #[test]
    fn worker_errors_map_to_rollback_reasons() {
        let cases = [
            (Error::RequestCancelled, RollbackReason::Cancelled),
            (Error::DeadlineExceeded, RollbackReason::DeadlineExceeded),
            (
                Error::Transport {
                    context: "reset".into(),
                },
                RollbackReason::TransportFailed,
            ),
            (
                Error::Internal {
                    context: "boom".into(),
                },
                RollbackReason::DownstreamFailed,
            ),
        ];
        for (err, reason) in cases {
            assert_eq!(rollback_reason(&err), reason, "{err:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn worker_side_timeout_is_reported_as_deadline() {
        let signal = CancellationSignal::with_timeout(Duration::from_secs(1));
        assert_eq!(
            reconcile(Error::RequestCancelled, &signal),
            Error::DeadlineExceeded
        );
        assert_eq!(
            reconcile(Error::RequestCancelled, &CancellationSignal::new()),
            Error::RequestCancelled
        );

        tokio::time::advance(Duration::from_secs(2)).await;
        let transport = Error::Transport {
            context: "reset".into(),
        };
        assert_eq!(reconcile(transport, &signal), Error::DeadlineExceeded);
    }

    #[test]
    fn invalid_worker_address_is_rejected() {
        let config = GatewayConfig::for_worker("not a uri");
        assert!(matches!(
            worker_channel(&config),
            Err(Error::InvalidRequest { .. })
        ));
    }
}
