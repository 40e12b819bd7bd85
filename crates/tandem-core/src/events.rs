//! Structured, queryable record of what each service did for a request.
//!
//! Every step that matters for the cross-service invariant is appended to an
//! [`EventLog`]: receipt, provisional insert, observed cancellation and the
//! terminal commit or rollback. Each event is also emitted as a `tracing`
//! event and counted in the metrics, but callers (and tests) assert on the
//! log itself rather than on log lines.

use crate::{CorrelationId, signal::CancelCause, telemetry};
use core::{fmt, time::Duration};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Notify;

/// Events kept by [`EventLog::new`] before the oldest are discarded.
pub const DEFAULT_EVENT_CAPACITY: usize = 16 * 1024;

/// Which side of the boundary recorded an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Service {
    Gateway,
    Worker,
}

impl Service {
    pub const fn as_str(self) -> &'static str {
        match self {
            Service::Gateway => "gateway",
            Service::Worker => "worker",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a transaction ended rolled back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RollbackReason {
    /// The request's signal fired (caller cancel or lost connection).
    Cancelled,
    /// The request's deadline elapsed.
    DeadlineExceeded,
    /// The provisional insert was rejected.
    InsertFailed,
    /// The downstream service was unreachable or the connection broke.
    TransportFailed,
    /// The downstream service replied with a non-cancellation error.
    DownstreamFailed,
    /// A commit was refused because the signal had already fired.
    CommitRefused,
    /// The handle went out of scope without an explicit commit or rollback.
    Released,
}

impl From<CancelCause> for RollbackReason {
    fn from(cause: CancelCause) -> Self {
        match cause {
            CancelCause::Cancelled => RollbackReason::Cancelled,
            CancelCause::DeadlineExceeded => RollbackReason::DeadlineExceeded,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Received,
    Inserted,
    /// The request's signal was observed as fired.
    Cancelled(CancelCause),
    Committed,
    RolledBack(RollbackReason),
    /// The store rejected the commit; the transaction ended rolled back.
    CommitFailed,
}

impl EventKind {
    pub fn outcome(self) -> Option<Outcome> {
        match self {
            EventKind::Committed => Some(Outcome::Committed),
            EventKind::RolledBack(reason) => Some(Outcome::RolledBack(reason)),
            EventKind::CommitFailed => Some(Outcome::CommitFailed),
            _ => None,
        }
    }
}

/// Terminal state of one service's transaction for one request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    Committed,
    RolledBack(RollbackReason),
    CommitFailed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub correlation_id: CorrelationId,
    pub service: Service,
    pub kind: EventKind,
    pub at: SystemTime,
}

struct Inner {
    service: Service,
    capacity: usize,
    events: Mutex<VecDeque<Event>>,
    notify: Notify,
}

/// Bounded, append-only event log shared by all requests of one service.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<Inner>,
}

impl EventLog {
    pub fn new(service: Service) -> Self {
        Self::with_capacity(service, DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(service: Service, capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                service,
                capacity: capacity.max(1),
                events: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
            }),
        }
    }

    pub fn record(&self, correlation_id: &CorrelationId, kind: EventKind) {
        let service = self.inner.service;
        match kind {
            EventKind::Committed => {
                telemetry::increment_commits(service.as_str());
                tracing::info!(%correlation_id, %service, "transaction committed");
            }
            EventKind::RolledBack(reason) => {
                telemetry::increment_rollbacks(service.as_str());
                tracing::info!(%correlation_id, %service, ?reason, "transaction rolled back");
            }
            EventKind::Cancelled(cause) => {
                telemetry::increment_cancellations(service.as_str());
                tracing::info!(%correlation_id, %service, ?cause, "cancellation observed");
            }
            EventKind::CommitFailed => {
                tracing::error!(%correlation_id, %service, "commit rejected by store");
            }
            EventKind::Received | EventKind::Inserted => {
                tracing::debug!(%correlation_id, %service, ?kind, "request event");
            }
        }

        {
            let mut events = self.inner.events.lock();
            if events.len() == self.inner.capacity {
                events.pop_front();
            }
            events.push_back(Event {
                correlation_id: correlation_id.clone(),
                service,
                kind,
                at: SystemTime::now(),
            });
        }
        self.inner.notify.notify_waiters();
    }

    /// All retained events for one request, oldest first.
    pub fn events_for(&self, correlation_id: &CorrelationId) -> Vec<EventKind> {
        self.inner
            .events
            .lock()
            .iter()
            .filter(|e| &e.correlation_id == correlation_id)
            .map(|e| e.kind)
            .collect()
    }

    /// The terminal outcome recorded for a request, if any.
    pub fn outcome(&self, correlation_id: &CorrelationId) -> Option<Outcome> {
        self.inner
            .events
            .lock()
            .iter()
            .rev()
            .filter(|e| &e.correlation_id == correlation_id)
            .find_map(|e| e.kind.outcome())
    }

    /// Whether a fired signal was observed for the request.
    pub fn was_cancelled(&self, correlation_id: &CorrelationId) -> bool {
        self.inner
            .events
            .lock()
            .iter()
            .any(|e| &e.correlation_id == correlation_id && matches!(e.kind, EventKind::Cancelled(_)))
    }

    pub fn len(&self) -> usize {
        self.inner.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until a terminal outcome is recorded for the request, or until
    /// `timeout` elapses.
    pub async fn wait_for_outcome(
        &self,
        correlation_id: &CorrelationId,
        timeout: Duration,
    ) -> Option<Outcome> {
        let wait = async {
            loop {
                let notified = self.inner.notify.notified();
                tokio::pin!(notified);
                // Register before checking so a record in between is not missed.
                notified.as_mut().enable();
                if let Some(outcome) = self.outcome(correlation_id) {
                    return outcome;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.ok()
    }
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLog")
            .field("service", &self.inner.service)
            .field("len", &self.len())
            .finish()
    }
}
