//! `DoWork` handler.
//!
//! Each call opens a transaction, records its provisional entry, runs the
//! bounded work and then commits or rolls back depending on whether the
//! caller still wants the result.
//!
//! ## Cancellation
//!
//! The call's [`CancellationSignal`] is rebuilt from the inbound metadata
//! (deadline only) and bound to the handler future. tonic drops that future
//! when the client resets the stream, when the connection is lost, or when
//! the transport-level timeout elapses; the drop fires the signal. The work
//! itself runs on a spawned task so it outlives the handler and can still
//! observe the signal and release its transaction.

use crate::server::{config::WorkerConfig, work::BoundedWork};
use std::sync::Arc;
use tandem_core::{
    CorrelationId, Error,
    events::{EventKind, EventLog, RollbackReason, Service},
    proto::{WorkRequest, WorkResponse, worker_service_server::WorkerService},
    signal::CancellationSignal,
    store::Store,
    telemetry::InflightGuard,
    txn::TransactionHandle,
};
use tonic::{Request, Response, Status};
use tracing::Instrument;

/// Worker side of the protocol. Cheap to clone; all clones share one store
/// and one event log.
#[derive(Clone)]
pub struct Worker {
    store: Arc<dyn Store>,
    events: EventLog,
    work: BoundedWork,
}

impl Worker {
    pub fn new(store: Arc<dyn Store>, events: EventLog, work: BoundedWork) -> Self {
        Self {
            store,
            events,
            work,
        }
    }

    pub fn from_config(store: Arc<dyn Store>, events: EventLog, config: &WorkerConfig) -> Self {
        Self::new(
            store,
            events,
            BoundedWork::new(config.work_duration, config.poll_interval),
        )
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Runs one request to a terminal state.
    ///
    /// Returns only after the transaction is either committed or rolled back.
    ///
    /// # Errors
    ///
    /// - [`Error::Transaction`] if the store refused to begin or insert;
    /// - [`Error::RequestCancelled`] / [`Error::DeadlineExceeded`] if
    ///   `signal` fired before the work completed;
    /// - [`Error::Commit`] if the store refused the commit.
    pub async fn process(
        &self,
        correlation_id: CorrelationId,
        data: &str,
        signal: &CancellationSignal,
    ) -> Result<WorkResponse, Error> {
        self.events.record(&correlation_id, EventKind::Received);

        let mut txn = TransactionHandle::begin(
            self.store.as_ref(),
            correlation_id.clone(),
            signal,
            &self.events,
        )?;
        txn.insert(data)?;

        match self.work.run(signal).await {
            Ok(report) => {
                tracing::debug!(
                    %correlation_id,
                    ticks = report.ticks,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "work completed"
                );
                txn.commit()?;
                Ok(WorkResponse {
                    success: true,
                    message: format!("Work completed for task {correlation_id}: {data}"),
                })
            }
            Err(cause) => {
                self.events
                    .record(&correlation_id, EventKind::Cancelled(cause));
                txn.rollback(RollbackReason::from(cause));
                Err(cause.into())
            }
        }
    }
}

#[tonic::async_trait]
impl WorkerService for Worker {
    async fn do_work(
        &self,
        request: Request<WorkRequest>,
    ) -> Result<Response<WorkResponse>, Status> {
        let signal = CancellationSignal::from_metadata(request.metadata());
        let correlation_id = match CorrelationId::from_metadata(request.metadata()) {
            Some(id) => id,
            None => CorrelationId::parse(request.get_ref().task_id.as_str())?,
        };
        let WorkRequest { data, .. } = request.into_inner();

        let guard = signal.bind();
        let span = tracing::info_span!("do_work", %correlation_id);
        let worker = self.clone();
        let task = tokio::spawn(
            async move {
                let _inflight = InflightGuard::new(Service::Worker.as_str());
                worker.process(correlation_id, &data, &signal).await
            }
            .instrument(span),
        );

        let joined = task.await;
        // Reaching this point means tonic did not abandon the call.
        let _ = guard.disarm();

        let reply = joined.map_err(|e| Error::Internal {
            context: format!("work task failed: {e}"),
        })??;
        Ok(Response::new(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use tandem_core::events::Outcome;
    use tandem_core::signal::CancelCause;
    use tandem_core::store::MemoryStore;
    use tonic::Code;

    const DURATION: Duration = Duration::from_secs(3);
    const POLL: Duration = Duration::from_millis(100);

    fn worker() -> (Worker, MemoryStore) {
        let store = MemoryStore::new();
        let worker = Worker::new(
            Arc::new(store.clone()),
            EventLog::new(Service::Worker),
            BoundedWork::new(DURATION, POLL),
        );
        (worker, store)
    }

    fn request(task_id: &str, data: &str) -> Request<WorkRequest> {
        Request::new(WorkRequest {
            task_id: task_id.to_string(),
            data: data.to_string(),
        })
    }

    fn id(raw: &str) -> CorrelationId {
        CorrelationId::parse(raw).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn completed_work_commits_and_echoes() {
        let (worker, store) = worker();

        let reply = worker
            .do_work(request("successful-request-001", "Hello"))
            .await
            .unwrap()
            .into_inner();

        assert!(reply.success);
        assert_eq!(
            reply.message,
            "Work completed for task successful-request-001: Hello"
        );
        assert_eq!(store.count_for(&id("successful-request-001")), 1);
        assert_eq!(
            worker.events().events_for(&id("successful-request-001")),
            vec![EventKind::Received, EventKind::Inserted, EventKind::Committed]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn metadata_correlation_id_wins_over_task_id() {
        let (worker, store) = worker();
        let mut req = request("task-field", "x");
        id("from-metadata")
            .attach(req.metadata_mut())
            .unwrap();

        worker.do_work(req).await.unwrap();

        assert_eq!(store.count_for(&id("from-metadata")), 1);
        assert_eq!(store.count_for(&id("task-field")), 0);
    }

    #[tokio::test]
    async fn missing_correlation_id_is_rejected() {
        let (worker, store) = worker();
        let status = worker.do_work(request("", "x")).await.unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_mid_work_rolls_back() {
        let (worker, store) = worker();
        let signal = CancellationSignal::new();
        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let err = worker
            .process(id("cancelled-request-001"), "Hello", &signal)
            .await
            .unwrap_err();

        assert_eq!(err, Error::RequestCancelled);
        assert!(store.is_empty());
        assert_eq!(
            worker.events().outcome(&id("cancelled-request-001")),
            Some(Outcome::RolledBack(RollbackReason::Cancelled))
        );
        assert!(worker.events().was_cancelled(&id("cancelled-request-001")));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_call_fires_the_signal_and_rolls_back() {
        let (worker, store) = worker();
        let handler = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.do_work(request("abandoned-001", "x")).await })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        // Same effect as tonic dropping the handler on RST_STREAM.
        handler.abort();

        let outcome = worker
            .events()
            .wait_for_outcome(&id("abandoned-001"), Duration::from_secs(1))
            .await;
        assert_eq!(outcome, Some(Outcome::RolledBack(RollbackReason::Cancelled)));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn propagated_deadline_is_reported_as_deadline_exceeded() {
        let (worker, store) = worker();
        let mut req = request("deadline-001", "x");
        req.set_timeout(Duration::from_millis(250));

        let status = worker.do_work(req).await.unwrap_err();

        assert_eq!(status.code(), Code::DeadlineExceeded);
        assert!(store.is_empty());
        assert_eq!(
            worker.events().outcome(&id("deadline-001")),
            Some(Outcome::RolledBack(RollbackReason::DeadlineExceeded))
        );
    }

    #[tokio::test]
    async fn insert_failure_skips_the_work() {
        let (worker, store) = worker();
        store.reject_inserts(true);

        let status = worker.do_work(request("insert-fail", "x")).await.unwrap_err();

        assert_eq!(status.code(), Code::Internal);
        assert_eq!(
            worker.events().events_for(&id("insert-fail")),
            vec![
                EventKind::Received,
                EventKind::RolledBack(RollbackReason::InsertFailed)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn commit_failure_maps_to_internal() {
        let (worker, store) = worker();
        store.reject_commits(true);

        let status = worker.do_work(request("commit-fail", "x")).await.unwrap_err();

        assert_eq!(status.code(), Code::Internal);
        assert!(store.is_empty());
        assert_eq!(
            worker.events().outcome(&id("commit-fail")),
            Some(Outcome::CommitFailed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn already_fired_signal_never_opens_a_transaction() {
        let (worker, store) = worker();
        let signal = CancellationSignal::new();
        signal.cancel();

        let err = worker
            .process(id("late-001"), "x", &signal)
            .await
            .unwrap_err();

        assert_eq!(err, Error::from(CancelCause::Cancelled));
        assert!(store.is_empty());
        assert!(worker.events().was_cancelled(&id("late-001")));
        assert_eq!(worker.events().outcome(&id("late-001")), None);
    }
}
