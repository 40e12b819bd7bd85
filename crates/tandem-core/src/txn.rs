//! Scoped transaction handle.
//!
//! [`TransactionHandle`] wraps a store [`Transaction`] for exactly one
//! request. It guarantees release on every exit path: unless
//! [`commit`](TransactionHandle::commit) succeeded, the transaction is rolled
//! back, either explicitly or when the handle is dropped. Rollback is
//! idempotent, so cleanup code never has to track whether someone else
//! already released the transaction.
//!
//! The handle is scoped to the request's [`CancellationSignal`]: once the
//! signal has fired, inserts and commits are refused and the transaction
//! rolls back, in the same way a driver aborts a transaction whose context
//! was cancelled.

use crate::events::{EventKind, EventLog, RollbackReason};
use crate::signal::{CancelCause, CancellationSignal};
use crate::store::{Store, Transaction, TxnState};
use crate::{CorrelationId, Error, ProvisionalRecord};

pub struct TransactionHandle {
    txn: Box<dyn Transaction>,
    correlation_id: CorrelationId,
    scope: Option<CancellationSignal>,
    events: EventLog,
}

impl TransactionHandle {
    /// Opens a transaction scoped to `scope`.
    ///
    /// # Errors
    ///
    /// - the signal has already fired: the matching cancellation error;
    /// - the store refuses to begin: [`Error::Transaction`].
    pub fn begin(
        store: &dyn Store,
        correlation_id: CorrelationId,
        scope: &CancellationSignal,
        events: &EventLog,
    ) -> Result<Self, Error> {
        if let Some(cause) = scope.cause() {
            events.record(&correlation_id, EventKind::Cancelled(cause));
            return Err(cause.into());
        }
        let txn = store.begin().map_err(Error::Transaction)?;
        Ok(Self {
            txn,
            correlation_id,
            scope: Some(scope.clone()),
            events: events.clone(),
        })
    }

    pub fn state(&self) -> TxnState {
        self.txn.state()
    }

    /// Records this request's provisional row.
    ///
    /// On failure the transaction is rolled back before returning.
    pub fn insert(&mut self, payload: &str) -> Result<(), Error> {
        if let Some(cause) = self.fired() {
            self.refuse(cause, RollbackReason::from(cause));
            return Err(cause.into());
        }

        let record = ProvisionalRecord::new(self.correlation_id.clone(), payload);
        match self.txn.insert(record) {
            Ok(()) => {
                self.events.record(&self.correlation_id, EventKind::Inserted);
                Ok(())
            }
            Err(e) => {
                self.rollback(RollbackReason::InsertFailed);
                Err(Error::Transaction(e))
            }
        }
    }

    /// Stops tying the commit decision to the request signal.
    ///
    /// Used once the outcome no longer depends on the caller, for example
    /// after the downstream side has already committed.
    pub fn detach_scope(&mut self) {
        self.scope = None;
    }

    /// Commits the transaction, consuming the handle.
    ///
    /// # Errors
    ///
    /// - the scope signal fired first: the matching cancellation error, and
    ///   the transaction is rolled back;
    /// - the store rejects the commit: [`Error::Commit`], and the transaction
    ///   ends rolled back.
    pub fn commit(mut self) -> Result<(), Error> {
        if let Some(cause) = self.fired() {
            self.refuse(cause, RollbackReason::CommitRefused);
            return Err(cause.into());
        }

        match self.txn.commit() {
            Ok(()) => {
                self.events.record(&self.correlation_id, EventKind::Committed);
                Ok(())
            }
            Err(e) => {
                self.txn.rollback();
                self.events
                    .record(&self.correlation_id, EventKind::CommitFailed);
                Err(Error::Commit(e))
            }
        }
    }

    /// Rolls the transaction back.
    ///
    /// Returns `true` if this call released the transaction and `false` if it
    /// was already terminal. Never fails.
    pub fn rollback(&mut self, reason: RollbackReason) -> bool {
        if self.txn.state().is_terminal() {
            return false;
        }
        self.txn.rollback();
        self.events
            .record(&self.correlation_id, EventKind::RolledBack(reason));
        true
    }

    fn fired(&self) -> Option<CancelCause> {
        self.scope.as_ref().and_then(CancellationSignal::cause)
    }

    fn refuse(&mut self, cause: CancelCause, reason: RollbackReason) {
        self.events
            .record(&self.correlation_id, EventKind::Cancelled(cause));
        self.rollback(reason);
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        if self.rollback(RollbackReason::Released) {
            tracing::debug!(
                correlation_id = %self.correlation_id,
                "transaction released without commit"
            );
        }
    }
}
