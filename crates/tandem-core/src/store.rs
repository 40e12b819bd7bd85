//! Transactional store contract and an in-memory implementation.
//!
//! Each service owns one [`Store`], constructed at startup and injected into
//! the service. The core only needs begin/insert/commit/rollback:
//!
//! - [`Store::begin`] opens a [`Transaction`].
//! - [`Transaction::insert`] records a provisional row that no other
//!   transaction can see.
//! - [`Transaction::commit`] publishes the rows; a rejected commit leaves the
//!   transaction rolled back.
//! - [`Transaction::rollback`] discards the rows. It never fails and is a
//!   no-op once the transaction is terminal.
//!
//! The trait is synchronous so that a transaction can always be released from
//! `Drop`.

use crate::{CorrelationId, ProvisionalRecord};
use core::fmt;
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Lifecycle of a single transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TxnState {
    Active,
    Committed,
    RolledBack,
}

impl TxnState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TxnState::Active)
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnState::Active => f.write_str("active"),
            TxnState::Committed => f.write_str("committed"),
            TxnState::RolledBack => f.write_str("rolled back"),
        }
    }
}

/// Failures reported by a [`Store`].
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("insert rejected by store")]
    InsertRejected,

    #[error("commit rejected by store")]
    CommitRejected,

    #[error("transaction already {0}")]
    Closed(TxnState),
}

/// A transactional store owned by one service.
pub trait Store: Send + Sync {
    fn begin(&self) -> Result<Box<dyn Transaction>, StoreError>;
}

/// One open transaction. Exclusively owned by the task handling a request.
pub trait Transaction: Send {
    fn insert(&mut self, record: ProvisionalRecord) -> Result<(), StoreError>;

    fn commit(&mut self) -> Result<(), StoreError>;

    /// Discards pending rows. Never fails; a no-op on terminal transactions.
    fn rollback(&mut self);

    fn state(&self) -> TxnState;
}

/// A committed row as persisted by [`MemoryStore`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredRecord {
    pub id: u64,
    pub correlation_id: CorrelationId,
    pub payload: String,
    pub inserted_at: SystemTime,
}

#[derive(Default)]
struct Inner {
    committed: Mutex<Vec<StoredRecord>>,
    next_id: AtomicU64,
    reject_inserts: AtomicBool,
    reject_commits: AtomicBool,
}

/// Append-only in-memory store with read-committed visibility.
///
/// Cloning is cheap and every clone shares the same rows, which lets tests
/// inspect the store a service was built with. Inserts and commits can be
/// made to fail on demand to exercise the failure paths.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent insert fail with [`StoreError::InsertRejected`].
    pub fn reject_inserts(&self, reject: bool) {
        self.inner.reject_inserts.store(reject, Ordering::Relaxed);
    }

    /// Makes every subsequent commit fail with [`StoreError::CommitRejected`].
    pub fn reject_commits(&self, reject: bool) {
        self.inner.reject_commits.store(reject, Ordering::Relaxed);
    }

    /// Snapshot of all committed rows, in commit order.
    pub fn records(&self) -> Vec<StoredRecord> {
        self.inner.committed.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.committed.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of committed rows for one request.
    pub fn count_for(&self, correlation_id: &CorrelationId) -> usize {
        self.inner
            .committed
            .lock()
            .iter()
            .filter(|r| &r.correlation_id == correlation_id)
            .count()
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("committed", &self.len())
            .finish()
    }
}

impl Store for MemoryStore {
    fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            pending: Vec::new(),
            state: TxnState::Active,
        }))
    }
}

struct MemoryTransaction {
    inner: Arc<Inner>,
    pending: Vec<ProvisionalRecord>,
    state: TxnState,
}

impl MemoryTransaction {
    fn ensure_active(&self) -> Result<(), StoreError> {
        match self.state {
            TxnState::Active => Ok(()),
            state => Err(StoreError::Closed(state)),
        }
    }
}

impl Transaction for MemoryTransaction {
    fn insert(&mut self, record: ProvisionalRecord) -> Result<(), StoreError> {
        self.ensure_active()?;
        if self.inner.reject_inserts.load(Ordering::Relaxed) {
            return Err(StoreError::InsertRejected);
        }
        self.pending.push(record);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_active()?;
        if self.inner.reject_commits.load(Ordering::Relaxed) {
            self.pending.clear();
            self.state = TxnState::RolledBack;
            return Err(StoreError::CommitRejected);
        }

        let mut committed = self.inner.committed.lock();
        for record in self.pending.drain(..) {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            committed.push(StoredRecord {
                id,
                correlation_id: record.correlation_id,
                payload: record.payload,
                inserted_at: record.inserted_at,
            });
        }
        self.state = TxnState::Committed;
        Ok(())
    }

    fn rollback(&mut self) {
        if self.state == TxnState::Active {
            self.pending.clear();
            self.state = TxnState::RolledBack;
        }
    }

    fn state(&self) -> TxnState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> ProvisionalRecord {
        ProvisionalRecord::new(CorrelationId::parse(id).unwrap(), "payload")
    }

    #[test]
    fn pending_rows_are_invisible_until_commit() {
        let store = MemoryStore::new();
        let mut txn = store.begin().unwrap();
        txn.insert(record("a")).unwrap();
        assert!(store.is_empty());

        txn.commit().unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(txn.state(), TxnState::Committed);

        let rows = store.records();
        assert_eq!(rows[0].id, 1);
        assert_eq!(rows[0].payload, "payload");
    }

    #[test]
    fn rollback_discards_and_is_idempotent() {
        let store = MemoryStore::new();
        let mut txn = store.begin().unwrap();
        txn.insert(record("a")).unwrap();
        txn.rollback();
        txn.rollback();
        assert_eq!(txn.state(), TxnState::RolledBack);
        assert!(store.is_empty());
        assert_eq!(
            txn.commit(),
            Err(StoreError::Closed(TxnState::RolledBack))
        );
    }

    #[test]
    fn rollback_after_commit_is_a_no_op() {
        let store = MemoryStore::new();
        let mut txn = store.begin().unwrap();
        txn.insert(record("a")).unwrap();
        txn.commit().unwrap();
        txn.rollback();
        assert_eq!(txn.state(), TxnState::Committed);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn concurrent_transactions_are_isolated() {
        let store = MemoryStore::new();
        let mut first = store.begin().unwrap();
        let mut second = store.begin().unwrap();
        first.insert(record("first")).unwrap();
        second.insert(record("second")).unwrap();

        second.rollback();
        first.commit().unwrap();

        assert_eq!(store.count_for(&CorrelationId::parse("first").unwrap()), 1);
        assert_eq!(store.count_for(&CorrelationId::parse("second").unwrap()), 0);
    }

    #[test]
    fn injected_failures() {
        let store = MemoryStore::new();
        store.reject_inserts(true);
        let mut txn = store.begin().unwrap();
        assert_eq!(txn.insert(record("a")), Err(StoreError::InsertRejected));

        store.reject_inserts(false);
        store.reject_commits(true);
        let mut txn = store.begin().unwrap();
        txn.insert(record("a")).unwrap();
        assert_eq!(txn.commit(), Err(StoreError::CommitRejected));
        assert_eq!(txn.state(), TxnState::RolledBack);
        assert!(store.is_empty());
    }
}
