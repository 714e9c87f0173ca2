pub(crate) mod context;

use crate::catalog::TableOid;
use crate::lock_manager::LockMode;
use crate::tuple::Rid;
use crate::wal::{Lsn, INVALID_LSN};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub type TxnId = u32;
pub const INVALID_TXN_ID: TxnId = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Acquiring locks.
    Growing,
    /// Has released a lock; may not acquire under strict 2PL.
    Shrinking,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    User,
    Deadlock,
    LockConflict,
}

/// All locks a transaction currently holds, at both granularities.
#[derive(Debug, Default)]
pub struct LockSets {
    pub tables: HashMap<TableOid, LockMode>,
    pub rows: HashMap<TableOid, HashMap<Rid, LockMode>>,
}

/// Per-transaction state. Shared between the session thread, the lock
/// manager and the deadlock detector, so the mutable pieces sit behind
/// their own locks and atomics.
pub struct Transaction {
    id: TxnId,
    isolation: IsolationLevel,
    state: Mutex<TransactionState>,
    abort_reason: Mutex<Option<AbortReason>>,
    /// Head of this transaction's backward log-record chain.
    prev_lsn: AtomicU32,
    start_time: Instant,
    locks: Mutex<LockSets>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation: IsolationLevel) -> Self {
        Self {
            id,
            isolation,
            state: Mutex::new(TransactionState::Growing),
            abort_reason: Mutex::new(None),
            prev_lsn: AtomicU32::new(INVALID_LSN),
            start_time: Instant::now(),
            locks: Mutex::new(LockSets::default()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    /// Moves Growing to Shrinking on the first lock release; terminal
    /// states stay put.
    pub fn begin_shrinking(&self) {
        let mut state = self.state.lock();
        if *state == TransactionState::Growing {
            *state = TransactionState::Shrinking;
        }
    }

    /// Asynchronous abort, used by the deadlock detector and by failed
    /// lock requests. A terminal state is never overwritten.
    pub fn mark_aborted(&self, reason: AbortReason) {
        let mut state = self.state.lock();
        if *state == TransactionState::Committed {
            return;
        }
        *state = TransactionState::Aborted;
        self.abort_reason.lock().get_or_insert(reason);
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == TransactionState::Aborted
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        *self.abort_reason.lock()
    }

    pub fn prev_lsn(&self) -> Lsn {
        self.prev_lsn.load(Ordering::SeqCst)
    }

    pub fn set_prev_lsn(&self, lsn: Lsn) {
        self.prev_lsn.store(lsn, Ordering::SeqCst);
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn locks(&self) -> MutexGuard<'_, LockSets> {
        self.locks.lock()
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("isolation", &self.isolation)
            .finish()
    }
}

/// Registry of running transactions, shared by the transaction context
/// (which populates it) and the deadlock detector (which aborts through
/// it).
#[derive(Default)]
pub struct TxnRegistry {
    txns: RwLock<HashMap<TxnId, Arc<Transaction>>>,
}

impl TxnRegistry {
    pub fn insert(&self, txn: Arc<Transaction>) {
        self.txns.write().insert(txn.id(), txn);
    }

    pub fn remove(&self, txn_id: TxnId) {
        self.txns.write().remove(&txn_id);
    }

    pub fn get(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.txns.read().get(&txn_id).cloned()
    }

    pub fn active(&self) -> Vec<Arc<Transaction>> {
        self.txns.read().values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.txns.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let txn = Transaction::new(1, IsolationLevel::ReadCommitted);
        assert_eq!(txn.state(), TransactionState::Growing);
        txn.begin_shrinking();
        assert_eq!(txn.state(), TransactionState::Shrinking);
        txn.begin_shrinking();
        assert_eq!(txn.state(), TransactionState::Shrinking);
    }

    #[test]
    fn test_mark_aborted_keeps_first_reason() {
        let txn = Transaction::new(2, IsolationLevel::Serializable);
        txn.mark_aborted(AbortReason::Deadlock);
        txn.mark_aborted(AbortReason::User);
        assert!(txn.is_aborted());
        assert_eq!(txn.abort_reason(), Some(AbortReason::Deadlock));
    }

    #[test]
    fn test_committed_is_terminal() {
        let txn = Transaction::new(3, IsolationLevel::ReadCommitted);
        txn.set_state(TransactionState::Committed);
        txn.mark_aborted(AbortReason::Deadlock);
        assert_eq!(txn.state(), TransactionState::Committed);
    }

    #[test]
    fn test_registry() {
        let registry = TxnRegistry::default();
        let txn = Arc::new(Transaction::new(9, IsolationLevel::ReadCommitted));
        registry.insert(txn.clone());
        assert_eq!(registry.get(9).unwrap().id(), 9);
        registry.remove(9);
        assert!(registry.get(9).is_none());
        assert!(registry.is_empty());
    }
}
