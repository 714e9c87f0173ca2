mod wait_for_graph;

use crate::catalog::TableOid;
use crate::errors::DbError;
use crate::tuple::Rid;
use crate::txn::{AbortReason, Transaction, TransactionState, TxnId, TxnRegistry};
use anyhow::{bail, Result};
use log::{debug, warn};
use parking_lot::{Condvar, FairMutex, Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use wait_for_graph::WaitForGraph;

const DETECTION_PERIOD: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
    IntentionShared,
    IntentionExclusive,
    SharedIntentionExclusive,
}

impl LockMode {
    /// The standard multi-granularity compatibility matrix: IS conflicts
    /// only with X; S with IX, SIX, X; IX with S, SIX, X; SIX with all
    /// but IS; X with everything.
    pub fn compatible(held: LockMode, requested: LockMode) -> bool {
        use LockMode::*;
        match (held, requested) {
            (IntentionShared, other) => other != Exclusive,
            (IntentionExclusive, other) => {
                matches!(other, IntentionShared | IntentionExclusive)
            }
            (Shared, other) => matches!(other, IntentionShared | Shared),
            (SharedIntentionExclusive, other) => other == IntentionShared,
            (Exclusive, _) => false,
        }
    }

    /// Least upper bound in the lock lattice: the weakest mode covering
    /// both. Callers already holding a lock escalate to this instead of
    /// requesting an incomparable mode, which would abort them.
    pub fn lub(a: LockMode, b: LockMode) -> LockMode {
        use LockMode::*;
        if a == b {
            return a;
        }
        match (a, b) {
            (Exclusive, _) | (_, Exclusive) => Exclusive,
            (SharedIntentionExclusive, _) | (_, SharedIntentionExclusive) => {
                SharedIntentionExclusive
            }
            (Shared, IntentionExclusive) | (IntentionExclusive, Shared) => {
                SharedIntentionExclusive
            }
            (Shared, IntentionShared) | (IntentionShared, Shared) => Shared,
            (IntentionExclusive, IntentionShared) | (IntentionShared, IntentionExclusive) => {
                IntentionExclusive
            }
            _ => unreachable!("all distinct pairs are covered"),
        }
    }

    /// The allowed upgrade lattice: IS→{S,X,IX,SIX}; S→{X,SIX};
    /// IX→{X,SIX}; SIX→X.
    pub fn upgradable_to(self, target: LockMode) -> bool {
        use LockMode::*;
        match self {
            IntentionShared => matches!(
                target,
                Shared | Exclusive | IntentionExclusive | SharedIntentionExclusive
            ),
            Shared | IntentionExclusive => {
                matches!(target, Exclusive | SharedIntentionExclusive)
            }
            SharedIntentionExclusive => target == Exclusive,
            Exclusive => false,
        }
    }

    fn allows_row_exclusive(self) -> bool {
        matches!(
            self,
            LockMode::IntentionExclusive | LockMode::SharedIntentionExclusive | LockMode::Exclusive
        )
    }
}

#[derive(Debug)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    requests: Vec<LockRequest>,
    /// At most one in-flight upgrade per queue; it bypasses FIFO and
    /// blocks every other grant until it completes.
    upgrading: Option<TxnId>,
}

#[derive(Default)]
struct RequestQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

/// Request queues per table and per row, strict-2PL bookkeeping, and the
/// wait-for-graph deadlock detector. Waiters sleep on their queue's
/// condvar and re-check their transaction state on every wake, so an
/// asynchronous abort (deadlock victim) unblocks them.
pub struct LockManager {
    table_queues: FairMutex<HashMap<TableOid, Arc<RequestQueue>>>,
    row_queues: FairMutex<HashMap<Rid, Arc<RequestQueue>>>,
    registry: Arc<TxnRegistry>,
    shutdown: Arc<AtomicBool>,
    detector: Mutex<Option<JoinHandle<()>>>,
}

impl LockManager {
    pub fn new(registry: Arc<TxnRegistry>) -> Self {
        Self {
            table_queues: FairMutex::new(HashMap::new()),
            row_queues: FairMutex::new(HashMap::new()),
            registry,
            shutdown: Arc::new(AtomicBool::new(false)),
            detector: Mutex::new(None),
        }
    }

    pub fn lock_table(&self, txn: &Transaction, mode: LockMode, oid: TableOid) -> Result<()> {
        self.precheck(txn)?;
        let queue = self.table_queue(oid);
        self.acquire(txn, mode, &queue)?;
        txn.locks().tables.insert(oid, mode);
        debug!("txn {} holds {:?} on table {}", txn.id(), mode, oid);
        Ok(())
    }

    pub fn unlock_table(&self, txn: &Transaction, oid: TableOid) -> Result<()> {
        self.unlock_table_inner(txn, oid, false)
    }

    fn unlock_table_inner(&self, txn: &Transaction, oid: TableOid, force: bool) -> Result<()> {
        let queue = self.table_queue(oid);
        {
            let mut state = queue.state.lock();
            let pos = state
                .requests
                .iter()
                .position(|r| r.txn_id == txn.id() && r.granted);
            match pos {
                Some(pos) => {
                    state.requests.remove(pos);
                }
                None => bail!(DbError::Invariant(format!(
                    "txn {} does not hold a lock on table {oid}",
                    txn.id()
                ))),
            }
            Self::try_grant(&mut state);
            queue.cv.notify_all();
        }
        if !force {
            txn.begin_shrinking();
        }
        txn.locks().tables.remove(&oid);
        Ok(())
    }

    /// Row locks are only Shared or Exclusive and require a covering
    /// intent lock on the table.
    pub fn lock_row(&self, txn: &Transaction, mode: LockMode, oid: TableOid, rid: Rid) -> Result<()> {
        self.precheck(txn)?;
        let table_mode = txn.locks().tables.get(&oid).copied();
        let covered = match mode {
            LockMode::Exclusive => table_mode.is_some_and(|m| m.allows_row_exclusive()),
            // any held table lock covers a shared row lock
            LockMode::Shared => table_mode.is_some(),
            _ => bail!(DbError::Invariant(format!(
                "row locks must be S or X, not {mode:?}"
            ))),
        };
        if !covered {
            txn.mark_aborted(AbortReason::LockConflict);
            bail!(DbError::Conflict(format!(
                "txn {} requested a {mode:?} row lock without a covering intent lock on table {oid}",
                txn.id()
            )));
        }

        let queue = self.row_queue(rid);
        self.acquire(txn, mode, &queue)?;
        txn.locks().rows.entry(oid).or_default().insert(rid, mode);
        Ok(())
    }

    pub fn unlock_row(&self, txn: &Transaction, oid: TableOid, rid: Rid, force: bool) -> Result<()> {
        let queue = self.row_queue(rid);
        {
            let mut state = queue.state.lock();
            let pos = state
                .requests
                .iter()
                .position(|r| r.txn_id == txn.id() && r.granted);
            match pos {
                Some(pos) => {
                    state.requests.remove(pos);
                }
                None => bail!(DbError::Invariant(format!(
                    "txn {} does not hold a lock on row {rid}",
                    txn.id()
                ))),
            }
            Self::try_grant(&mut state);
            queue.cv.notify_all();
        }
        if !force {
            txn.begin_shrinking();
        }
        if let Some(rows) = txn.locks().rows.get_mut(&oid) {
            rows.remove(&rid);
        }
        Ok(())
    }

    /// Commit/abort-time bulk release: rows first, then tables, without
    /// the Growing→Shrinking transition (the transaction is ending).
    pub fn release_all(&self, txn: &Transaction) {
        let (tables, rows) = {
            let mut sets = txn.locks();
            (
                std::mem::take(&mut sets.tables),
                std::mem::take(&mut sets.rows),
            )
        };
        for (oid, rids) in rows {
            for rid in rids.keys() {
                if let Err(e) = self.unlock_row(txn, oid, *rid, true) {
                    warn!("releasing row lock {rid} of txn {}: {e}", txn.id());
                }
            }
        }
        for oid in tables.keys() {
            if let Err(e) = self.unlock_table_inner(txn, *oid, true) {
                warn!("releasing table lock {oid} of txn {}: {e}", txn.id());
            }
        }
    }

    fn precheck(&self, txn: &Transaction) -> Result<()> {
        match txn.state() {
            TransactionState::Aborted => bail!(self.abort_error(txn)),
            TransactionState::Committed => bail!(DbError::Invariant(format!(
                "txn {} is already committed",
                txn.id()
            ))),
            TransactionState::Shrinking => {
                txn.mark_aborted(AbortReason::LockConflict);
                bail!(DbError::Conflict(format!(
                    "txn {} acquired a lock while shrinking (2PL violation)",
                    txn.id()
                )));
            }
            TransactionState::Growing => Ok(()),
        }
    }

    fn abort_error(&self, txn: &Transaction) -> anyhow::Error {
        match txn.abort_reason() {
            Some(AbortReason::Deadlock) => DbError::Deadlock(txn.id()).into(),
            _ => DbError::Conflict(format!("txn {} is aborted", txn.id())).into(),
        }
    }

    /// Appends or upgrades a request on `queue` and blocks until granted
    /// or the transaction is aborted from outside.
    fn acquire(&self, txn: &Transaction, mode: LockMode, queue: &RequestQueue) -> Result<()> {
        let mut state = queue.state.lock();

        if let Some(pos) = state
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id() && r.granted)
        {
            let current = state.requests[pos].mode;
            if current == mode {
                return Ok(());
            }
            if !current.upgradable_to(mode) {
                txn.mark_aborted(AbortReason::LockConflict);
                bail!(DbError::Conflict(format!(
                    "txn {} cannot change a held {current:?} lock to {mode:?}",
                    txn.id()
                )));
            }
            if state.upgrading.is_some() {
                txn.mark_aborted(AbortReason::LockConflict);
                bail!(DbError::Conflict(format!(
                    "txn {} upgrade collided with another in-flight upgrade",
                    txn.id()
                )));
            }
            state.upgrading = Some(txn.id());
            state.requests[pos].mode = mode;
            state.requests[pos].granted = false;
            Self::try_grant(&mut state);
            let outcome = self.wait_granted(txn, queue, state);
            {
                let mut state = queue.state.lock();
                state.upgrading = None;
                Self::try_grant(&mut state);
                queue.cv.notify_all();
            }
            return outcome;
        }

        state.requests.push(LockRequest {
            txn_id: txn.id(),
            mode,
            granted: false,
        });
        Self::try_grant(&mut state);
        self.wait_granted(txn, queue, state)
    }

    /// FIFO wait loop. On every wake the transaction state is
    /// re-checked so a deadlock victim cleans up its request and leaves.
    fn wait_granted(
        &self,
        txn: &Transaction,
        queue: &RequestQueue,
        mut state: MutexGuard<'_, QueueState>,
    ) -> Result<()> {
        loop {
            let granted = state
                .requests
                .iter()
                .find(|r| r.txn_id == txn.id())
                .map(|r| r.granted)
                .unwrap_or(false);
            if granted {
                return Ok(());
            }
            if txn.is_aborted() {
                state.requests.retain(|r| r.txn_id != txn.id());
                if state.upgrading == Some(txn.id()) {
                    state.upgrading = None;
                }
                Self::try_grant(&mut state);
                queue.cv.notify_all();
                bail!(self.abort_error(txn));
            }
            queue.cv.wait(&mut state);
        }
    }

    /// Grants every request that (a) is compatible with all granted
    /// requests of other transactions and (b) has no earlier ungranted
    /// request ahead of it, except the reserved upgrader, which bypasses
    /// FIFO and starves everyone else until it finishes.
    fn try_grant(state: &mut QueueState) {
        for i in 0..state.requests.len() {
            if state.requests[i].granted {
                continue;
            }
            let txn_id = state.requests[i].txn_id;
            let mode = state.requests[i].mode;
            let is_upgrader = state.upgrading == Some(txn_id);
            if state.upgrading.is_some() && !is_upgrader {
                continue;
            }
            if !is_upgrader {
                let blocked_by_fifo = state.requests[..i]
                    .iter()
                    .any(|r| !r.granted && r.txn_id != txn_id);
                if blocked_by_fifo {
                    continue;
                }
            }
            let compatible = state.requests.iter().all(|r| {
                !r.granted || r.txn_id == txn_id || LockMode::compatible(r.mode, mode)
            });
            if compatible {
                state.requests[i].granted = true;
            }
        }
    }

    fn table_queue(&self, oid: TableOid) -> Arc<RequestQueue> {
        self.table_queues
            .lock()
            .entry(oid)
            .or_insert_with(|| Arc::new(RequestQueue::default()))
            .clone()
    }

    fn row_queue(&self, rid: Rid) -> Arc<RequestQueue> {
        self.row_queues
            .lock()
            .entry(rid)
            .or_insert_with(|| Arc::new(RequestQueue::default()))
            .clone()
    }

    /// Spawns the detector: every ~50 ms it rebuilds the wait-for graph
    /// from all queues, aborts the youngest transaction on each cycle and
    /// wakes every queue so victims clean up.
    pub fn start_detection(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("deadlock-detector".into())
            .spawn(move || {
                while !manager.shutdown.load(Ordering::SeqCst) {
                    std::thread::sleep(DETECTION_PERIOD);
                    manager.detect_once();
                }
            })
            .expect("spawning the deadlock detector");
        *self.detector.lock() = Some(handle);
    }

    fn detect_once(&self) {
        let queues: Vec<Arc<RequestQueue>> = {
            let tables = self.table_queues.lock();
            let rows = self.row_queues.lock();
            tables.values().chain(rows.values()).cloned().collect()
        };

        let mut graph = WaitForGraph::new();
        for queue in &queues {
            let state = queue.state.lock();
            for waiter in state.requests.iter().filter(|r| !r.granted) {
                for holder in state.requests.iter().filter(|r| r.granted) {
                    if holder.txn_id != waiter.txn_id
                        && !LockMode::compatible(holder.mode, waiter.mode)
                    {
                        graph.add_edge(waiter.txn_id, holder.txn_id);
                    }
                }
            }
        }
        if graph.is_empty() {
            return;
        }

        let mut victims = Vec::new();
        while let Some(victim) = graph.victim() {
            graph.remove_txn(victim);
            victims.push(victim);
        }
        if victims.is_empty() {
            return;
        }
        for victim in &victims {
            if let Some(txn) = self.registry.get(*victim) {
                warn!("deadlock: aborting youngest txn {victim}");
                txn.mark_aborted(AbortReason::Deadlock);
            }
        }
        for queue in &queues {
            queue.cv.notify_all();
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.detector.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::IsolationLevel;
    use std::time::Duration;

    fn test_setup() -> (Arc<LockManager>, Arc<TxnRegistry>) {
        let registry = Arc::new(TxnRegistry::default());
        (Arc::new(LockManager::new(registry.clone())), registry)
    }

    fn make_txn(registry: &Arc<TxnRegistry>, id: TxnId) -> Arc<Transaction> {
        let txn = Arc::new(Transaction::new(id, IsolationLevel::ReadCommitted));
        registry.insert(txn.clone());
        txn
    }

    #[test]
    fn test_compatibility_matrix() {
        use LockMode::*;
        let modes = [
            IntentionShared,
            IntentionExclusive,
            Shared,
            SharedIntentionExclusive,
            Exclusive,
        ];
        // rows: held, columns: requested
        let expected = [
            [true, true, true, true, false],   // IS
            [true, true, false, false, false], // IX
            [true, false, true, false, false], // S
            [true, false, false, false, false], // SIX
            [false, false, false, false, false], // X
        ];
        for (i, &held) in modes.iter().enumerate() {
            for (j, &requested) in modes.iter().enumerate() {
                assert_eq!(
                    LockMode::compatible(held, requested),
                    expected[i][j],
                    "held {held:?}, requested {requested:?}"
                );
            }
        }
    }

    #[test]
    fn test_shared_locks_coexist() -> Result<()> {
        let (lm, registry) = test_setup();
        let t1 = make_txn(&registry, 1);
        let t2 = make_txn(&registry, 2);
        lm.lock_table(&t1, LockMode::Shared, 10)?;
        lm.lock_table(&t2, LockMode::Shared, 10)?;
        lm.unlock_table(&t1, 10)?;
        lm.unlock_table(&t2, 10)?;
        Ok(())
    }

    #[test]
    fn test_exclusive_blocks_until_release() -> Result<()> {
        let (lm, registry) = test_setup();
        let t1 = make_txn(&registry, 1);
        let t2 = make_txn(&registry, 2);

        lm.lock_table(&t1, LockMode::Exclusive, 7)?;

        let lm2 = lm.clone();
        let t2c = t2.clone();
        let waiter = std::thread::spawn(move || lm2.lock_table(&t2c, LockMode::Exclusive, 7));

        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        lm.unlock_table(&t1, 7)?;
        waiter.join().unwrap()?;
        assert_eq!(t2.locks().tables.get(&7), Some(&LockMode::Exclusive));
        Ok(())
    }

    #[test]
    fn test_same_mode_is_noop() -> Result<()> {
        let (lm, registry) = test_setup();
        let t1 = make_txn(&registry, 1);
        lm.lock_table(&t1, LockMode::Shared, 3)?;
        lm.lock_table(&t1, LockMode::Shared, 3)?;
        Ok(())
    }

    #[test]
    fn test_upgrade_shared_to_exclusive() -> Result<()> {
        let (lm, registry) = test_setup();
        let t1 = make_txn(&registry, 1);
        lm.lock_table(&t1, LockMode::Shared, 3)?;
        lm.lock_table(&t1, LockMode::Exclusive, 3)?;
        assert_eq!(t1.locks().tables.get(&3), Some(&LockMode::Exclusive));
        Ok(())
    }

    #[test]
    fn test_invalid_downgrade_aborts() {
        let (lm, registry) = test_setup();
        let t1 = make_txn(&registry, 1);
        lm.lock_table(&t1, LockMode::Exclusive, 3).unwrap();
        let err = lm.lock_table(&t1, LockMode::Shared, 3).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::Conflict(_))
        ));
        assert!(t1.is_aborted());
    }

    #[test]
    fn test_row_lock_requires_intent() {
        let (lm, registry) = test_setup();
        let t1 = make_txn(&registry, 1);
        let err = lm
            .lock_row(&t1, LockMode::Exclusive, 5, Rid::new(2, 0))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::Conflict(_))
        ));
        assert!(t1.is_aborted());
    }

    #[test]
    fn test_row_lock_with_intent() -> Result<()> {
        let (lm, registry) = test_setup();
        let t1 = make_txn(&registry, 1);
        lm.lock_table(&t1, LockMode::IntentionExclusive, 5)?;
        lm.lock_row(&t1, LockMode::Exclusive, 5, Rid::new(2, 0))?;
        assert_eq!(
            t1.locks().rows.get(&5).and_then(|r| r.get(&Rid::new(2, 0))),
            Some(&LockMode::Exclusive)
        );
        lm.release_all(&t1);
        assert!(t1.locks().tables.is_empty());
        Ok(())
    }

    #[test]
    fn test_lock_after_shrinking_aborts() -> Result<()> {
        let (lm, registry) = test_setup();
        let t1 = make_txn(&registry, 1);
        lm.lock_table(&t1, LockMode::Shared, 1)?;
        lm.unlock_table(&t1, 1)?;
        assert_eq!(t1.state(), TransactionState::Shrinking);
        assert!(lm.lock_table(&t1, LockMode::Shared, 2).is_err());
        assert!(t1.is_aborted());
        Ok(())
    }

    #[test]
    fn test_deadlock_detection_aborts_youngest() -> Result<()> {
        let (lm, registry) = test_setup();
        lm.start_detection();

        let t1 = make_txn(&registry, 1);
        let t2 = make_txn(&registry, 2);
        let (r1, r2) = (Rid::new(1, 0), Rid::new(1, 1));

        lm.lock_table(&t1, LockMode::IntentionExclusive, 9)?;
        lm.lock_table(&t2, LockMode::IntentionExclusive, 9)?;
        lm.lock_row(&t1, LockMode::Exclusive, 9, r1)?;
        lm.lock_row(&t2, LockMode::Exclusive, 9, r2)?;

        let lm1 = lm.clone();
        let t1c = t1.clone();
        let a = std::thread::spawn(move || lm1.lock_row(&t1c, LockMode::Exclusive, 9, r2));
        let lm2 = lm.clone();
        let t2c = t2.clone();
        let b = std::thread::spawn(move || lm2.lock_row(&t2c, LockMode::Exclusive, 9, r1));

        // the youngest (txn 2) is the victim and returns first
        let rb = b.join().unwrap();
        let err = rb.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::Deadlock(2))
        ));
        assert!(t2.is_aborted());

        // once the victim's locks are released, the survivor completes
        lm.release_all(&t2);
        let ra = a.join().unwrap();
        assert!(ra.is_ok());

        lm.release_all(&t1);
        lm.shutdown();
        Ok(())
    }
}
