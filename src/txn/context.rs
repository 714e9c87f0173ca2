use super::{
    AbortReason, IsolationLevel, Transaction, TransactionState, TxnRegistry,
};
use crate::buffer_pool::{ArcBufferPool, PageGuard};
use crate::errors::DbError;
use crate::lock_manager::LockManager;
use crate::pages::table_page::TablePageMut;
use crate::tuple::Rid;
use crate::wal::log_manager::LogManager;
use crate::wal::log_record::LogPayload;
use crate::wal::INVALID_LSN;
use anyhow::{bail, Result};
use log::{debug, info};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Factory and lifecycle manager for transactions: allocates ids,
/// registers them, and drives the commit and abort protocols.
///
/// Commit is durable: the COMMIT record is force-flushed before control
/// returns. Abort walks the transaction's prev-LSN chain backward and
/// reverses each data record in place before logging ABORT.
pub struct TransactionContext {
    next_txn_id: AtomicU32,
    registry: Arc<TxnRegistry>,
    lock_manager: Arc<LockManager>,
    log: Arc<LogManager>,
    bpm: ArcBufferPool,
}

impl TransactionContext {
    pub fn new(
        registry: Arc<TxnRegistry>,
        lock_manager: Arc<LockManager>,
        log: Arc<LogManager>,
        bpm: ArcBufferPool,
    ) -> Self {
        Self {
            next_txn_id: AtomicU32::new(0),
            registry,
            lock_manager,
            log,
            bpm,
        }
    }

    pub fn registry(&self) -> &Arc<TxnRegistry> {
        &self.registry
    }

    pub fn begin(&self, isolation: IsolationLevel) -> Result<Arc<Transaction>> {
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(id, isolation));
        let lsn = self.log.append(INVALID_LSN, id, LogPayload::Begin)?;
        txn.set_prev_lsn(lsn);
        self.registry.insert(txn.clone());
        debug!("txn {id} began at lsn {lsn} ({isolation:?})");
        Ok(txn)
    }

    pub fn commit(&self, txn: &Arc<Transaction>) -> Result<()> {
        match txn.state() {
            TransactionState::Aborted => bail!(DbError::Conflict(format!(
                "txn {} is aborted and cannot commit",
                txn.id()
            ))),
            TransactionState::Committed => bail!(DbError::Invariant(format!(
                "txn {} committed twice",
                txn.id()
            ))),
            _ => {}
        }

        let lsn = self
            .log
            .append(txn.prev_lsn(), txn.id(), LogPayload::Commit)?;
        txn.set_prev_lsn(lsn);
        self.log.force_flush_until(lsn)?;

        self.lock_manager.release_all(txn);
        txn.set_state(TransactionState::Committed);
        self.registry.remove(txn.id());
        self.log.prune_txn(txn.id());
        debug!("txn {} committed at lsn {lsn}", txn.id());
        Ok(())
    }

    /// Rolls back everything the transaction did, newest change first.
    /// Also the cleanup path for deadlock victims, whose state is
    /// already Aborted when they get here.
    pub fn abort(&self, txn: &Arc<Transaction>) -> Result<()> {
        if txn.state() == TransactionState::Committed {
            bail!(DbError::Invariant(format!(
                "txn {} is committed and cannot abort",
                txn.id()
            )));
        }

        let mut lsn = txn.prev_lsn();
        while lsn != INVALID_LSN {
            let record = match self.log.record(lsn) {
                Some(record) => record,
                None => bail!(DbError::Corruption(format!(
                    "undo chain of txn {} broke at lsn {lsn}",
                    txn.id()
                ))),
            };
            self.undo(&record.payload)?;
            lsn = record.prev_lsn;
        }

        let lsn = self
            .log
            .append(txn.prev_lsn(), txn.id(), LogPayload::Abort)?;
        txn.set_prev_lsn(lsn);

        self.lock_manager.release_all(txn);
        txn.mark_aborted(AbortReason::User);
        self.registry.remove(txn.id());
        self.log.prune_txn(txn.id());
        info!("txn {} aborted, changes rolled back", txn.id());
        Ok(())
    }

    /// Reverses one data record. Each step is idempotent, so a crash
    /// between undo and the ABORT record only means recovery repeats it.
    fn undo(&self, payload: &LogPayload) -> Result<()> {
        match payload {
            LogPayload::Insert { rid, .. } => {
                let mut guard = self.fetch(*rid)?;
                TablePageMut::new(&mut guard.write()).mark_delete(rid.slot)?;
            }
            LogPayload::Delete { rid, .. } => {
                let mut guard = self.fetch(*rid)?;
                TablePageMut::new(&mut guard.write()).rollback_delete(rid.slot)?;
            }
            LogPayload::Update { rid, old_tuple, .. } => {
                let mut guard = self.fetch(*rid)?;
                TablePageMut::new(&mut guard.write()).update(rid.slot, old_tuple)?;
            }
            // BEGIN ends the chain; NEW_PAGE is not reversed, the
            // empty page just stays in the chain
            _ => {}
        }
        Ok(())
    }

    fn fetch(&self, rid: Rid) -> Result<PageGuard> {
        PageGuard::fetch(&self.bpm, rid.page_id)
    }
}
