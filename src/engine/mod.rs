use crate::buffer_pool::{ArcBufferPool, BufferPoolManager, ReplacerKind, DEFAULT_POOL_SIZE};
use crate::catalog::{Catalog, IndexOid, TableOid};
use crate::disk_manager::DiskManager;
use crate::errors::DbError;
use crate::index::Index;
use crate::lock_manager::{LockManager, LockMode};
use crate::tuple::schema::Schema;
use crate::tuple::{Rid, Tuple};
use crate::txn::context::TransactionContext;
use crate::txn::{IsolationLevel, Transaction, TransactionState, TxnId, TxnRegistry, INVALID_TXN_ID};
use crate::wal::log_manager::{LogManager, LOG_FILE};
use crate::wal::log_record::LogPayload;
use crate::wal::recovery::RecoveryManager;
use crate::wal::{Lsn, FIRST_LSN, INVALID_LSN};
use anyhow::{bail, Result};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The storage kernel behind one database directory: pager, buffer
/// pool, WAL, lock manager, transaction registry and catalog, plus the
/// background flusher and deadlock detector.
///
/// `open` runs restart recovery before anything else; `shutdown` (or
/// drop) joins the background threads and flushes log then data.
pub struct Engine {
    dir: PathBuf,
    disk: Arc<DiskManager>,
    log: Arc<LogManager>,
    bpm: ArcBufferPool,
    lock_manager: Arc<LockManager>,
    txn_context: Arc<TransactionContext>,
    catalog: Catalog,
    crashed: AtomicBool,
    shut_down: AtomicBool,
}

impl Engine {
    pub fn open(dir: impl AsRef<Path>) -> Result<Engine> {
        Self::open_with(dir, DEFAULT_POOL_SIZE, ReplacerKind::Lru)
    }

    pub fn open_with(
        dir: impl AsRef<Path>,
        pool_size: usize,
        replacer: ReplacerKind,
    ) -> Result<Engine> {
        let dir = dir.as_ref().to_path_buf();
        let disk = Arc::new(DiskManager::new(&dir)?);
        let log = LogManager::open(&dir)?;
        let bpm =
            BufferPoolManager::new(pool_size, disk.clone(), log.clone(), replacer).into_shared();

        // recovery runs before any other activity
        let report =
            RecoveryManager::new(bpm.clone(), disk.clone(), dir.join(LOG_FILE)).recover()?;
        log.bootstrap(
            report.max_lsn.map(|lsn| lsn + 1).unwrap_or(FIRST_LSN),
            report.max_lsn,
        );
        bpm.lock().flush_all()?;
        disk.sync()?;

        log.start_flusher();
        let registry = Arc::new(TxnRegistry::default());
        let lock_manager = Arc::new(LockManager::new(registry.clone()));
        lock_manager.start_detection();
        let txn_context = Arc::new(TransactionContext::new(
            registry,
            lock_manager.clone(),
            log.clone(),
            bpm.clone(),
        ));
        let catalog = Catalog::load(bpm.clone(), log.clone())?;
        // a table's first page may never have reached the data file
        // before a crash; keep the allocator ahead of every cataloged
        // heap root so it cannot be handed out twice
        for name in catalog.table_names() {
            if let Some(meta) = catalog.table_meta(&name) {
                disk.note_allocated(meta.first_page_id);
            }
        }

        info!("engine open at {}", dir.display());
        Ok(Engine {
            dir,
            disk,
            log,
            bpm,
            lock_manager,
            txn_context,
            catalog,
            crashed: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn begin(&self, isolation: IsolationLevel) -> Result<Arc<Transaction>> {
        self.txn_context.begin(isolation)
    }

    pub fn commit(&self, txn: &Arc<Transaction>) -> Result<()> {
        self.txn_context.commit(txn)
    }

    pub fn abort(&self, txn: &Arc<Transaction>) -> Result<()> {
        self.txn_context.abort(txn)
    }

    pub fn create_table(
        &self,
        name: &str,
        schema: &Schema,
        txn: Option<&Arc<Transaction>>,
    ) -> Result<TableOid> {
        self.catalog.create_table(name, schema, txn.map(|t| t.as_ref()))
    }

    pub fn drop_table(&self, name: &str, txn: Option<&Arc<Transaction>>) -> Result<()> {
        self.catalog.drop_table(name, txn.map(|t| t.as_ref()))
    }

    /// Registers a single-column index and backfills it from the table.
    pub fn create_index(&self, name: &str, table: &str, key_attrs: &[usize]) -> Result<IndexOid> {
        let (oid, index) = self.catalog.create_index(name, table, key_attrs)?;
        let meta = self
            .catalog
            .index_meta(name)
            .expect("index registered a moment ago");
        let heap = self.catalog.heap(meta.table_oid)?;
        for (tuple, rid) in heap.iter() {
            let key = tuple.project(&meta.key_attrs)?;
            if key.values()[0].is_null() {
                continue;
            }
            index.insert(&key, rid, None)?;
        }
        Ok(oid)
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        self.catalog.drop_index(name)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.catalog.table_names()
    }

    pub fn insert(
        &self,
        table: &str,
        tuple: Tuple,
        txn: Option<&Arc<Transaction>>,
    ) -> Result<Rid> {
        let meta = self.table_meta(table)?;
        meta.schema.validate(&tuple)?;
        let heap = self.catalog.heap(meta.oid)?;

        self.with_txn(txn, |t| {
            let table_mode = Self::table_mode(t, meta.oid, LockMode::IntentionExclusive);
            self.lock_manager.lock_table(t, table_mode, meta.oid)?;
            let rid = heap.insert(&tuple, t)?;
            self.lock_manager
                .lock_row(t, LockMode::Exclusive, meta.oid, rid)?;
            for (index_meta, index) in self.catalog.table_indexes(meta.oid) {
                let key = tuple.project(&index_meta.key_attrs)?;
                if !key.values()[0].is_null() {
                    index.insert(&key, rid, Some(t.as_ref()))?;
                }
            }
            Ok(rid)
        })
    }

    /// Rewrites the tuple at `rid`. Returns false when the RID names no
    /// live tuple.
    pub fn update(
        &self,
        table: &str,
        rid: Rid,
        tuple: Tuple,
        txn: Option<&Arc<Transaction>>,
    ) -> Result<bool> {
        let meta = self.table_meta(table)?;
        meta.schema.validate(&tuple)?;
        let heap = self.catalog.heap(meta.oid)?;

        self.with_txn(txn, |t| {
            let table_mode = Self::table_mode(t, meta.oid, LockMode::IntentionExclusive);
            self.lock_manager.lock_table(t, table_mode, meta.oid)?;
            let row_mode = Self::row_mode(t, meta.oid, rid, LockMode::Exclusive);
            self.lock_manager.lock_row(t, row_mode, meta.oid, rid)?;
            let old = match heap.get(rid)? {
                Some(old) => old,
                None => return Ok(false),
            };
            if !heap.update(rid, &tuple, t)? {
                return Ok(false);
            }
            for (index_meta, index) in self.catalog.table_indexes(meta.oid) {
                let old_key = old.project(&index_meta.key_attrs)?;
                if !old_key.values()[0].is_null() {
                    index.delete(&old_key, rid, Some(t.as_ref()))?;
                }
                let new_key = tuple.project(&index_meta.key_attrs)?;
                if !new_key.values()[0].is_null() {
                    index.insert(&new_key, rid, Some(t.as_ref()))?;
                }
            }
            Ok(true)
        })
    }

    /// Tombstones the tuple at `rid`. Returns false when it was not
    /// there.
    pub fn delete(&self, table: &str, rid: Rid, txn: Option<&Arc<Transaction>>) -> Result<bool> {
        let meta = self.table_meta(table)?;
        let heap = self.catalog.heap(meta.oid)?;

        self.with_txn(txn, |t| {
            let table_mode = Self::table_mode(t, meta.oid, LockMode::IntentionExclusive);
            self.lock_manager.lock_table(t, table_mode, meta.oid)?;
            let row_mode = Self::row_mode(t, meta.oid, rid, LockMode::Exclusive);
            self.lock_manager.lock_row(t, row_mode, meta.oid, rid)?;
            let old = match heap.get(rid)? {
                Some(old) => old,
                None => return Ok(false),
            };
            if !heap.mark_delete(rid, t)? {
                return Ok(false);
            }
            for (index_meta, index) in self.catalog.table_indexes(meta.oid) {
                let key = old.project(&index_meta.key_attrs)?;
                if !key.values()[0].is_null() {
                    index.delete(&key, rid, Some(t.as_ref()))?;
                }
            }
            Ok(true)
        })
    }

    pub fn get_tuple(
        &self,
        table: &str,
        rid: Rid,
        txn: Option<&Arc<Transaction>>,
    ) -> Result<Option<Tuple>> {
        let meta = self.table_meta(table)?;
        let heap = self.catalog.heap(meta.oid)?;
        self.with_txn(txn, |t| {
            let table_mode = Self::table_mode(t, meta.oid, LockMode::IntentionShared);
            self.lock_manager.lock_table(t, table_mode, meta.oid)?;
            let row_mode = Self::row_mode(t, meta.oid, rid, LockMode::Shared);
            self.lock_manager.lock_row(t, row_mode, meta.oid, rid)?;
            heap.get(rid)
        })
    }

    /// Full scan. With a transaction, the table is S-locked for the
    /// transaction's duration and the iterator is live; without one, an
    /// internal read transaction materializes the rows and commits.
    pub fn scan(
        &self,
        table: &str,
        txn: Option<&Arc<Transaction>>,
    ) -> Result<Box<dyn Iterator<Item = (Tuple, Rid)> + Send>> {
        let meta = self.table_meta(table)?;
        let heap = self.catalog.heap(meta.oid)?;
        match txn {
            Some(t) => {
                self.check_usable(t)?;
                let mode = Self::table_mode(t, meta.oid, LockMode::Shared);
                self.lock_manager.lock_table(t, mode, meta.oid)?;
                Ok(Box::new(heap.iter()))
            }
            None => {
                let t = self.begin(IsolationLevel::ReadCommitted)?;
                self.lock_manager
                    .lock_table(&t, LockMode::Shared, meta.oid)?;
                let rows: Vec<(Tuple, Rid)> = heap.iter().collect();
                self.commit(&t)?;
                Ok(Box::new(rows.into_iter()))
            }
        }
    }

    /// Point lookup through an index, re-validated against the heap so
    /// stale entries never surface.
    pub fn index_lookup(
        &self,
        index_name: &str,
        key: &Tuple,
        txn: Option<&Arc<Transaction>>,
    ) -> Result<Vec<(Tuple, Rid)>> {
        let meta = match self.catalog.index_meta(index_name) {
            Some(meta) => meta,
            None => bail!(DbError::NotFound(format!("index {index_name}"))),
        };
        meta.key_schema.validate(key)?;
        let heap = self.catalog.heap(meta.table_oid)?;
        let indexes = self.catalog.table_indexes(meta.table_oid);
        let (_, index) = indexes
            .iter()
            .find(|(m, _)| m.oid == meta.oid)
            .expect("metadata and entry maps agree");

        self.with_txn(txn, |t| {
            let mode = Self::table_mode(t, meta.table_oid, LockMode::IntentionShared);
            self.lock_manager.lock_table(t, mode, meta.table_oid)?;
            let mut out = Vec::new();
            for rid in index.scan_key(key, Some(t.as_ref()))? {
                if let Some(tuple) = heap.get(rid)? {
                    out.push((tuple, rid));
                }
            }
            Ok(out)
        })
    }

    /// Flushes the log, writes every dirty page (WAL gate first) and
    /// appends a CHECKPOINT record carrying the live transaction table.
    pub fn checkpoint(&self) -> Result<()> {
        self.log.flush()?;
        self.bpm.lock().flush_all()?;
        let active: Vec<(TxnId, Lsn)> = self
            .txn_context
            .registry()
            .active()
            .iter()
            .map(|t| (t.id(), t.prev_lsn()))
            .collect();
        let lsn = self.log.append(
            INVALID_LSN,
            INVALID_TXN_ID,
            LogPayload::Checkpoint {
                active_txns: active,
                dirty_pages: Vec::new(),
            },
        )?;
        self.log.force_flush_until(lsn)?;
        self.disk.sync()?;
        info!("checkpoint at lsn {lsn}");
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.bpm.lock().flush_all()
    }

    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.lock_manager.shutdown();
        self.log.shutdown()?;
        self.bpm.lock().flush_all()?;
        self.disk.shutdown()?;
        info!("engine shut down at {}", self.dir.display());
        Ok(())
    }

    /// Kills the process state without flushing data pages, for crash
    /// tests: only the background threads stop (the log keeps whatever
    /// already reached it).
    #[cfg(test)]
    pub(crate) fn crash(self) {
        self.crashed.store(true, Ordering::SeqCst);
    }

    fn table_meta(&self, table: &str) -> Result<crate::catalog::TableMeta> {
        match self.catalog.table_meta(table) {
            Some(meta) => Ok(meta),
            None => bail!(DbError::NotFound(format!("table {table}"))),
        }
    }

    /// Mode to request at table granularity: escalates over whatever the
    /// transaction already holds, so a read after a write (or the other
    /// way round) never asks for an incomparable mode.
    fn table_mode(txn: &Transaction, oid: TableOid, needed: LockMode) -> LockMode {
        match txn.locks().tables.get(&oid).copied() {
            Some(held) => LockMode::lub(held, needed),
            None => needed,
        }
    }

    /// Same escalation at row granularity: an X already held covers a
    /// later S on the same row.
    fn row_mode(txn: &Transaction, oid: TableOid, rid: Rid, needed: LockMode) -> LockMode {
        match txn
            .locks()
            .rows
            .get(&oid)
            .and_then(|rows| rows.get(&rid))
            .copied()
        {
            Some(held) => LockMode::lub(held, needed),
            None => needed,
        }
    }

    fn check_usable(&self, txn: &Arc<Transaction>) -> Result<()> {
        match txn.state() {
            TransactionState::Aborted => bail!(DbError::Conflict(format!(
                "txn {} is aborted; roll it back",
                txn.id()
            ))),
            TransactionState::Committed => bail!(DbError::Invariant(format!(
                "txn {} already committed",
                txn.id()
            ))),
            _ => Ok(()),
        }
    }

    /// Runs `op` under the given transaction, or under a fresh
    /// auto-commit transaction that commits on success and rolls back on
    /// failure.
    fn with_txn<T>(
        &self,
        txn: Option<&Arc<Transaction>>,
        op: impl FnOnce(&Arc<Transaction>) -> Result<T>,
    ) -> Result<T> {
        match txn {
            Some(t) => {
                self.check_usable(t)?;
                op(t)
            }
            None => {
                let t = self.begin(IsolationLevel::ReadCommitted)?;
                match op(&t) {
                    Ok(out) => {
                        self.commit(&t)?;
                        Ok(out)
                    }
                    Err(e) => {
                        if let Err(abort_err) = self.abort(&t) {
                            warn!("auto-commit rollback of txn {} failed: {abort_err}", t.id());
                        }
                        Err(e)
                    }
                }
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.crashed.load(Ordering::SeqCst) {
            // stop the threads, leave the data pages unflushed
            self.lock_manager.shutdown();
            let _ = self.log.shutdown();
            return;
        }
        if let Err(e) = self.shutdown() {
            warn!("shutdown on drop failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk_manager::test_dir;
    use crate::tuple::schema::Field;
    use crate::types::{Types, Value};
    use anyhow::Result;
    use std::path::PathBuf;

    static INIT: std::sync::Once = std::sync::Once::new();

    fn init_log() {
        INIT.call_once(|| {
            let _ = env_logger::builder().is_test(true).try_init();
        });
    }

    fn people_schema() -> Schema {
        Schema::new(vec![
            Field::new("id", Types::Int32, false),
            Field::new("name", Types::Str, true),
        ])
    }

    fn row(id: i32, name: &str) -> Tuple {
        Tuple::new(vec![Value::Int32(id), Value::Str(name.to_string())])
    }

    /// S1 fixture: table t with (1,"a") (2,"b") (3,"c"), committed.
    fn seeded(dir: &PathBuf) -> Result<(Engine, Vec<Rid>)> {
        init_log();
        let engine = Engine::open(dir)?;
        engine.create_table("t", &people_schema(), None)?;
        let txn = engine.begin(IsolationLevel::ReadCommitted)?;
        let rids = vec![
            engine.insert("t", row(1, "a"), Some(&txn))?,
            engine.insert("t", row(2, "b"), Some(&txn))?,
            engine.insert("t", row(3, "c"), Some(&txn))?,
        ];
        engine.commit(&txn)?;
        Ok((engine, rids))
    }

    fn sorted_rows(engine: &Engine) -> Result<Vec<Tuple>> {
        let mut rows: Vec<(Tuple, Rid)> = engine.scan("t", None)?.collect();
        rows.sort_by_key(|(_, rid)| *rid);
        Ok(rows.into_iter().map(|(tuple, _)| tuple).collect())
    }

    #[test]
    fn test_insert_and_scan() -> Result<()> {
        let dir = test_dir();
        let (engine, _) = seeded(&dir)?;
        assert_eq!(
            sorted_rows(&engine)?,
            vec![row(1, "a"), row(2, "b"), row(3, "c")]
        );
        drop(engine);
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn test_update_and_delete_visibility() -> Result<()> {
        let dir = test_dir();
        let (engine, rids) = seeded(&dir)?;

        assert!(engine.update("t", rids[1], row(2, "B"), None)?);
        assert!(engine.delete("t", rids[2], None)?);
        // the rid of row 2 is unchanged
        assert_eq!(engine.get_tuple("t", rids[1], None)?, Some(row(2, "B")));
        assert_eq!(sorted_rows(&engine)?, vec![row(1, "a"), row(2, "B")]);

        // a second delete of the same rid reports false
        assert!(!engine.delete("t", rids[2], None)?);
        drop(engine);
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn test_crash_after_commit_recovers_all() -> Result<()> {
        let dir = test_dir();
        let (engine, rids) = seeded(&dir)?;
        engine.crash();

        let engine = Engine::open(&dir)?;
        assert_eq!(
            sorted_rows(&engine)?,
            vec![row(1, "a"), row(2, "b"), row(3, "c")]
        );
        // RIDs are stable across the restart
        assert_eq!(engine.get_tuple("t", rids[0], None)?, Some(row(1, "a")));
        drop(engine);
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn test_crash_mid_transaction_rolls_back() -> Result<()> {
        let dir = test_dir();
        let (engine, _) = seeded(&dir)?;

        let txn = engine.begin(IsolationLevel::ReadCommitted)?;
        engine.insert("t", row(4, "d"), Some(&txn))?;
        // force the uncommitted record into the log file, then die
        engine.log.flush()?;
        engine.crash();

        let engine = Engine::open(&dir)?;
        assert_eq!(
            sorted_rows(&engine)?,
            vec![row(1, "a"), row(2, "b"), row(3, "c")]
        );
        drop(engine);
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn test_abort_restores_previous_state() -> Result<()> {
        let dir = test_dir();
        let (engine, rids) = seeded(&dir)?;

        let txn = engine.begin(IsolationLevel::ReadCommitted)?;
        engine.insert("t", row(4, "d"), Some(&txn))?;
        engine.update("t", rids[0], row(1, "A"), Some(&txn))?;
        engine.delete("t", rids[1], Some(&txn))?;
        engine.abort(&txn)?;

        assert_eq!(
            sorted_rows(&engine)?,
            vec![row(1, "a"), row(2, "b"), row(3, "c")]
        );
        drop(engine);
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn test_mutation_on_aborted_txn_fails() -> Result<()> {
        let dir = test_dir();
        let (engine, _) = seeded(&dir)?;
        let txn = engine.begin(IsolationLevel::ReadCommitted)?;
        engine.abort(&txn)?;

        let err = engine.insert("t", row(9, "x"), Some(&txn)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::Conflict(_))
        ));
        let err = engine.commit(&txn).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::Conflict(_))
        ));
        drop(engine);
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn test_deadlock_between_two_writers() -> Result<()> {
        let dir = test_dir();
        let engine = Arc::new({
            let (engine, _) = seeded(&dir)?;
            engine
        });
        let rids: Vec<Rid> = {
            let mut rows: Vec<(Tuple, Rid)> = engine.scan("t", None)?.collect();
            rows.sort_by_key(|(_, rid)| *rid);
            rows.into_iter().map(|(_, rid)| rid).collect()
        };

        let a = engine.begin(IsolationLevel::ReadCommitted)?;
        let b = engine.begin(IsolationLevel::ReadCommitted)?;
        engine.update("t", rids[0], row(1, "from-a"), Some(&a))?;
        engine.update("t", rids[1], row(2, "from-b"), Some(&b))?;

        // cross over: a -> b's row, b -> a's row
        let thread_a = {
            let (engine, a, rid) = (engine.clone(), a.clone(), rids[1]);
            std::thread::spawn(move || engine.update("t", rid, row(2, "a-too"), Some(&a)))
        };
        let thread_b = {
            let (engine, b, rid) = (engine.clone(), b.clone(), rids[0]);
            std::thread::spawn(move || engine.update("t", rid, row(1, "b-too"), Some(&b)))
        };

        // the detector kills the youngest (b) within a cycle or two
        let result_b = thread_b.join().unwrap();
        let err = result_b.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::Deadlock(_))
        ));
        assert_eq!(b.state(), TransactionState::Aborted);

        // rolling the victim back unblocks the survivor
        engine.abort(&b)?;
        let result_a = thread_a.join().unwrap();
        assert!(result_a.is_ok());
        engine.commit(&a)?;

        assert_eq!(
            sorted_rows(&engine)?,
            vec![row(1, "from-a"), row(2, "a-too"), row(3, "c")]
        );
        drop(engine);
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn test_eviction_forces_wal_flush() -> Result<()> {
        let dir = test_dir();
        let engine = Engine::open_with(&dir, 4, ReplacerKind::Lru)?;
        engine.create_table("t", &people_schema(), None)?;

        // a long uncommitted transaction dirties several chained pages;
        // the 4-frame pool must evict dirty pages to make room
        let txn = engine.begin(IsolationLevel::ReadCommitted)?;
        for i in 0..600 {
            engine.insert("t", row(i, "filler filler filler"), Some(&txn))?;
        }

        // any dirty page that reached disk was preceded by a log flush
        // covering its LSN
        let meta = engine.catalog.table_meta("t").unwrap();
        let mut on_disk = [0u8; crate::pages::PAGE_SIZE];
        engine.disk.read_page(meta.first_page_id, &mut on_disk)?;
        let page_lsn = u32::from_le_bytes(on_disk[0..4].try_into()?);
        assert!(page_lsn > 0, "first page was evicted and written");
        assert!(engine.log.persistent_lsn().unwrap() >= page_lsn);

        engine.commit(&txn)?;
        drop(engine);
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn test_flush_racing_mutations_keeps_wal_ahead() -> Result<()> {
        let dir = test_dir();
        let engine = Arc::new({
            let (engine, _) = seeded(&dir)?;
            engine
        });
        let meta = engine.catalog.table_meta("t").unwrap();

        // one thread keeps mutating the heap while this thread forces
        // dirty pages out; every page image that reaches disk must carry
        // an LSN the log has already made durable
        let writer = {
            let engine = engine.clone();
            std::thread::spawn(move || -> Result<()> {
                let txn = engine.begin(IsolationLevel::ReadCommitted)?;
                let mut rids = Vec::new();
                for i in 0..300 {
                    rids.push(engine.insert("t", row(i + 10, "racer"), Some(&txn))?);
                }
                for (i, rid) in rids.iter().enumerate() {
                    engine.update("t", *rid, row(i as i32 + 10, "raced"), Some(&txn))?;
                }
                engine.commit(&txn)?;
                Ok(())
            })
        };

        let mut flushed_pages = 0;
        for round in 0..60 {
            if round % 2 == 0 {
                engine.flush()?;
            } else {
                engine.checkpoint()?;
            }

            let mut on_disk = [0u8; crate::pages::PAGE_SIZE];
            engine.disk.read_page(meta.first_page_id, &mut on_disk)?;
            let page_lsn = u32::from_le_bytes(on_disk[0..4].try_into()?);
            if page_lsn == 0 {
                continue;
            }
            flushed_pages += 1;
            let durable = engine
                .log
                .persistent_lsn()
                .expect("a page with an LSN implies a prior log flush");
            assert!(
                durable >= page_lsn,
                "page {} reached disk at lsn {page_lsn} with the log only at {durable}",
                meta.first_page_id
            );
        }

        writer.join().unwrap()?;
        assert!(flushed_pages > 0, "the race never flushed a mutated page");
        drop(engine);
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn test_catalog_round_trip_through_restart() -> Result<()> {
        let dir = test_dir();
        {
            let engine = Engine::open(&dir)?;
            engine.create_table("t", &people_schema(), None)?;
            engine.shutdown()?;
        }
        let engine = Engine::open(&dir)?;
        let meta = engine.catalog.table_meta("t").unwrap();
        assert_eq!(meta.schema, people_schema());
        assert_eq!(engine.table_names(), vec!["t".to_string()]);
        drop(engine);
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn test_drop_table() -> Result<()> {
        let dir = test_dir();
        let (engine, _) = seeded(&dir)?;
        engine.drop_table("t", None)?;
        assert!(engine.scan("t", None).is_err());
        assert!(engine.table_names().is_empty());
        drop(engine);
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn test_index_lookup_end_to_end() -> Result<()> {
        let dir = test_dir();
        let (engine, rids) = seeded(&dir)?;
        engine.create_index("t_id", "t", &[0])?;

        let hits = engine.index_lookup("t_id", &Tuple::new(vec![Value::Int32(2)]), None)?;
        assert_eq!(hits, vec![(row(2, "b"), rids[1])]);

        // maintenance on update and delete
        engine.update("t", rids[1], row(20, "b"), None)?;
        assert!(engine
            .index_lookup("t_id", &Tuple::new(vec![Value::Int32(2)]), None)?
            .is_empty());
        let hits = engine.index_lookup("t_id", &Tuple::new(vec![Value::Int32(20)]), None)?;
        assert_eq!(hits.len(), 1);

        engine.delete("t", rids[0], None)?;
        assert!(engine
            .index_lookup("t_id", &Tuple::new(vec![Value::Int32(1)]), None)?
            .is_empty());
        drop(engine);
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn test_checkpoint_then_recovery() -> Result<()> {
        let dir = test_dir();
        let (engine, _) = seeded(&dir)?;
        engine.checkpoint()?;

        let txn = engine.begin(IsolationLevel::ReadCommitted)?;
        engine.insert("t", row(4, "d"), Some(&txn))?;
        engine.commit(&txn)?;
        engine.crash();

        let engine = Engine::open(&dir)?;
        assert_eq!(
            sorted_rows(&engine)?,
            vec![row(1, "a"), row(2, "b"), row(3, "c"), row(4, "d")]
        );
        drop(engine);
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn test_not_null_constraint() -> Result<()> {
        let dir = test_dir();
        let (engine, _) = seeded(&dir)?;
        let err = engine
            .insert(
                "t",
                Tuple::new(vec![Value::Null, Value::Str("x".into())]),
                None,
            )
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::Constraint(_))
        ));
        // the failed auto-commit left nothing behind
        assert_eq!(engine.scan("t", None)?.count(), 3);
        drop(engine);
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn test_unknown_table_is_not_found() -> Result<()> {
        let dir = test_dir();
        let engine = Engine::open(&dir)?;
        let err = engine.scan("missing", None).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::NotFound(_))
        ));
        drop(engine);
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }
}
