use super::log_record::{LogPayload, LogRecord};
use super::Lsn;
use crate::buffer_pool::{ArcBufferPool, PageGuard};
use crate::disk_manager::DiskManager;
use crate::errors::DbError;
use crate::pages::table_page::TablePageMut;
use crate::pages::PageId;
use crate::txn::TxnId;
use anyhow::{bail, Context, Result};
use log::{info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// What a recovery pass did, mostly for the caller to seed the live log
/// manager and for logging.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Highest LSN found in the log file.
    pub max_lsn: Option<Lsn>,
    pub redone: usize,
    pub undone: usize,
    pub losers: Vec<TxnId>,
}

/// ARIES-style restart recovery, run once before the engine serves
/// anything: analysis rebuilds the active-transaction and dirty-page
/// tables (seeded by the last checkpoint scanned), redo replays
/// LSN-gated history from the minimum recLSN, and undo rolls back every
/// loser transaction newest-record-first.
pub struct RecoveryManager {
    bpm: ArcBufferPool,
    disk: Arc<DiskManager>,
    log_path: PathBuf,
}

impl RecoveryManager {
    pub fn new(bpm: ArcBufferPool, disk: Arc<DiskManager>, log_path: PathBuf) -> Self {
        Self {
            bpm,
            disk,
            log_path,
        }
    }

    pub fn recover(&self) -> Result<RecoveryReport> {
        let bytes = std::fs::read(&self.log_path)
            .with_context(|| DbError::Io(format!("reading {}", self.log_path.display())))?;
        let mut records = Vec::new();
        let mut pos = 0;
        while let Some(record) = LogRecord::decode(&bytes, &mut pos)? {
            records.push(record);
        }

        let mut report = RecoveryReport {
            max_lsn: records.iter().map(|r| r.lsn).max(),
            ..Default::default()
        };
        if records.is_empty() {
            return Ok(report);
        }

        // --- analysis ---
        let mut att: HashMap<TxnId, Lsn> = HashMap::new();
        let mut dpt: HashMap<PageId, Lsn> = HashMap::new();
        for record in &records {
            match &record.payload {
                LogPayload::Begin => {
                    att.insert(record.txn_id, record.lsn);
                }
                LogPayload::Commit | LogPayload::Abort => {
                    att.remove(&record.txn_id);
                }
                LogPayload::Checkpoint {
                    active_txns,
                    dirty_pages,
                } => {
                    att = active_txns.iter().copied().collect();
                    dpt = dirty_pages.iter().copied().collect();
                }
                payload => {
                    att.insert(record.txn_id, record.lsn);
                    if let Some(page_id) = payload.affected_page() {
                        dpt.entry(page_id).or_insert(record.lsn);
                    }
                    if let LogPayload::NewPage {
                        page_id,
                        prev_page_id,
                    } = payload
                    {
                        // keep the allocation watermark ahead of every
                        // page the log has ever named, even outside the
                        // redo window
                        self.disk.note_allocated(*page_id);
                        dpt.entry(*prev_page_id).or_insert(record.lsn);
                    }
                }
            }
        }

        // --- redo ---
        let min_rec_lsn = dpt.values().min().copied();
        if let Some(from) = min_rec_lsn {
            for record in records.iter().filter(|r| r.lsn >= from) {
                if record.payload.is_data() {
                    self.redo(record)?;
                    report.redone += 1;
                }
            }
        }

        // --- undo ---
        let by_lsn: HashMap<Lsn, &LogRecord> = records.iter().map(|r| (r.lsn, r)).collect();
        while let Some((&txn_id, &last_lsn)) = att.iter().max_by_key(|(_, &lsn)| lsn) {
            let mut lsn = last_lsn;
            while lsn != super::INVALID_LSN {
                let record = match by_lsn.get(&lsn) {
                    Some(record) => *record,
                    None => bail!(DbError::Corruption(format!(
                        "undo chain of loser txn {txn_id} broke at lsn {lsn}"
                    ))),
                };
                self.undo(record)?;
                if record.payload.is_data() {
                    report.undone += 1;
                }
                lsn = record.prev_lsn;
            }
            warn!("recovery rolled back loser txn {txn_id}");
            report.losers.push(txn_id);
            att.remove(&txn_id);
        }

        info!(
            "recovery done: {} records, {} redone, {} undone, {} losers",
            records.len(),
            report.redone,
            report.undone,
            report.losers.len()
        );
        Ok(report)
    }

    /// Reapplies a record's forward effect, gated on the page LSN so
    /// already-persisted changes are skipped.
    fn redo(&self, record: &LogRecord) -> Result<()> {
        match &record.payload {
            LogPayload::Insert { rid, tuple } => {
                self.with_page(rid.page_id, record.lsn, |view| {
                    view.insert_at(rid.slot, tuple)
                })
            }
            LogPayload::Delete { rid, .. } => self.with_page(rid.page_id, record.lsn, |view| {
                view.mark_delete(rid.slot).map(|_| ())
            }),
            LogPayload::Update { rid, new_tuple, .. } => {
                self.with_page(rid.page_id, record.lsn, |view| {
                    view.update(rid.slot, new_tuple)
                })
            }
            LogPayload::NewPage {
                page_id,
                prev_page_id,
            } => {
                self.disk.note_allocated(*page_id);
                let page_id = *page_id;
                self.with_page(*prev_page_id, record.lsn, |view| {
                    view.set_next_page_id(page_id);
                    Ok(())
                })
            }
            _ => Ok(()),
        }
    }

    /// Reverses a loser's record. No compensation records are written;
    /// every step is idempotent, so repeating undo after another crash
    /// converges to the same state.
    fn undo(&self, record: &LogRecord) -> Result<()> {
        match &record.payload {
            LogPayload::Insert { rid, .. } => {
                let mut guard = PageGuard::fetch(&self.bpm, rid.page_id)?;
                TablePageMut::new(&mut guard.write()).mark_delete(rid.slot)?;
            }
            LogPayload::Delete { rid, .. } => {
                let mut guard = PageGuard::fetch(&self.bpm, rid.page_id)?;
                TablePageMut::new(&mut guard.write()).rollback_delete(rid.slot)?;
            }
            LogPayload::Update { rid, old_tuple, .. } => {
                let mut guard = PageGuard::fetch(&self.bpm, rid.page_id)?;
                TablePageMut::new(&mut guard.write()).update(rid.slot, old_tuple)?;
            }
            // NEW_PAGE is not reversed; the empty page stays chained
            _ => {}
        }
        Ok(())
    }

    fn with_page(
        &self,
        page_id: PageId,
        lsn: Lsn,
        apply: impl FnOnce(&mut TablePageMut<'_>) -> Result<()>,
    ) -> Result<()> {
        let mut guard = PageGuard::fetch(&self.bpm, page_id)?;
        let mut page = guard.write();
        let mut view = TablePageMut::new(&mut page);
        if view.as_read().lsn() >= lsn {
            return Ok(());
        }
        apply(&mut view)?;
        view.set_lsn(lsn);
        Ok(())
    }
}
