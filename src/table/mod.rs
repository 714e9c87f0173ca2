pub mod table_iterator;

use crate::buffer_pool::{ArcBufferPool, PageGuard};
use crate::errors::DbError;
use crate::pages::table_page::{TablePage, TablePageMut, HEADER_SIZE, SLOT_SIZE};
use crate::pages::{PageId, PAGE_SIZE};
use crate::tuple::{Rid, Tuple};
use crate::txn::Transaction;
use crate::wal::log_manager::LogManager;
use crate::wal::log_record::LogPayload;
use anyhow::{bail, Result};
use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;
use table_iterator::TableIter;

/// Largest payload a slotted page can hold.
pub const MAX_TUPLE_SIZE: usize = PAGE_SIZE - HEADER_SIZE - SLOT_SIZE - 4;

/// A table's tuples as a linked chain of slotted pages starting at
/// `first_page_id`. Every mutation appends its log record before the
/// page is stamped with the new LSN and marked dirty, so the WAL always
/// runs ahead of the data.
pub struct TableHeap {
    bpm: ArcBufferPool,
    log: Arc<LogManager>,
    first_page_id: PageId,
    /// Tail of the chain; the mutex serializes inserts and chain growth.
    last_page_id: Mutex<PageId>,
}

impl TableHeap {
    /// Creates a heap with one fresh (empty) page.
    pub fn create(bpm: ArcBufferPool, log: Arc<LogManager>) -> Result<Self> {
        let mut guard = PageGuard::create(&bpm)?;
        let first_page_id = guard.page_id();
        // a zeroed page already reads as empty; dirty it so it reaches disk
        guard.mark_dirty();
        debug!("new table heap rooted at page {first_page_id}");
        Ok(Self {
            bpm,
            log,
            first_page_id,
            last_page_id: Mutex::new(first_page_id),
        })
    }

    /// Opens an existing heap, walking the chain to find the tail.
    pub fn open(bpm: ArcBufferPool, log: Arc<LogManager>, first_page_id: PageId) -> Result<Self> {
        let mut last = first_page_id;
        loop {
            let guard = PageGuard::fetch(&bpm, last)?;
            let next = TablePage::new(&guard.read()).next_page_id();
            match next {
                Some(next) => last = next,
                None => break,
            }
        }
        Ok(Self {
            bpm,
            log,
            first_page_id,
            last_page_id: Mutex::new(last),
        })
    }

    pub fn first_page_id(&self) -> PageId {
        self.first_page_id
    }

    pub fn last_page_id(&self) -> PageId {
        *self.last_page_id.lock()
    }

    /// Appends the tuple to the tail page, growing the chain when the
    /// tail is full. Returns the tuple's permanent RID.
    pub fn insert(&self, tuple: &Tuple, txn: &Transaction) -> Result<Rid> {
        let bytes = tuple.to_bytes();
        if bytes.len() > MAX_TUPLE_SIZE {
            bail!(DbError::Constraint(format!(
                "tuple of {} bytes exceeds the page capacity of {MAX_TUPLE_SIZE}",
                bytes.len()
            )));
        }

        let mut last = self.last_page_id.lock();
        loop {
            let mut guard = PageGuard::fetch(&self.bpm, *last)?;
            // apply, log and stamp the LSN under one page write lock: a
            // concurrent flush must never see the mutated bytes without
            // the covering LSN
            {
                let mut page = guard.write();
                let mut view = TablePageMut::new(&mut page);
                if let Some(slot) = view.insert(&bytes) {
                    let rid = Rid::new(*last, slot);
                    let lsn = self.log.append(
                        txn.prev_lsn(),
                        txn.id(),
                        LogPayload::Insert {
                            rid,
                            tuple: bytes,
                        },
                    )?;
                    txn.set_prev_lsn(lsn);
                    view.set_lsn(lsn);
                    return Ok(rid);
                }
            }

            // tail is full: chain a fresh page and retry there
            let mut new_guard = PageGuard::create(&self.bpm)?;
            let new_page_id = new_guard.page_id();
            let lsn = self.log.append(
                txn.prev_lsn(),
                txn.id(),
                LogPayload::NewPage {
                    page_id: new_page_id,
                    prev_page_id: *last,
                },
            )?;
            txn.set_prev_lsn(lsn);
            {
                let mut page = guard.write();
                let mut view = TablePageMut::new(&mut page);
                view.set_next_page_id(new_page_id);
                view.set_lsn(lsn);
            }
            TablePageMut::new(&mut new_guard.write()).set_lsn(lsn);
            debug!("heap {} grew to page {new_page_id}", self.first_page_id);
            *last = new_page_id;
        }
    }

    /// Tombstones the tuple, logging its old image for undo. Returns
    /// false if the RID does not name a live tuple.
    pub fn mark_delete(&self, rid: Rid, txn: &Transaction) -> Result<bool> {
        let mut guard = PageGuard::fetch(&self.bpm, rid.page_id)?;
        // one critical section for apply + log + LSN stamp
        let mut page = guard.write();
        let mut view = TablePageMut::new(&mut page);
        let old = match view.as_read().read_tuple(rid.slot) {
            Some(bytes) => bytes.to_vec(),
            None => return Ok(false),
        };

        view.mark_delete(rid.slot)?;
        let lsn = self.log.append(
            txn.prev_lsn(),
            txn.id(),
            LogPayload::Delete { rid, tuple: old },
        )?;
        txn.set_prev_lsn(lsn);
        view.set_lsn(lsn);
        Ok(true)
    }

    /// Rewrites the tuple at `rid` in place (or repointed within its
    /// page), logging both images. Returns false for a missing tuple.
    pub fn update(&self, rid: Rid, new_tuple: &Tuple, txn: &Transaction) -> Result<bool> {
        let new_bytes = new_tuple.to_bytes();
        if new_bytes.len() > MAX_TUPLE_SIZE {
            bail!(DbError::Constraint(format!(
                "tuple of {} bytes exceeds the page capacity of {MAX_TUPLE_SIZE}",
                new_bytes.len()
            )));
        }

        let mut guard = PageGuard::fetch(&self.bpm, rid.page_id)?;
        // one critical section for apply + log + LSN stamp
        let mut page = guard.write();
        let mut view = TablePageMut::new(&mut page);
        let old = match view.as_read().read_tuple(rid.slot) {
            Some(bytes) => bytes.to_vec(),
            None => return Ok(false),
        };

        view.update(rid.slot, &new_bytes)?;
        let lsn = self.log.append(
            txn.prev_lsn(),
            txn.id(),
            LogPayload::Update {
                rid,
                old_tuple: old,
                new_tuple: new_bytes,
            },
        )?;
        txn.set_prev_lsn(lsn);
        view.set_lsn(lsn);
        Ok(true)
    }

    /// Reads a tuple by RID; None for tombstones and unknown slots.
    pub fn get(&self, rid: Rid) -> Result<Option<Tuple>> {
        let guard = PageGuard::fetch(&self.bpm, rid.page_id)?;
        let page = guard.read();
        match TablePage::new(&page).read_tuple(rid.slot) {
            Some(bytes) => Ok(Some(Tuple::from_bytes(bytes)?)),
            None => Ok(None),
        }
    }

    /// Forward scan over live tuples, page by page.
    pub fn iter(&self) -> TableIter {
        TableIter::new(self.bpm.clone(), self.first_page_id)
    }
}
