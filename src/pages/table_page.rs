use super::{Page, PageId, PAGE_SIZE};
use crate::errors::DbError;
use crate::tuple::SlotId;
use crate::wal::Lsn;
use anyhow::{bail, Result};

/// Slotted layout of a heap page.
///
/// Fixed header at offset 0, tuples growing upward from it, slot
/// directory growing downward from the page end:
///
/// ```text
/// 0..4    lsn of the last applied log record (0 = never logged)
/// 4..8    next_page_id of the heap chain (0 or INVALID_PAGE_ID = none)
/// 8..12   free_space_end: where the slot directory begins
/// 12..16  next_tuple_offset: first free byte of the tuple region
/// 16..20  num_tuples (live)
/// 20..24  num_deleted (tombstoned)
/// ```
///
/// Slot `i` is the `u32` at `PAGE_SIZE - (i+1)*4`, holding the offset of
/// tuple `i`'s entry or 0 if never allocated. Each entry starts with a
/// `u32` header: high bit = tombstone, low 31 bits = payload length.
/// A page of all zeroes reads as a valid empty page.
pub const HEADER_SIZE: usize = 24;

pub const SLOT_SIZE: usize = 4;
const TUPLE_HEADER_SIZE: usize = 4;
const TOMBSTONE_BIT: u32 = 1 << 31;

const OFFSET_LSN: usize = 0;
const OFFSET_NEXT_PAGE: usize = 4;
const OFFSET_FREE_SPACE_END: usize = 8;
const OFFSET_NEXT_TUPLE: usize = 12;
const OFFSET_NUM_TUPLES: usize = 16;
const OFFSET_NUM_DELETED: usize = 20;

fn get_u32(data: &[u8; PAGE_SIZE], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

fn next_tuple_offset(data: &[u8; PAGE_SIZE]) -> usize {
    match get_u32(data, OFFSET_NEXT_TUPLE) as usize {
        0 => HEADER_SIZE,
        v => v,
    }
}

fn free_space_end(data: &[u8; PAGE_SIZE]) -> usize {
    match get_u32(data, OFFSET_FREE_SPACE_END) as usize {
        0 => PAGE_SIZE,
        v => v,
    }
}

fn slot_count(data: &[u8; PAGE_SIZE]) -> usize {
    (get_u32(data, OFFSET_NUM_TUPLES) + get_u32(data, OFFSET_NUM_DELETED)) as usize
}

fn slot_offset(data: &[u8; PAGE_SIZE], slot: SlotId) -> usize {
    get_u32(data, PAGE_SIZE - (slot as usize + 1) * SLOT_SIZE) as usize
}

fn entry_header(data: &[u8; PAGE_SIZE], offset: usize) -> (bool, usize) {
    let header = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap());
    (header & TOMBSTONE_BIT != 0, (header & !TOMBSTONE_BIT) as usize)
}

fn read_entry(data: &[u8; PAGE_SIZE], slot: SlotId) -> Option<(bool, &[u8])> {
    if (slot as usize) >= slot_count(data) {
        return None;
    }
    let offset = slot_offset(data, slot);
    if offset == 0 {
        return None;
    }
    let (deleted, len) = entry_header(data, offset);
    Some((deleted, &data[offset + TUPLE_HEADER_SIZE..offset + TUPLE_HEADER_SIZE + len]))
}

/// Read-only view over a pinned page.
pub struct TablePage<'a> {
    page: &'a Page,
}

impl<'a> TablePage<'a> {
    pub fn new(page: &'a Page) -> Self {
        Self { page }
    }

    pub fn lsn(&self) -> Lsn {
        get_u32(self.page.data(), OFFSET_LSN)
    }

    pub fn next_page_id(&self) -> Option<PageId> {
        match get_u32(self.page.data(), OFFSET_NEXT_PAGE) {
            0 | super::INVALID_PAGE_ID => None,
            id => Some(id),
        }
    }

    pub fn num_tuples(&self) -> u32 {
        get_u32(self.page.data(), OFFSET_NUM_TUPLES)
    }

    pub fn num_deleted(&self) -> u32 {
        get_u32(self.page.data(), OFFSET_NUM_DELETED)
    }

    pub fn slot_count(&self) -> usize {
        slot_count(self.page.data())
    }

    pub fn free_space_remaining(&self) -> usize {
        free_space_end(self.page.data()) - next_tuple_offset(self.page.data())
    }

    /// Payload of a live tuple, or None for never-allocated and
    /// tombstoned slots.
    pub fn read_tuple(&self, slot: SlotId) -> Option<&[u8]> {
        match read_entry(self.page.data(), slot) {
            Some((false, bytes)) => Some(bytes),
            _ => None,
        }
    }

    pub fn is_deleted(&self, slot: SlotId) -> Option<bool> {
        read_entry(self.page.data(), slot).map(|(deleted, _)| deleted)
    }

    pub fn first_live_slot(&self) -> Option<SlotId> {
        self.next_live_slot(0)
    }

    /// First live slot at or after `from`, for forward iteration.
    pub fn next_live_slot(&self, from: SlotId) -> Option<SlotId> {
        let count = self.slot_count() as SlotId;
        (from..count).find(|&slot| matches!(read_entry(self.page.data(), slot), Some((false, _))))
    }
}

/// Mutating view over a pinned page. Every mutation marks the backing
/// page dirty through `Page::write_bytes`.
pub struct TablePageMut<'a> {
    page: &'a mut Page,
}

impl<'a> TablePageMut<'a> {
    pub fn new(page: &'a mut Page) -> Self {
        Self { page }
    }

    pub fn as_read(&self) -> TablePage<'_> {
        TablePage { page: self.page }
    }

    fn set_u32(&mut self, offset: usize, value: u32) {
        self.page.write_bytes(offset, &value.to_le_bytes());
    }

    /// Stamps the LSN of the last applied record, both in the persisted
    /// header and on the in-memory page for the WAL gate.
    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.set_u32(OFFSET_LSN, lsn);
        self.page.set_lsn(lsn);
    }

    pub fn set_next_page_id(&mut self, page_id: PageId) {
        self.set_u32(OFFSET_NEXT_PAGE, page_id);
    }

    /// Inserts a tuple payload, reusing the first never-allocated slot or
    /// appending a new one. Returns None when the page cannot fit it.
    pub fn insert(&mut self, bytes: &[u8]) -> Option<SlotId> {
        let data = self.page.data();
        let count = slot_count(data);
        let reusable =
            (0..count as SlotId).find(|&slot| slot_offset(data, slot) == 0);
        let needs_new_slot = reusable.is_none();

        let tuple_start = next_tuple_offset(data);
        let mut dir_start = free_space_end(data);
        if needs_new_slot {
            dir_start -= SLOT_SIZE;
        }
        if tuple_start + TUPLE_HEADER_SIZE + bytes.len() > dir_start {
            return None;
        }

        let slot = reusable.unwrap_or(count as SlotId);
        self.write_entry(tuple_start, bytes, false);
        self.set_u32(
            PAGE_SIZE - (slot as usize + 1) * SLOT_SIZE,
            tuple_start as u32,
        );
        self.set_u32(
            OFFSET_NEXT_TUPLE,
            (tuple_start + TUPLE_HEADER_SIZE + bytes.len()) as u32,
        );
        self.set_u32(OFFSET_FREE_SPACE_END, dir_start as u32);
        self.set_u32(OFFSET_NUM_TUPLES, get_u32(self.page.data(), OFFSET_NUM_TUPLES) + 1);
        if !needs_new_slot {
            // a reused zero-offset slot was accounted as a deleted gap
            self.set_u32(
                OFFSET_NUM_DELETED,
                get_u32(self.page.data(), OFFSET_NUM_DELETED) - 1,
            );
        }
        Some(slot)
    }

    /// Redo path: re-inserts a tuple at an exact slot, growing the slot
    /// directory past gaps if the crash lost later inserts.
    pub fn insert_at(&mut self, slot: SlotId, bytes: &[u8]) -> Result<()> {
        if self.as_read().read_tuple(slot).is_some() {
            return Ok(());
        }
        let data = self.page.data();
        let count = slot_count(data);
        let new_slots = (slot as usize + 1).saturating_sub(count);
        let tuple_start = next_tuple_offset(data);
        let directory_growth = new_slots * SLOT_SIZE;
        if directory_growth > free_space_end(data) {
            bail!(DbError::Exhausted("page space during redo".to_string()));
        }
        let dir_start = free_space_end(data) - directory_growth;
        if tuple_start + TUPLE_HEADER_SIZE + bytes.len() > dir_start {
            bail!(DbError::Exhausted("page space during redo".to_string()));
        }

        self.write_entry(tuple_start, bytes, false);
        self.set_u32(
            PAGE_SIZE - (slot as usize + 1) * SLOT_SIZE,
            tuple_start as u32,
        );
        self.set_u32(
            OFFSET_NEXT_TUPLE,
            (tuple_start + TUPLE_HEADER_SIZE + bytes.len()) as u32,
        );
        self.set_u32(OFFSET_FREE_SPACE_END, dir_start as u32);
        // gap slots created by the directory growth count as deleted
        let gap = new_slots.saturating_sub(1) as u32;
        self.set_u32(OFFSET_NUM_TUPLES, get_u32(self.page.data(), OFFSET_NUM_TUPLES) + 1);
        if gap > 0 {
            self.set_u32(
                OFFSET_NUM_DELETED,
                get_u32(self.page.data(), OFFSET_NUM_DELETED) + gap,
            );
        }
        Ok(())
    }

    /// Sets the tombstone bit. Returns whether the slot was live.
    pub fn mark_delete(&mut self, slot: SlotId) -> Result<bool> {
        let offset = self.checked_offset(slot)?;
        let (deleted, len) = entry_header(self.page.data(), offset);
        if deleted {
            return Ok(false);
        }
        self.set_u32(offset, len as u32 | TOMBSTONE_BIT);
        self.set_u32(OFFSET_NUM_TUPLES, get_u32(self.page.data(), OFFSET_NUM_TUPLES) - 1);
        self.set_u32(
            OFFSET_NUM_DELETED,
            get_u32(self.page.data(), OFFSET_NUM_DELETED) + 1,
        );
        Ok(true)
    }

    /// Clears the tombstone bit, reviving the tuple at the same RID.
    /// Returns whether the slot was tombstoned.
    pub fn rollback_delete(&mut self, slot: SlotId) -> Result<bool> {
        let offset = self.checked_offset(slot)?;
        let (deleted, len) = entry_header(self.page.data(), offset);
        if !deleted {
            return Ok(false);
        }
        self.set_u32(offset, len as u32);
        self.set_u32(OFFSET_NUM_TUPLES, get_u32(self.page.data(), OFFSET_NUM_TUPLES) + 1);
        self.set_u32(
            OFFSET_NUM_DELETED,
            get_u32(self.page.data(), OFFSET_NUM_DELETED) - 1,
        );
        Ok(true)
    }

    /// Rewrites a tuple. Equal lengths overwrite in place; otherwise the
    /// new image is appended at the tail and the slot repointed, leaving
    /// the old bytes as garbage until a page rewrite.
    pub fn update(&mut self, slot: SlotId, bytes: &[u8]) -> Result<()> {
        let offset = self.checked_offset(slot)?;
        let (deleted, len) = entry_header(self.page.data(), offset);
        if len == bytes.len() {
            let tombstone = if deleted { TOMBSTONE_BIT } else { 0 };
            self.set_u32(offset, bytes.len() as u32 | tombstone);
            self.page.write_bytes(offset + TUPLE_HEADER_SIZE, bytes);
            return Ok(());
        }

        let data = self.page.data();
        let tuple_start = next_tuple_offset(data);
        if tuple_start + TUPLE_HEADER_SIZE + bytes.len() > free_space_end(data) {
            bail!(DbError::Exhausted("page space for update".to_string()));
        }
        self.write_entry(tuple_start, bytes, deleted);
        self.set_u32(
            PAGE_SIZE - (slot as usize + 1) * SLOT_SIZE,
            tuple_start as u32,
        );
        self.set_u32(
            OFFSET_NEXT_TUPLE,
            (tuple_start + TUPLE_HEADER_SIZE + bytes.len()) as u32,
        );
        Ok(())
    }

    fn write_entry(&mut self, offset: usize, bytes: &[u8], deleted: bool) {
        let tombstone = if deleted { TOMBSTONE_BIT } else { 0 };
        self.set_u32(offset, bytes.len() as u32 | tombstone);
        self.page.write_bytes(offset + TUPLE_HEADER_SIZE, bytes);
    }

    fn checked_offset(&self, slot: SlotId) -> Result<usize> {
        let data = self.page.data();
        if (slot as usize) >= slot_count(data) {
            bail!(DbError::NotFound(format!("slot {slot}")));
        }
        match slot_offset(data, slot) {
            0 => bail!(DbError::NotFound(format!("slot {slot}"))),
            offset => Ok(offset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_insert_then_read() -> Result<()> {
        let mut page = Page::new();
        let mut view = TablePageMut::new(&mut page);
        let s0 = view.insert(b"alpha").unwrap();
        let s1 = view.insert(b"beta").unwrap();
        assert_eq!(s0, 0);
        assert_eq!(s1, 1);
        let read = TablePage::new(&page);
        assert_eq!(read.read_tuple(0), Some(&b"alpha"[..]));
        assert_eq!(read.read_tuple(1), Some(&b"beta"[..]));
        assert_eq!(read.num_tuples(), 2);
        assert_eq!(read.read_tuple(2), None);
        Ok(())
    }

    #[test]
    fn test_delete_and_rollback_round_trip() -> Result<()> {
        let mut page = Page::new();
        let mut view = TablePageMut::new(&mut page);
        let slot = view.insert(b"payload").unwrap();
        assert!(view.mark_delete(slot)?);
        assert_eq!(view.as_read().read_tuple(slot), None);
        assert_eq!(view.as_read().num_deleted(), 1);
        // idempotent on a tombstone
        assert!(!view.mark_delete(slot)?);

        assert!(view.rollback_delete(slot)?);
        assert_eq!(view.as_read().read_tuple(slot), Some(&b"payload"[..]));
        assert_eq!(view.as_read().num_deleted(), 0);
        Ok(())
    }

    #[test]
    fn test_update_in_place_and_repoint() -> Result<()> {
        let mut page = Page::new();
        let mut view = TablePageMut::new(&mut page);
        let slot = view.insert(b"aaaa").unwrap();

        view.update(slot, b"bbbb")?;
        assert_eq!(view.as_read().read_tuple(slot), Some(&b"bbbb"[..]));

        view.update(slot, b"longer-payload")?;
        assert_eq!(view.as_read().read_tuple(slot), Some(&b"longer-payload"[..]));
        assert_eq!(view.as_read().num_tuples(), 1);
        Ok(())
    }

    #[test]
    fn test_fills_up() {
        let mut page = Page::new();
        let mut view = TablePageMut::new(&mut page);
        let payload = [7u8; 128];
        let mut inserted = 0;
        while view.insert(&payload).is_some() {
            inserted += 1;
        }
        // 128 payload + 4 entry header + 4 slot per tuple, under the header
        assert_eq!(inserted, (PAGE_SIZE - HEADER_SIZE) / (128 + 8));
        assert!(view.as_read().free_space_remaining() < 128 + 8);
    }

    #[test]
    fn test_live_slot_iteration_skips_tombstones() -> Result<()> {
        let mut page = Page::new();
        let mut view = TablePageMut::new(&mut page);
        for payload in [b"a", b"b", b"c"] {
            view.insert(payload).unwrap();
        }
        view.mark_delete(1)?;
        let read = TablePage::new(&page);
        assert_eq!(read.first_live_slot(), Some(0));
        assert_eq!(read.next_live_slot(1), Some(2));
        assert_eq!(read.next_live_slot(3), None);
        Ok(())
    }

    #[test]
    fn test_insert_at_exact_slot() -> Result<()> {
        let mut page = Page::new();
        let mut view = TablePageMut::new(&mut page);
        view.insert_at(2, b"redo")?;
        let read = view.as_read();
        assert_eq!(read.read_tuple(2), Some(&b"redo"[..]));
        assert_eq!(read.read_tuple(0), None);
        assert_eq!(read.slot_count(), 3);
        Ok(())
    }

    #[test]
    fn test_zeroed_page_reads_empty() {
        let page = Page::new();
        let read = TablePage::new(&page);
        assert_eq!(read.num_tuples(), 0);
        assert_eq!(read.next_page_id(), None);
        assert_eq!(read.first_live_slot(), None);
        assert_eq!(read.free_space_remaining(), PAGE_SIZE - HEADER_SIZE);
    }
}
