mod frame;
mod replacer;

pub use replacer::ReplacerKind;

use crate::disk_manager::DiskManager;
use crate::errors::DbError;
use crate::latch::Latch;
use crate::pages::{Page, PageId};
use crate::wal::log_manager::LogManager;
use crate::wal::INVALID_LSN;
use anyhow::{bail, Result};
use frame::Frame;
use log::debug;
use parking_lot::{FairMutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use replacer::Replacer;
use std::collections::{HashMap, LinkedList};
use std::sync::Arc;

pub type FrameId = usize;
pub type ArcBufferPool = Arc<FairMutex<BufferPoolManager>>;

pub const DEFAULT_POOL_SIZE: usize = 1024;

/// Fixed-size pool of frames over the pager. All bookkeeping (page
/// table, free list, replacer) sits behind one fair mutex; page bodies
/// are shared out through `Arc<RwLock<Page>>` so pinned readers and
/// writers proceed without it.
///
/// Before any dirty page goes to disk, the pool force-flushes the log up
/// to that page's LSN: a page image never gets ahead of its records.
pub struct BufferPoolManager {
    disk: Arc<DiskManager>,
    log: Arc<LogManager>,
    frames: Vec<Frame>,
    free_frames: LinkedList<FrameId>,
    page_table: HashMap<PageId, FrameId>,
    replacer: Replacer,
}

impl BufferPoolManager {
    pub fn new(
        size: usize,
        disk: Arc<DiskManager>,
        log: Arc<LogManager>,
        kind: ReplacerKind,
    ) -> Self {
        Self {
            disk,
            log,
            frames: (0..size).map(|_| Frame::new()).collect(),
            free_frames: LinkedList::from_iter(0..size),
            page_table: HashMap::with_capacity(size),
            replacer: Replacer::new(kind, size),
        }
    }

    pub fn into_shared(self) -> ArcBufferPool {
        Arc::new(FairMutex::new(self))
    }

    /// Pins the page, reading it from disk on a miss. Fails with
    /// `Exhausted` only when every frame is pinned.
    pub fn fetch_page(&mut self, page_id: PageId) -> Result<Arc<RwLock<Page>>> {
        if let Some(&frame_id) = self.page_table.get(&page_id) {
            let frame = &self.frames[frame_id];
            frame.pin();
            self.replacer.record_access(frame_id);
            return Ok(frame.page());
        }

        let frame_id = self.take_frame()?;
        let frame = &self.frames[frame_id];
        frame.reset(page_id);
        {
            let page_arc = frame.page();
            let mut page = page_arc.write();
            let mut buf = [0u8; crate::pages::PAGE_SIZE];
            self.disk.read_page(page_id, &mut buf)?;
            page.load(&buf);
            page.set_page_id(page_id);
        }
        self.page_table.insert(page_id, frame_id);
        frame.pin();
        self.replacer.record_access(frame_id);
        debug!("fetched page {page_id} into frame {frame_id}");
        Ok(frame.page())
    }

    /// Allocates a fresh zero-filled page and pins it.
    pub fn new_page(&mut self) -> Result<(PageId, Arc<RwLock<Page>>)> {
        let frame_id = self.take_frame()?;
        let page_id = self.disk.allocate();
        let frame = &self.frames[frame_id];
        frame.reset(page_id);
        self.page_table.insert(page_id, frame_id);
        frame.pin();
        self.replacer.record_access(frame_id);
        debug!("created page {page_id} in frame {frame_id}");
        Ok((page_id, frame.page()))
    }

    /// Drops one pin; `dirty` ORs into the page's dirty bit. The frame
    /// becomes evictable when the count reaches zero.
    pub fn unpin_page(&mut self, page_id: PageId, dirty: bool) {
        let frame_id = match self.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => panic!("unpin of page {page_id} which is not resident"),
        };
        let frame = &self.frames[frame_id];
        if dirty {
            frame.page().write().mark_dirty();
        }
        if frame.unpin() == 0 {
            self.replacer.unpin(frame_id);
        }
    }

    pub fn flush_page(&mut self, page_id: PageId) -> Result<()> {
        match self.page_table.get(&page_id) {
            Some(&frame_id) => self.write_frame_out(frame_id),
            None => bail!(DbError::NotFound(format!("page {page_id} in the pool"))),
        }
    }

    pub fn flush_all(&mut self) -> Result<()> {
        let frame_ids: Vec<FrameId> = self.page_table.values().copied().collect();
        for frame_id in frame_ids {
            self.write_frame_out(frame_id)?;
        }
        Ok(())
    }

    /// Removes an unpinned page from the pool and recycles its frame.
    /// Returns false if the page is pinned. The pager has no free list,
    /// so the on-disk block simply leaks.
    pub fn delete_page(&mut self, page_id: PageId) -> Result<bool> {
        let frame_id = match self.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return Ok(true),
        };
        let frame = &self.frames[frame_id];
        if frame.pin_count() > 0 {
            return Ok(false);
        }
        self.page_table.remove(&page_id);
        self.replacer.remove(frame_id);
        frame.clear();
        self.free_frames.push_back(frame_id);
        Ok(true)
    }

    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        self.page_table
            .get(&page_id)
            .map(|&frame_id| self.frames[frame_id].pin_count())
    }

    fn take_frame(&mut self) -> Result<FrameId> {
        if let Some(frame_id) = self.free_frames.pop_front() {
            return Ok(frame_id);
        }
        match self.replacer.victim() {
            Some(frame_id) => {
                self.evict_frame(frame_id)?;
                Ok(frame_id)
            }
            None => bail!(DbError::Exhausted("buffer frames (all pinned)".to_string())),
        }
    }

    fn evict_frame(&mut self, frame_id: FrameId) -> Result<()> {
        let frame = &self.frames[frame_id];
        assert_eq!(
            frame.pin_count(),
            0,
            "replacer offered a pinned frame as victim"
        );
        let page_id = frame.page_id();
        debug!("evicting page {page_id} from frame {frame_id}");
        self.write_frame_out(frame_id)?;
        self.page_table.remove(&page_id);
        Ok(())
    }

    /// Writes the frame's page to disk if dirty, WAL first.
    fn write_frame_out(&self, frame_id: FrameId) -> Result<()> {
        let page_arc = self.frames[frame_id].page();
        let mut page = page_arc.write();
        if !page.is_dirty() {
            return Ok(());
        }
        if page.lsn() != INVALID_LSN {
            self.log.force_flush_until(page.lsn())?;
        }
        self.disk.write_page(page.page_id(), page.data())?;
        page.mark_clean();
        Ok(())
    }
}

/// RAII pinned-page handle: dropping it unpins with the dirty flag
/// accumulated while the guard was alive.
pub struct PageGuard {
    bpm: ArcBufferPool,
    page: Arc<RwLock<Page>>,
    page_id: PageId,
    dirty: bool,
}

impl std::fmt::Debug for PageGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageGuard")
            .field("page_id", &self.page_id)
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl PageGuard {
    pub fn fetch(bpm: &ArcBufferPool, page_id: PageId) -> Result<PageGuard> {
        let page = bpm.lock().fetch_page(page_id)?;
        Ok(PageGuard {
            bpm: bpm.clone(),
            page,
            page_id,
            dirty: false,
        })
    }

    pub fn create(bpm: &ArcBufferPool) -> Result<PageGuard> {
        let (page_id, page) = bpm.lock().new_page()?;
        Ok(PageGuard {
            bpm: bpm.clone(),
            page,
            page_id,
            dirty: false,
        })
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.page.read()
    }

    /// Write access marks the guard dirty for the unpin.
    pub fn write(&mut self) -> RwLockWriteGuard<'_, Page> {
        self.dirty = true;
        self.page.write()
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn latch(&self) -> Arc<Latch> {
        self.page.read().latch()
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.bpm.lock().unpin_page(self.page_id, self.dirty);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::disk_manager::test_dir;
    use anyhow::Result;

    pub(crate) fn test_arc_bpm(size: usize) -> ArcBufferPool {
        let dir = test_dir();
        let disk = Arc::new(DiskManager::new(&dir).unwrap());
        let log = LogManager::open(&dir).unwrap();
        BufferPoolManager::new(size, disk, log, ReplacerKind::Lru).into_shared()
    }

    pub(crate) fn test_bpm_with_log(size: usize) -> (ArcBufferPool, Arc<LogManager>) {
        let dir = test_dir();
        let disk = Arc::new(DiskManager::new(&dir).unwrap());
        let log = LogManager::open(&dir).unwrap();
        let bpm = BufferPoolManager::new(size, disk, log.clone(), ReplacerKind::Lru).into_shared();
        (bpm, log)
    }

    #[test]
    fn test_dont_evict_pinned() -> Result<()> {
        let bpm = test_arc_bpm(2);

        let p1 = PageGuard::create(&bpm)?;
        let p2 = PageGuard::create(&bpm)?;

        assert!(matches!(
            PageGuard::create(&bpm).unwrap_err().downcast_ref::<DbError>(),
            Some(DbError::Exhausted(_))
        ));

        let p1_id = p1.page_id();
        drop(p1);
        let p3 = PageGuard::create(&bpm)?;

        // p1's frame was recycled for p3
        assert_eq!(bpm.lock().pin_count(p1_id), None);
        drop(p2);
        drop(p3);
        Ok(())
    }

    #[test]
    fn test_new_page_ids_are_distinct() -> Result<()> {
        let bpm = test_arc_bpm(4);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            let guard = PageGuard::create(&bpm)?;
            assert!(seen.insert(guard.page_id()));
        }
        Ok(())
    }

    #[test]
    fn test_eviction_round_trips_through_disk() -> Result<()> {
        let bpm = test_arc_bpm(2);

        let first_id = {
            let mut guard = PageGuard::create(&bpm)?;
            guard.write().write_bytes(64, b"remember me");
            guard.page_id()
        };

        // crowd the pool so the first page gets evicted
        let mut keep = vec![];
        for _ in 0..2 {
            keep.push(PageGuard::create(&bpm)?);
        }
        keep.clear();

        let guard = PageGuard::fetch(&bpm, first_id)?;
        assert_eq!(guard.read().read_bytes(64, 75), b"remember me");
        Ok(())
    }

    #[test]
    fn test_unpin_makes_page_evictable_again() -> Result<()> {
        let bpm = test_arc_bpm(2);
        let a = PageGuard::create(&bpm)?;
        let b = PageGuard::create(&bpm)?;
        let a_id = a.page_id();

        drop(a);
        assert_eq!(bpm.lock().pin_count(a_id), Some(0));

        // refetch pins it again
        let a2 = PageGuard::fetch(&bpm, a_id)?;
        assert_eq!(bpm.lock().pin_count(a_id), Some(1));
        drop(a2);
        drop(b);
        Ok(())
    }

    #[test]
    fn test_delete_page_refuses_pinned() -> Result<()> {
        let bpm = test_arc_bpm(2);
        let guard = PageGuard::create(&bpm)?;
        let id = guard.page_id();
        assert!(!bpm.lock().delete_page(id)?);
        drop(guard);
        assert!(bpm.lock().delete_page(id)?);
        assert_eq!(bpm.lock().pin_count(id), None);
        Ok(())
    }

    #[test]
    fn test_flush_clears_dirty() -> Result<()> {
        let bpm = test_arc_bpm(2);
        let mut guard = PageGuard::create(&bpm)?;
        let id = guard.page_id();
        guard.write().write_bytes(0, &[1, 2, 3]);
        drop(guard);

        bpm.lock().flush_page(id)?;
        let guard = PageGuard::fetch(&bpm, id)?;
        assert!(!guard.read().is_dirty());
        assert_eq!(guard.read().read_bytes(0, 3), &[1, 2, 3]);
        Ok(())
    }
}
