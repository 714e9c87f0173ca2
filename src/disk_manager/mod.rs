use crate::errors::DbError;
use crate::pages::{PageId, INVALID_PAGE_ID, PAGE_SIZE};
use anyhow::{bail, Context, Result};
use log::debug;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

pub const DATA_FILE: &str = "latticedb.db";
/// Writes go through a stream flush every time; every this many writes
/// the file is additionally fsynced.
const SYNC_INTERVAL: u32 = 100;

/// Maps page ids to fixed-size blocks of a single backing file:
/// `page[i]` occupies bytes `[i*PAGE_SIZE, (i+1)*PAGE_SIZE)`. Allocation
/// is a monotonic high-water mark recovered from the file size on open;
/// there is no free list and `deallocate` is a no-op, so dropped tables
/// leak their pages.
#[derive(Debug)]
pub struct DiskManager {
    file: Mutex<File>,
    next_page_id: AtomicU32,
    writes_since_sync: AtomicU32,
    path: PathBuf,
}

impl DiskManager {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| DbError::Io(format!("creating {}", dir.display())))?;
        let path = dir.join(DATA_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| DbError::Io(format!("opening {}", path.display())))?;
        let len = file
            .metadata()
            .with_context(|| DbError::Io("reading data file metadata".into()))?
            .len();
        // page 0 is the catalog root, so allocation starts at 1 even on
        // a fresh file
        let pages = (len as usize).div_ceil(PAGE_SIZE) as PageId;
        Ok(Self {
            file: Mutex::new(file),
            next_page_id: AtomicU32::new(pages.max(1)),
            writes_since_sync: AtomicU32::new(0),
            path,
        })
    }

    pub fn allocate(&self) -> PageId {
        let id = self.next_page_id.fetch_add(1, Ordering::SeqCst);
        debug!("allocated page {id}");
        id
    }

    /// Raises the high-water mark; used when recovery replays NEW_PAGE
    /// records for pages that never reached the file.
    pub fn note_allocated(&self, page_id: PageId) {
        self.next_page_id.fetch_max(page_id + 1, Ordering::SeqCst);
    }

    /// Reads past the end of the file zero-fill: a page that was
    /// allocated but never written reads as empty.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        if page_id == INVALID_PAGE_ID {
            bail!(DbError::Invariant("read of the invalid page id".into()));
        }
        let mut file = self.file.lock();
        let len = file
            .metadata()
            .with_context(|| DbError::Io("reading data file metadata".into()))?
            .len();
        let offset = page_id as u64 * PAGE_SIZE as u64;
        if offset >= len {
            buf.fill(0);
            return Ok(());
        }
        file.seek(SeekFrom::Start(offset))
            .with_context(|| DbError::Io(format!("seeking to page {page_id}")))?;
        let available = ((len - offset) as usize).min(PAGE_SIZE);
        file.read_exact(&mut buf[..available])
            .with_context(|| DbError::Io(format!("reading page {page_id}")))?;
        buf[available..].fill(0);
        Ok(())
    }

    pub fn write_page(&self, page_id: PageId, buf: &[u8; PAGE_SIZE]) -> Result<()> {
        if page_id == INVALID_PAGE_ID {
            bail!(DbError::Invariant("write of the invalid page id".into()));
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))
            .with_context(|| DbError::Io(format!("seeking to page {page_id}")))?;
        file.write_all(buf)
            .with_context(|| DbError::Io(format!("writing page {page_id}")))?;
        file.flush()
            .with_context(|| DbError::Io(format!("flushing page {page_id}")))?;

        if self.writes_since_sync.fetch_add(1, Ordering::SeqCst) + 1 >= SYNC_INTERVAL {
            self.writes_since_sync.store(0, Ordering::SeqCst);
            file.sync_data()
                .with_context(|| DbError::Io("periodic data file sync".into()))?;
            debug!("periodic fsync of {}", self.path.display());
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file
            .lock()
            .sync_all()
            .with_context(|| DbError::Io("syncing the data file".into()))?;
        Ok(())
    }

    pub fn shutdown(&self) -> Result<()> {
        let mut file = self.file.lock();
        file.flush()
            .with_context(|| DbError::Io("flushing the data file".into()))?;
        file.sync_all()
            .with_context(|| DbError::Io("syncing the data file".into()))?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("latticedb_test_{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_write_then_read() -> Result<()> {
        let dir = test_dir();
        let disk = DiskManager::new(&dir)?;
        let id = disk.allocate();

        let mut out = [0u8; PAGE_SIZE];
        out[0] = 0xAB;
        out[PAGE_SIZE - 1] = 0xCD;
        disk.write_page(id, &out)?;

        let mut buf = [0u8; PAGE_SIZE];
        disk.read_page(id, &mut buf)?;
        assert_eq!(buf, out);

        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn test_read_past_eof_zero_fills() -> Result<()> {
        let dir = test_dir();
        let disk = DiskManager::new(&dir)?;
        let mut buf = [0xFFu8; PAGE_SIZE];
        disk.read_page(77, &mut buf)?;
        assert!(buf.iter().all(|&b| b == 0));
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn test_allocation_survives_reopen() -> Result<()> {
        let dir = test_dir();
        let first_ids: Vec<PageId> = {
            let disk = DiskManager::new(&dir)?;
            let ids = vec![disk.allocate(), disk.allocate()];
            let buf = [7u8; PAGE_SIZE];
            for &id in &ids {
                disk.write_page(id, &buf)?;
            }
            disk.shutdown()?;
            ids
        };

        let disk = DiskManager::new(&dir)?;
        let fresh = disk.allocate();
        assert!(first_ids.iter().all(|&id| fresh > id));
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn test_page_zero_is_never_allocated() -> Result<()> {
        let dir = test_dir();
        let disk = DiskManager::new(&dir)?;
        assert_ne!(disk.allocate(), 0);
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }
}
