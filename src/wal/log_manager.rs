use super::log_record::{LogPayload, LogRecord};
use super::{Lsn, FIRST_LSN, INVALID_LSN};
use crate::errors::DbError;
use crate::txn::TxnId;
use anyhow::{bail, Context, Result};
use log::{debug, info};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub const LOG_FILE: &str = "latticedb.log";
pub const LOG_BUFFER_SIZE: usize = 1024 * 1024;
const FLUSH_PERIOD: Duration = Duration::from_secs(1);

struct LogInner {
    buf: Vec<u8>,
    file: File,
    /// Highest LSN serialized into `buf` or already on disk.
    last_appended: i64,
}

/// Append-only record buffer with a background flusher.
///
/// `append` assigns LSNs and serializes into the 1 MiB buffer, spilling
/// synchronously when a record does not fit. The flusher thread drains
/// the buffer every second or on notify; `force_flush_until` blocks the
/// caller (commit) until the target LSN is durable.
pub struct LogManager {
    inner: Mutex<LogInner>,
    flush_cv: Condvar,
    next_lsn: AtomicU32,
    /// Highest LSN on disk, -1 before the first flush.
    persistent_lsn: AtomicI64,
    /// Records appended this run, for the runtime undo walk. Entries of a
    /// transaction are pruned when it finishes; recovery reads the file.
    history: Mutex<HashMap<Lsn, LogRecord>>,
    shutdown: AtomicBool,
    flusher: Mutex<Option<JoinHandle<()>>>,
    path: PathBuf,
}

impl LogManager {
    pub fn open(dir: &Path) -> Result<Arc<Self>> {
        let path = dir.join(LOG_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| DbError::Io(format!("opening log file {}", path.display())))?;
        Ok(Arc::new(Self {
            inner: Mutex::new(LogInner {
                buf: Vec::with_capacity(LOG_BUFFER_SIZE),
                file,
                last_appended: -1,
            }),
            flush_cv: Condvar::new(),
            next_lsn: AtomicU32::new(FIRST_LSN),
            persistent_lsn: AtomicI64::new(-1),
            history: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            flusher: Mutex::new(None),
            path,
        }))
    }

    /// Seeds the LSN counter after recovery scanned the existing log.
    pub fn bootstrap(&self, next_lsn: Lsn, durable_upto: Option<Lsn>) {
        self.next_lsn.store(next_lsn.max(FIRST_LSN), Ordering::SeqCst);
        if let Some(lsn) = durable_upto {
            self.persistent_lsn.store(lsn as i64, Ordering::SeqCst);
            self.inner.lock().last_appended = lsn as i64;
        }
    }

    pub fn append(&self, prev_lsn: Lsn, txn_id: TxnId, payload: LogPayload) -> Result<Lsn> {
        let mut inner = self.inner.lock();
        let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        let record = LogRecord {
            lsn,
            prev_lsn,
            txn_id,
            payload,
        };

        let mut bytes = Vec::with_capacity(64);
        record.encode(&mut bytes)?;
        if inner.buf.len() + bytes.len() > LOG_BUFFER_SIZE {
            self.flush_inner(&mut inner)?;
        }
        inner.buf.extend_from_slice(&bytes);
        inner.last_appended = lsn as i64;
        drop(inner);

        self.history.lock().insert(lsn, record);
        self.flush_cv.notify_one();
        Ok(lsn)
    }

    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.flush_inner(&mut inner)
    }

    /// Blocks until everything up to `lsn` is on disk. Used by commit and
    /// by the buffer pool's dirty-page gate.
    pub fn force_flush_until(&self, lsn: Lsn) -> Result<()> {
        if lsn == INVALID_LSN || lsn == 0 {
            return Ok(());
        }
        if self.persistent_lsn.load(Ordering::SeqCst) >= lsn as i64 {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        self.flush_inner(&mut inner)?;
        if self.persistent_lsn.load(Ordering::SeqCst) < lsn as i64 {
            bail!(DbError::Invariant(format!(
                "lsn {lsn} was never appended but a flush up to it was demanded"
            )));
        }
        Ok(())
    }

    fn flush_inner(&self, inner: &mut LogInner) -> Result<()> {
        if inner.buf.is_empty() {
            return Ok(());
        }
        let last = inner.last_appended;
        inner
            .file
            .write_all(&inner.buf)
            .with_context(|| DbError::Io("appending to the log file".into()))?;
        inner
            .file
            .flush()
            .with_context(|| DbError::Io("flushing the log file".into()))?;
        inner.buf.clear();
        self.persistent_lsn.store(last, Ordering::SeqCst);
        debug!("log flushed up to lsn {last}");
        Ok(())
    }

    pub fn persistent_lsn(&self) -> Option<Lsn> {
        match self.persistent_lsn.load(Ordering::SeqCst) {
            v if v < 0 => None,
            v => Some(v as Lsn),
        }
    }

    pub fn record(&self, lsn: Lsn) -> Option<LogRecord> {
        self.history.lock().get(&lsn).cloned()
    }

    /// Drops a finished transaction's records from the undo map.
    pub fn prune_txn(&self, txn_id: TxnId) {
        self.history.lock().retain(|_, r| r.txn_id != txn_id);
    }

    pub fn log_path(&self) -> &Path {
        &self.path
    }

    pub fn start_flusher(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("wal-flusher".into())
            .spawn(move || manager.flusher_loop())
            .expect("spawning the wal flusher");
        *self.flusher.lock() = Some(handle);
    }

    fn flusher_loop(&self) {
        loop {
            let mut inner = self.inner.lock();
            if self.shutdown.load(Ordering::SeqCst) {
                let _ = self.flush_inner(&mut inner);
                return;
            }
            let _ = self.flush_cv.wait_for(&mut inner, FLUSH_PERIOD);
            if !inner.buf.is_empty() {
                if let Err(e) = self.flush_inner(&mut inner) {
                    log::error!("background log flush failed: {e}");
                }
            }
        }
    }

    /// Final flush + fsync, then joins the flusher.
    pub fn shutdown(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.flush_cv.notify_all();
        if let Some(handle) = self.flusher.lock().take() {
            let _ = handle.join();
        }
        let mut inner = self.inner.lock();
        self.flush_inner(&mut inner)?;
        inner
            .file
            .sync_all()
            .with_context(|| DbError::Io("syncing the log file".into()))?;
        info!("log manager shut down at lsn {}", inner.last_appended);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::Rid;
    use crate::wal::log_record::LogPayload;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("latticedb_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_append_assigns_increasing_lsns() -> Result<()> {
        let dir = temp_dir();
        let log = LogManager::open(&dir)?;
        let a = log.append(INVALID_LSN, 1, LogPayload::Begin)?;
        let b = log.append(a, 1, LogPayload::Commit)?;
        assert!(b > a);
        assert_eq!(log.record(a).unwrap().payload, LogPayload::Begin);
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn test_force_flush_reaches_disk() -> Result<()> {
        let dir = temp_dir();
        let log = LogManager::open(&dir)?;
        let a = log.append(INVALID_LSN, 1, LogPayload::Begin)?;
        let b = log.append(
            a,
            1,
            LogPayload::Insert {
                rid: Rid::new(5, 0),
                tuple: vec![1, 2, 3],
            },
        )?;
        assert_eq!(log.persistent_lsn(), None);
        log.force_flush_until(b)?;
        assert_eq!(log.persistent_lsn(), Some(b));

        let bytes = std::fs::read(log.log_path())?;
        let mut pos = 0;
        let mut lsns = vec![];
        while let Some(r) = LogRecord::decode(&bytes, &mut pos)? {
            lsns.push(r.lsn);
        }
        assert_eq!(lsns, vec![a, b]);
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn test_prune_drops_history() -> Result<()> {
        let dir = temp_dir();
        let log = LogManager::open(&dir)?;
        let a = log.append(INVALID_LSN, 7, LogPayload::Begin)?;
        let b = log.append(INVALID_LSN, 8, LogPayload::Begin)?;
        log.prune_txn(7);
        assert!(log.record(a).is_none());
        assert!(log.record(b).is_some());
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn test_buffer_spill_on_overflow() -> Result<()> {
        let dir = temp_dir();
        let log = LogManager::open(&dir)?;
        // each record carries ~64 KiB, so a handful overflow the buffer
        let blob = vec![0xABu8; 64 * 1024];
        let mut prev = INVALID_LSN;
        for _ in 0..40 {
            prev = log.append(
                prev,
                3,
                LogPayload::Insert {
                    rid: Rid::new(2, 0),
                    tuple: blob.clone(),
                },
            )?;
        }
        // the spill path must have pushed earlier records to disk
        assert!(log.persistent_lsn().is_some());
        log.force_flush_until(prev)?;
        assert_eq!(log.persistent_lsn(), Some(prev));
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn test_shutdown_joins_flusher() -> Result<()> {
        let dir = temp_dir();
        let log = LogManager::open(&dir)?;
        log.start_flusher();
        log.append(INVALID_LSN, 1, LogPayload::Begin)?;
        log.shutdown()?;
        assert!(log.persistent_lsn().is_some());
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }
}
