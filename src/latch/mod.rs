use parking_lot::lock_api::RawRwLock as RawRwLockTrait;
use parking_lot::RawRwLock;

/// A page latch that can be acquired and released out of lexical scope,
/// which guard-based locks cannot do. The B+ tree releases an ancestor's
/// latch from deep inside a descent once the child is known to be safe.
///
/// Callers own the pairing discipline: every `rlock` is matched by one
/// `runlock` and every `wlock`/`try_wlock` success by one `wunlock`.
pub struct Latch {
    lock: RawRwLock,
}

impl Default for Latch {
    fn default() -> Self {
        Latch::new()
    }
}

impl std::fmt::Debug for Latch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Latch")
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl Latch {
    pub fn new() -> Self {
        Self {
            lock: RawRwLock::INIT,
        }
    }

    pub fn rlock(&self) {
        self.lock.lock_shared();
    }

    pub fn runlock(&self) {
        unsafe { self.lock.unlock_shared() };
    }

    pub fn wlock(&self) {
        self.lock.lock_exclusive();
    }

    pub fn try_wlock(&self) -> bool {
        self.lock.try_lock_exclusive()
    }

    pub fn wunlock(&self) {
        unsafe { self.lock.unlock_exclusive() };
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}
