use crate::pages::{Page, INVALID_PAGE_ID};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// One buffer-pool slot. The page body is shared out to pinned-page
/// guards through the `Arc`; the pin count gates eviction.
pub(super) struct Frame {
    page: Arc<RwLock<Page>>,
    pin_count: AtomicU32,
}

impl Frame {
    pub fn new() -> Self {
        Self {
            page: Arc::new(RwLock::new(Page::new())),
            pin_count: AtomicU32::new(0),
        }
    }

    pub fn page(&self) -> Arc<RwLock<Page>> {
        Arc::clone(&self.page)
    }

    pub fn page_id(&self) -> crate::pages::PageId {
        self.page.read().page_id()
    }

    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn unpin(&self) -> u32 {
        let previous = self.pin_count.fetch_sub(1, Ordering::SeqCst);
        assert!(previous > 0, "unpin of a frame with pin count 0");
        previous - 1
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::SeqCst)
    }

    /// Reclaims the frame for a new page. Caller guarantees the pin
    /// count is already zero.
    pub fn reset(&self, page_id: crate::pages::PageId) {
        debug_assert_eq!(self.pin_count(), 0);
        self.page.write().reset(page_id);
    }

    pub fn clear(&self) {
        self.page.write().reset(INVALID_PAGE_ID);
    }
}
