use crate::buffer_pool::{ArcBufferPool, PageGuard};
use crate::pages::table_page::TablePage;
use crate::pages::PageId;
use crate::tuple::{Rid, SlotId, Tuple};
use log::warn;

/// Forward-only scan over a heap's page chain, skipping tombstones. The
/// current page stays pinned between `next` calls and is released when
/// its live slots are exhausted.
pub struct TableIter {
    bpm: ArcBufferPool,
    next_page: Option<PageId>,
    current: Option<(PageGuard, SlotId)>,
}

impl TableIter {
    pub(super) fn new(bpm: ArcBufferPool, first_page_id: PageId) -> Self {
        Self {
            bpm,
            next_page: Some(first_page_id),
            current: None,
        }
    }
}

impl Iterator for TableIter {
    type Item = (Tuple, Rid);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                let page_id = self.next_page?;
                let guard = match PageGuard::fetch(&self.bpm, page_id) {
                    Ok(guard) => guard,
                    Err(e) => {
                        warn!("scan stopped: fetching page {page_id}: {e}");
                        return None;
                    }
                };
                self.next_page = TablePage::new(&guard.read()).next_page_id();
                self.current = Some((guard, 0));
            }

            let found = {
                let (guard, slot) = self.current.as_ref().unwrap();
                let page = guard.read();
                let view = TablePage::new(&page);
                view.next_live_slot(*slot)
                    .map(|live| (live, view.read_tuple(live).unwrap().to_vec()))
            };

            match found {
                Some((live, bytes)) => {
                    let page_id = self.current.as_ref().unwrap().0.page_id();
                    self.current.as_mut().unwrap().1 = live + 1;
                    match Tuple::from_bytes(&bytes) {
                        Ok(tuple) => return Some((tuple, Rid::new(page_id, live))),
                        Err(e) => {
                            warn!("scan skipped undecodable tuple at ({page_id}, {live}): {e}");
                        }
                    }
                }
                None => {
                    // page exhausted, release its pin before moving on
                    self.current = None;
                    self.next_page?;
                }
            }
        }
    }
}
