use super::{encode_key, Index, KeyBytes};
use crate::buffer_pool::{ArcBufferPool, PageGuard};
use crate::errors::DbError;
use crate::latch::Latch;
use crate::pages::index_page::{
    read_node, write_internal, write_leaf, EntryKey, IndexNode, InternalNode, LeafNode,
    INTERNAL_CAPACITY, INTERNAL_MIN, LEAF_CAPACITY, LEAF_MIN,
};
use crate::pages::PageId;
use crate::tuple::{Rid, Tuple};
use crate::txn::Transaction;
use crate::types::Types;
use anyhow::{bail, Result};
use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;

/// A page pinned and latched for the duration of a descent step. The
/// latch outlives lexical scopes (crabbing releases ancestors from deep
/// inside the walk), hence the manual unlock on drop.
struct LatchedPage {
    guard: PageGuard,
    latch: Arc<Latch>,
    exclusive: bool,
}

impl LatchedPage {
    fn shared(bpm: &ArcBufferPool, page_id: PageId) -> Result<Self> {
        let guard = PageGuard::fetch(bpm, page_id)?;
        let latch = guard.latch();
        latch.rlock();
        Ok(Self {
            guard,
            latch,
            exclusive: false,
        })
    }

    fn exclusive(bpm: &ArcBufferPool, page_id: PageId) -> Result<Self> {
        let guard = PageGuard::fetch(bpm, page_id)?;
        let latch = guard.latch();
        latch.wlock();
        Ok(Self {
            guard,
            latch,
            exclusive: true,
        })
    }

    /// A freshly allocated page, latched exclusively (uncontended).
    fn exclusive_new(bpm: &ArcBufferPool) -> Result<Self> {
        let guard = PageGuard::create(bpm)?;
        let latch = guard.latch();
        latch.wlock();
        Ok(Self {
            guard,
            latch,
            exclusive: true,
        })
    }

    fn page_id(&self) -> PageId {
        self.guard.page_id()
    }
}

impl Drop for LatchedPage {
    fn drop(&mut self) {
        if self.exclusive {
            self.latch.wunlock();
        } else {
            self.latch.runlock();
        }
    }
}

/// A node lifted off its page for rebalancing.
enum OwnedNode {
    Leaf(LeafNode),
    Internal(InternalNode),
}

/// B+ tree over the buffer pool: internal and leaf node pages, a leaf
/// sibling chain for range scans, and composite (value, RID) keys so
/// duplicates stay unique.
///
/// Latching: readers crab shared latches down the tree and along the
/// sibling chain. Writers serialize on the root-pointer mutex, latch
/// their path exclusively and release ancestors as soon as the current
/// node cannot split or merge, so readers stream past the safe part of
/// the path while a writer works below it.
pub struct BPlusTree {
    bpm: ArcBufferPool,
    key_type: Types,
    root: Mutex<PageId>,
}

impl std::fmt::Debug for BPlusTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BPlusTree")
            .field("key_type", &self.key_type)
            .finish()
    }
}

impl BPlusTree {
    /// Creates an empty tree whose root is a fresh leaf.
    pub fn create(bpm: ArcBufferPool, key_type: Types) -> Result<Self> {
        let mut guard = PageGuard::create(&bpm)?;
        write_leaf(&mut guard.write(), &LeafNode::default());
        let root = guard.page_id();
        debug!("new b+ tree rooted at page {root}");
        Ok(Self {
            bpm,
            key_type,
            root: Mutex::new(root),
        })
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root.lock()
    }

    /// Latches the leaf that may contain `key`, shared, crabbing down.
    fn find_leaf_shared(&self, key: &EntryKey) -> Result<(LatchedPage, LeafNode)> {
        // the root can move between reading the pointer and latching the
        // page, so re-check after the latch is held
        let mut current = loop {
            let root_id = *self.root.lock();
            let latched = LatchedPage::shared(&self.bpm, root_id)?;
            if *self.root.lock() == root_id {
                break latched;
            }
        };
        loop {
            let node = read_node(&current.guard.read())?;
            match node {
                IndexNode::Leaf(leaf) => return Ok((current, leaf)),
                IndexNode::Internal(internal) => {
                    let (_, child) = internal.child_for(key);
                    let next = LatchedPage::shared(&self.bpm, child)?;
                    current = next;
                }
            }
        }
    }

    pub fn insert_entry(&self, key: EntryKey) -> Result<()> {
        let mut root_lock = Some(self.root.lock());
        let root_id = **root_lock.as_ref().unwrap();
        let mut stack: Vec<(LatchedPage, InternalNode, usize)> = Vec::new();
        let mut current = LatchedPage::exclusive(&self.bpm, root_id)?;

        loop {
            let node = read_node(&current.guard.read())?;
            match node {
                IndexNode::Internal(internal) => {
                    if internal.keys.len() < INTERNAL_CAPACITY {
                        stack.clear();
                        root_lock = None;
                    }
                    let (idx, child) = internal.child_for(&key);
                    let child_page = LatchedPage::exclusive(&self.bpm, child)?;
                    stack.push((current, internal, idx));
                    current = child_page;
                }
                IndexNode::Leaf(mut leaf) => {
                    if leaf.keys.len() < LEAF_CAPACITY {
                        stack.clear();
                        root_lock = None;
                    }
                    let pos = match leaf.keys.binary_search(&key) {
                        // the exact (value, rid) pair is already present
                        Ok(_) => return Ok(()),
                        Err(pos) => pos,
                    };
                    if leaf.keys.len() < LEAF_CAPACITY {
                        leaf.keys.insert(pos, key);
                        write_leaf(&mut current.guard.write(), &leaf);
                        return Ok(());
                    }
                    return self.split_leaf(current, leaf, pos, key, stack, root_lock);
                }
            }
        }
    }

    fn split_leaf(
        &self,
        mut current: LatchedPage,
        leaf: LeafNode,
        pos: usize,
        key: EntryKey,
        stack: Vec<(LatchedPage, InternalNode, usize)>,
        root_lock: Option<parking_lot::MutexGuard<'_, PageId>>,
    ) -> Result<()> {
        let mut all: Vec<EntryKey> = leaf.keys.to_vec();
        all.insert(pos, key);
        let mid = all.len() / 2;

        let mut right_latched = LatchedPage::exclusive_new(&self.bpm)?;
        let right_id = right_latched.page_id();
        let right = LeafNode {
            keys: all[mid..].iter().copied().collect(),
            next: leaf.next,
        };
        let left = LeafNode {
            keys: all[..mid].iter().copied().collect(),
            next: Some(right_id),
        };
        let separator = right.keys[0];
        write_leaf(&mut right_latched.guard.write(), &right);
        write_leaf(&mut current.guard.write(), &left);
        let left_id = current.page_id();
        debug!("leaf {left_id} split, new sibling {right_id}");

        // both halves stay latched until every ancestor link is in
        // place, so no reader sees the half-linked split
        let held = vec![right_latched, current];
        self.insert_into_parent(stack, left_id, separator, right_id, root_lock, held)
    }

    fn insert_into_parent(
        &self,
        mut stack: Vec<(LatchedPage, InternalNode, usize)>,
        mut left_id: PageId,
        mut separator: EntryKey,
        mut right_id: PageId,
        mut root_lock: Option<parking_lot::MutexGuard<'_, PageId>>,
        mut held: Vec<LatchedPage>,
    ) -> Result<()> {
        loop {
            match stack.pop() {
                None => {
                    // the split reached the top: grow a new root. The
                    // pointer swap makes it visible; readers that latched
                    // the old root re-check the pointer and restart.
                    let mut guard = PageGuard::create(&self.bpm)?;
                    let mut node = InternalNode::default();
                    node.children.push(left_id);
                    node.keys.push(separator);
                    node.children.push(right_id);
                    write_internal(&mut guard.write(), &node);
                    let mut lock = root_lock
                        .take()
                        .expect("an unsafe root keeps the root pointer locked");
                    *lock = guard.page_id();
                    debug!("tree grew a new root at page {}", guard.page_id());
                    return Ok(());
                }
                Some((mut parent, mut node, idx)) => {
                    if node.keys.len() < INTERNAL_CAPACITY {
                        node.keys.insert(idx, separator);
                        node.children.insert(idx + 1, right_id);
                        write_internal(&mut parent.guard.write(), &node);
                        return Ok(());
                    }

                    // split the internal node; the median moves up
                    let mut keys: Vec<EntryKey> = node.keys.to_vec();
                    let mut children: Vec<PageId> = node.children.to_vec();
                    keys.insert(idx, separator);
                    children.insert(idx + 1, right_id);
                    let mid = keys.len() / 2;
                    let median = keys[mid];

                    let mut right_latched = LatchedPage::exclusive_new(&self.bpm)?;
                    let new_right = InternalNode {
                        keys: keys[mid + 1..].iter().copied().collect(),
                        children: children[mid + 1..].iter().copied().collect(),
                    };
                    let new_left = InternalNode {
                        keys: keys[..mid].iter().copied().collect(),
                        children: children[..=mid].iter().copied().collect(),
                    };
                    write_internal(&mut right_latched.guard.write(), &new_right);
                    write_internal(&mut parent.guard.write(), &new_left);

                    left_id = parent.page_id();
                    separator = median;
                    right_id = right_latched.page_id();
                    held.push(right_latched);
                    held.push(parent);
                }
            }
        }
    }

    pub fn delete_entry(&self, key: EntryKey) -> Result<bool> {
        let mut root_lock = Some(self.root.lock());
        let root_id = **root_lock.as_ref().unwrap();
        let mut stack: Vec<(LatchedPage, InternalNode, usize)> = Vec::new();
        let mut current = LatchedPage::exclusive(&self.bpm, root_id)?;

        loop {
            let node = read_node(&current.guard.read())?;
            match node {
                IndexNode::Internal(internal) => {
                    let at_root = stack.is_empty();
                    let safe = if at_root {
                        internal.keys.len() >= 2
                    } else {
                        internal.keys.len() > INTERNAL_MIN
                    };
                    if safe {
                        stack.clear();
                        root_lock = None;
                    }
                    let (idx, child) = internal.child_for(&key);
                    let child_page = LatchedPage::exclusive(&self.bpm, child)?;
                    stack.push((current, internal, idx));
                    current = child_page;
                }
                IndexNode::Leaf(mut leaf) => {
                    let is_root = stack.is_empty();
                    if is_root || leaf.keys.len() > LEAF_MIN {
                        stack.clear();
                        root_lock = None;
                    }
                    let pos = match leaf.keys.binary_search(&key) {
                        Ok(pos) => pos,
                        Err(_) => return Ok(false),
                    };
                    leaf.keys.remove(pos);
                    if stack.is_empty() || leaf.keys.len() >= LEAF_MIN {
                        write_leaf(&mut current.guard.write(), &leaf);
                        return Ok(true);
                    }
                    self.rebalance(current, OwnedNode::Leaf(leaf), stack, root_lock)?;
                    return Ok(true);
                }
            }
        }
    }

    /// Repairs an underflowed node bottom-up: borrow from a sibling when
    /// it can spare an entry, merge otherwise, recursing when the merge
    /// underflows the parent. The root shrinks when it runs out of keys.
    fn rebalance(
        &self,
        child_latch: LatchedPage,
        child: OwnedNode,
        mut stack: Vec<(LatchedPage, InternalNode, usize)>,
        mut root_lock: Option<parking_lot::MutexGuard<'_, PageId>>,
    ) -> Result<()> {
        let mut child_latch = child_latch;
        let mut child = child;

        loop {
            let (mut parent_latch, mut parent, idx) = stack
                .pop()
                .expect("an underflowed non-root keeps its parent latched");

            let sep_idx = idx.saturating_sub(1);
            let sibling_id = if idx > 0 {
                parent.children[idx - 1]
            } else {
                parent.children[1]
            };
            let mut sibling_latch = LatchedPage::exclusive(&self.bpm, sibling_id)?;
            let sibling = read_node(&sibling_latch.guard.read())?;

            let merged = if idx > 0 {
                self.borrow_or_merge_left(
                    &mut child_latch,
                    &mut child,
                    &mut sibling_latch,
                    sibling,
                    &mut parent,
                    sep_idx,
                )?
                .then_some((idx, child_latch.page_id()))
            } else {
                self.borrow_or_merge_right(
                    &mut child_latch,
                    &mut child,
                    &mut sibling_latch,
                    sibling,
                    &mut parent,
                )?
                .then_some((1, sibling_id))
            };

            let Some((remove_child_idx, freed_page)) = merged else {
                // a borrow fixed everything; separators were updated.
                // The parent is written before any latch drops.
                write_internal(&mut parent_latch.guard.write(), &parent);
                return Ok(());
            };

            parent.keys.remove(remove_child_idx - 1);
            parent.children.remove(remove_child_idx);

            if stack.is_empty() {
                if parent.keys.is_empty() {
                    // the root lost its last separator: its single child
                    // becomes the new root. Readers that latched the old
                    // root re-check the pointer and restart.
                    let new_root = parent.children[0];
                    let mut lock = root_lock
                        .take()
                        .expect("an unsafe root keeps the root pointer locked");
                    let old_root = parent_latch.page_id();
                    *lock = new_root;
                    drop(sibling_latch);
                    drop(child_latch);
                    drop(parent_latch);
                    let _ = self.bpm.lock().delete_page(freed_page);
                    let _ = self.bpm.lock().delete_page(old_root);
                    debug!("tree shrank, new root is page {new_root}");
                } else {
                    write_internal(&mut parent_latch.guard.write(), &parent);
                    drop(sibling_latch);
                    drop(child_latch);
                    let _ = self.bpm.lock().delete_page(freed_page);
                }
                return Ok(());
            }

            write_internal(&mut parent_latch.guard.write(), &parent);
            drop(sibling_latch);
            drop(child_latch);
            let _ = self.bpm.lock().delete_page(freed_page);

            if parent.keys.len() >= INTERNAL_MIN {
                return Ok(());
            }
            child_latch = parent_latch;
            child = OwnedNode::Internal(parent);
        }
    }

    /// Left sibling: borrow its maximum, or merge the child into it.
    /// Returns true when a merge happened (child's slot must go away).
    fn borrow_or_merge_left(
        &self,
        child_latch: &mut LatchedPage,
        child: &mut OwnedNode,
        sibling_latch: &mut LatchedPage,
        sibling: IndexNode,
        parent: &mut InternalNode,
        sep_idx: usize,
    ) -> Result<bool> {
        match (child, sibling) {
            (OwnedNode::Leaf(child), IndexNode::Leaf(mut sibling)) => {
                if sibling.keys.len() > LEAF_MIN {
                    let moved = sibling.keys.pop().unwrap();
                    child.keys.insert(0, moved);
                    parent.keys[sep_idx] = moved;
                    write_leaf(&mut sibling_latch.guard.write(), &sibling);
                    write_leaf(&mut child_latch.guard.write(), child);
                    Ok(false)
                } else {
                    sibling.keys.extend(child.keys.iter().copied());
                    sibling.next = child.next;
                    write_leaf(&mut sibling_latch.guard.write(), &sibling);
                    Ok(true)
                }
            }
            (OwnedNode::Internal(child), IndexNode::Internal(mut sibling)) => {
                if sibling.keys.len() > INTERNAL_MIN {
                    let moved_key = sibling.keys.pop().unwrap();
                    let moved_child = sibling.children.pop().unwrap();
                    child.keys.insert(0, parent.keys[sep_idx]);
                    child.children.insert(0, moved_child);
                    parent.keys[sep_idx] = moved_key;
                    write_internal(&mut sibling_latch.guard.write(), &sibling);
                    write_internal(&mut child_latch.guard.write(), child);
                    Ok(false)
                } else {
                    // the separator comes down between the merged halves
                    sibling.keys.push(parent.keys[sep_idx]);
                    sibling.keys.extend(child.keys.iter().copied());
                    sibling.children.extend(child.children.iter().copied());
                    write_internal(&mut sibling_latch.guard.write(), &sibling);
                    Ok(true)
                }
            }
            _ => bail!(DbError::Corruption(
                "sibling node kinds disagree in the b+ tree".into()
            )),
        }
    }

    /// Right sibling (child is the leftmost): borrow its minimum, or
    /// merge the sibling into the child. Returns true on merge.
    fn borrow_or_merge_right(
        &self,
        child_latch: &mut LatchedPage,
        child: &mut OwnedNode,
        sibling_latch: &mut LatchedPage,
        sibling: IndexNode,
        parent: &mut InternalNode,
    ) -> Result<bool> {
        match (child, sibling) {
            (OwnedNode::Leaf(child), IndexNode::Leaf(mut sibling)) => {
                if sibling.keys.len() > LEAF_MIN {
                    let moved = sibling.keys.remove(0);
                    child.keys.push(moved);
                    parent.keys[0] = sibling.keys[0];
                    write_leaf(&mut sibling_latch.guard.write(), &sibling);
                    write_leaf(&mut child_latch.guard.write(), child);
                    Ok(false)
                } else {
                    child.keys.extend(sibling.keys.iter().copied());
                    child.next = sibling.next;
                    write_leaf(&mut child_latch.guard.write(), child);
                    Ok(true)
                }
            }
            (OwnedNode::Internal(child), IndexNode::Internal(mut sibling)) => {
                if sibling.keys.len() > INTERNAL_MIN {
                    let moved_key = sibling.keys.remove(0);
                    let moved_child = sibling.children.remove(0);
                    child.keys.push(parent.keys[0]);
                    child.children.push(moved_child);
                    parent.keys[0] = moved_key;
                    write_internal(&mut sibling_latch.guard.write(), &sibling);
                    write_internal(&mut child_latch.guard.write(), child);
                    Ok(false)
                } else {
                    child.keys.push(parent.keys[0]);
                    child.keys.extend(sibling.keys.iter().copied());
                    child.children.extend(sibling.children.iter().copied());
                    write_internal(&mut child_latch.guard.write(), child);
                    Ok(true)
                }
            }
            _ => bail!(DbError::Corruption(
                "sibling node kinds disagree in the b+ tree".into()
            )),
        }
    }

    /// Walks the sibling chain from the first leaf that can hold `from`,
    /// collecting RIDs while `keep` accepts the composite and `stop`
    /// has not fired.
    fn collect(
        &self,
        from: EntryKey,
        mut keep: impl FnMut(&EntryKey) -> bool,
        mut stop: impl FnMut(&EntryKey) -> bool,
    ) -> Result<Vec<Rid>> {
        let mut out = Vec::new();
        let (mut current, mut leaf) = self.find_leaf_shared(&from)?;
        loop {
            for entry in &leaf.keys {
                if stop(entry) {
                    return Ok(out);
                }
                if keep(entry) {
                    out.push(entry.rid);
                }
            }
            match leaf.next {
                None => return Ok(out),
                Some(next_id) => {
                    // couple: latch the sibling before releasing this leaf
                    current = LatchedPage::shared(&self.bpm, next_id)?;
                    leaf = match read_node(&current.guard.read())? {
                        IndexNode::Leaf(leaf) => leaf,
                        IndexNode::Internal(_) => bail!(DbError::Corruption(format!(
                            "page {next_id} sits in a leaf chain but is an internal node"
                        ))),
                    };
                }
            }
        }
    }

    fn encode(&self, key: &Tuple) -> Result<KeyBytes> {
        match key.value(0) {
            Some(value) if key.arity() == 1 => encode_key(value, self.key_type),
            _ => bail!(DbError::Constraint(
                "index keys are single-column".to_string()
            )),
        }
    }
}

impl Index for BPlusTree {
    fn insert(&self, key: &Tuple, rid: Rid, _txn: Option<&Transaction>) -> Result<()> {
        let bytes = self.encode(key)?;
        self.insert_entry(EntryKey::new(bytes, rid))
    }

    fn delete(&self, key: &Tuple, rid: Rid, _txn: Option<&Transaction>) -> Result<bool> {
        let bytes = self.encode(key)?;
        self.delete_entry(EntryKey::new(bytes, rid))
    }

    fn scan_key(&self, key: &Tuple, _txn: Option<&Transaction>) -> Result<Vec<Rid>> {
        let bytes = self.encode(key)?;
        self.collect(
            EntryKey::lowest(bytes),
            |entry| entry.key == bytes,
            |entry| entry.key > bytes,
        )
    }

    fn scan_range(
        &self,
        lo: Option<&Tuple>,
        hi: Option<&Tuple>,
        lo_inclusive: bool,
        hi_inclusive: bool,
    ) -> Result<Vec<Rid>> {
        let lo_bytes = lo.map(|t| self.encode(t)).transpose()?;
        let hi_bytes = hi.map(|t| self.encode(t)).transpose()?;
        let start = EntryKey::lowest(lo_bytes.unwrap_or([0u8; 8]));

        self.collect(
            start,
            move |entry| match lo_bytes {
                None => true,
                Some(lo) if lo_inclusive => entry.key >= lo,
                Some(lo) => entry.key > lo,
            },
            move |entry| match hi_bytes {
                None => false,
                Some(hi) if hi_inclusive => entry.key > hi,
                Some(hi) => entry.key >= hi,
            },
        )
    }

    fn scan_all(&self) -> Result<Vec<Rid>> {
        self.collect(EntryKey::lowest([0u8; 8]), |_| true, |_| false)
    }
}
