use super::{Page, PageId, INVALID_PAGE_ID};
use crate::errors::DbError;
use crate::index::KeyBytes;
use crate::tuple::Rid;
use anyhow::{bail, Result};
use arrayvec::ArrayVec;

/// B+-tree node layout.
///
/// ```text
/// 0       kind: 0 fresh, 1 leaf, 2 internal
/// 1..4    unused
/// 4..8    num_keys
/// 8..12   leaf: next sibling page id / internal: rightmost child
/// 12..    packed entries
/// ```
///
/// Every key is the composite (8-byte encoded value, RID), which makes
/// keys unique even for duplicate column values. Leaf entries are just
/// the 16-byte composite; internal entries append the 4-byte left child
/// of the separator, the rightmost child living in the header.
const KIND_LEAF: u8 = 1;
const KIND_INTERNAL: u8 = 2;

const NODE_HEADER_SIZE: usize = 12;
const LEAF_ENTRY_SIZE: usize = 16;
const INTERNAL_ENTRY_SIZE: usize = 20;

pub const LEAF_CAPACITY: usize = (super::PAGE_SIZE - NODE_HEADER_SIZE) / LEAF_ENTRY_SIZE;
pub const INTERNAL_CAPACITY: usize =
    (super::PAGE_SIZE - NODE_HEADER_SIZE) / INTERNAL_ENTRY_SIZE - 1;
pub const LEAF_MIN: usize = LEAF_CAPACITY / 2;
pub const INTERNAL_MIN: usize = INTERNAL_CAPACITY / 2;

/// Composite index key: unique because the RID is part of it. Field
/// order gives (value, rid) lexicographic comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EntryKey {
    pub key: KeyBytes,
    pub rid: Rid,
}

impl EntryKey {
    pub fn new(key: KeyBytes, rid: Rid) -> Self {
        Self { key, rid }
    }

    /// Smallest composite for a column value, for range starts.
    pub fn lowest(key: KeyBytes) -> Self {
        Self {
            key,
            rid: Rid::new(0, 0),
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.rid.page_id.to_le_bytes());
        out.extend_from_slice(&self.rid.slot.to_le_bytes());
    }

    fn read(bytes: &[u8]) -> Self {
        let mut key = [0u8; 8];
        key.copy_from_slice(&bytes[0..8]);
        let page_id = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let slot = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        Self {
            key,
            rid: Rid::new(page_id, slot),
        }
    }
}

#[derive(Debug, Default)]
pub struct LeafNode {
    pub keys: ArrayVec<EntryKey, LEAF_CAPACITY>,
    pub next: Option<PageId>,
}

#[derive(Debug, Default)]
pub struct InternalNode {
    pub keys: ArrayVec<EntryKey, INTERNAL_CAPACITY>,
    /// One more child than keys: `children[i]` holds composites below
    /// `keys[i]`, the last child everything at or above the last key.
    pub children: ArrayVec<PageId, { INTERNAL_CAPACITY + 1 }>,
}

impl InternalNode {
    /// Child to descend into for a composite key.
    pub fn child_for(&self, key: &EntryKey) -> (usize, PageId) {
        let idx = match self.keys.binary_search(key) {
            Ok(idx) => idx + 1,
            Err(idx) => idx,
        };
        (idx, self.children[idx])
    }
}

#[derive(Debug)]
pub enum IndexNode {
    Leaf(LeafNode),
    Internal(InternalNode),
}

pub fn read_node(page: &Page) -> Result<IndexNode> {
    let data = page.data();
    let kind = data[0];
    let num_keys = u32::from_le_bytes(data[4..8].try_into()?) as usize;
    let extra = u32::from_le_bytes(data[8..12].try_into()?);

    match kind {
        // a fresh zeroed page is an empty leaf
        0 => Ok(IndexNode::Leaf(LeafNode::default())),
        KIND_LEAF => {
            if num_keys > LEAF_CAPACITY {
                bail!(corrupt(page, "leaf overflow"));
            }
            let mut node = LeafNode {
                keys: ArrayVec::new(),
                next: match extra {
                    0 | INVALID_PAGE_ID => None,
                    id => Some(id),
                },
            };
            let mut offset = NODE_HEADER_SIZE;
            for _ in 0..num_keys {
                node.keys
                    .push(EntryKey::read(&data[offset..offset + LEAF_ENTRY_SIZE]));
                offset += LEAF_ENTRY_SIZE;
            }
            Ok(IndexNode::Leaf(node))
        }
        KIND_INTERNAL => {
            if num_keys > INTERNAL_CAPACITY || num_keys == 0 {
                bail!(corrupt(page, "internal node arity"));
            }
            let mut node = InternalNode::default();
            let mut offset = NODE_HEADER_SIZE;
            for _ in 0..num_keys {
                node.keys
                    .push(EntryKey::read(&data[offset..offset + 16]));
                node.children.push(u32::from_le_bytes(
                    data[offset + 16..offset + 20].try_into()?,
                ));
                offset += INTERNAL_ENTRY_SIZE;
            }
            node.children.push(extra);
            Ok(IndexNode::Internal(node))
        }
        _ => bail!(corrupt(page, "node kind")),
    }
}

pub fn write_leaf(page: &mut Page, node: &LeafNode) {
    let mut out = Vec::with_capacity(NODE_HEADER_SIZE + node.keys.len() * LEAF_ENTRY_SIZE);
    out.push(KIND_LEAF);
    out.extend_from_slice(&[0u8; 3]);
    out.extend_from_slice(&(node.keys.len() as u32).to_le_bytes());
    out.extend_from_slice(&node.next.unwrap_or(INVALID_PAGE_ID).to_le_bytes());
    for key in &node.keys {
        key.write(&mut out);
    }
    page.write_bytes(0, &out);
}

pub fn write_internal(page: &mut Page, node: &InternalNode) {
    debug_assert_eq!(node.children.len(), node.keys.len() + 1);
    let mut out = Vec::with_capacity(NODE_HEADER_SIZE + node.keys.len() * INTERNAL_ENTRY_SIZE);
    out.push(KIND_INTERNAL);
    out.extend_from_slice(&[0u8; 3]);
    out.extend_from_slice(&(node.keys.len() as u32).to_le_bytes());
    out.extend_from_slice(&node.children[node.keys.len()].to_le_bytes());
    for (key, child) in node.keys.iter().zip(&node.children) {
        key.write(&mut out);
        out.extend_from_slice(&child.to_le_bytes());
    }
    page.write_bytes(0, &out);
}

fn corrupt(page: &Page, what: &str) -> DbError {
    DbError::Corruption(format!("index page {}: {what}", page.page_id()))
}
