use super::FrameId;
use priority_queue::PriorityQueue;
use std::collections::HashMap;

/// Eviction policy over frame ids. The caller (buffer pool) is
/// responsible for flushing whatever lives in the victim frame.
pub trait ReplacementPolicy {
    /// Update recency. A freshly accessed frame is pinned until the
    /// caller marks it evictable again.
    fn record_access(&mut self, frame_id: FrameId);
    /// Mark non-evictable (a pin).
    fn pin(&mut self, frame_id: FrameId);
    /// Mark evictable again, keeping the recorded recency.
    fn unpin(&mut self, frame_id: FrameId);
    /// The frame to evict, if any frame is currently evictable.
    fn victim(&mut self) -> Option<FrameId>;
    /// Forget a frame entirely (frame returned to the free list).
    fn remove(&mut self, frame_id: FrameId);
    /// Number of currently evictable frames.
    fn size(&self) -> usize;
}

/// Tagged dispatch over the two shipping policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacerKind {
    Lru,
    Clock,
}

pub enum Replacer {
    Lru(LruReplacer),
    Clock(ClockReplacer),
}

impl Replacer {
    pub fn new(kind: ReplacerKind, capacity: usize) -> Self {
        match kind {
            ReplacerKind::Lru => Replacer::Lru(LruReplacer::new(capacity)),
            ReplacerKind::Clock => Replacer::Clock(ClockReplacer::new(capacity)),
        }
    }

    fn inner(&mut self) -> &mut dyn ReplacementPolicy {
        match self {
            Replacer::Lru(r) => r,
            Replacer::Clock(r) => r,
        }
    }

    pub fn record_access(&mut self, frame_id: FrameId) {
        self.inner().record_access(frame_id);
    }

    pub fn pin(&mut self, frame_id: FrameId) {
        self.inner().pin(frame_id);
    }

    pub fn unpin(&mut self, frame_id: FrameId) {
        self.inner().unpin(frame_id);
    }

    pub fn victim(&mut self) -> Option<FrameId> {
        self.inner().victim()
    }

    pub fn remove(&mut self, frame_id: FrameId) {
        self.inner().remove(frame_id);
    }

    pub fn size(&mut self) -> usize {
        self.inner().size()
    }
}

/// Least-recently-used policy: a min-heap of access timestamps holds the
/// evictable frames; pinned frames park their timestamp on the side and
/// rejoin the heap with it on unpin.
pub struct LruReplacer {
    timestamp: i64,
    heap: PriorityQueue<FrameId, i64>,
    parked: HashMap<FrameId, i64>,
}

impl LruReplacer {
    pub fn new(capacity: usize) -> Self {
        Self {
            timestamp: 0,
            heap: PriorityQueue::with_capacity(capacity),
            parked: HashMap::with_capacity(capacity),
        }
    }
}

impl ReplacementPolicy for LruReplacer {
    fn record_access(&mut self, frame_id: FrameId) {
        self.timestamp += 1;
        // negated so the least recent has the highest priority
        self.parked.insert(frame_id, -self.timestamp);
        self.heap.remove(&frame_id);
    }

    fn pin(&mut self, frame_id: FrameId) {
        if let Some((frame_id, ts)) = self.heap.remove(&frame_id) {
            self.parked.insert(frame_id, ts);
        }
    }

    fn unpin(&mut self, frame_id: FrameId) {
        if let Some(ts) = self.parked.remove(&frame_id) {
            self.heap.push(frame_id, ts);
        }
    }

    fn victim(&mut self) -> Option<FrameId> {
        self.heap.pop().map(|(frame_id, _)| frame_id)
    }

    fn remove(&mut self, frame_id: FrameId) {
        self.heap.remove(&frame_id);
        self.parked.remove(&frame_id);
    }

    fn size(&self) -> usize {
        self.heap.len()
    }
}

#[derive(Debug, Clone, Copy)]
struct ClockSlot {
    frame_id: FrameId,
    reference_bit: bool,
    evictable: bool,
}

/// CLOCK policy: a circular array of frames with reference bits. The
/// hand sweeps, clearing reference bits, and evicts the first evictable
/// frame whose bit is already clear.
pub struct ClockReplacer {
    slots: Vec<Option<ClockSlot>>,
    index: HashMap<FrameId, usize>,
    hand: usize,
}

impl ClockReplacer {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
            index: HashMap::with_capacity(capacity),
            hand: 0,
        }
    }

    fn slot_of(&mut self, frame_id: FrameId) -> usize {
        if let Some(&idx) = self.index.get(&frame_id) {
            return idx;
        }
        let idx = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .expect("clock replacer sized to the frame count");
        self.slots[idx] = Some(ClockSlot {
            frame_id,
            reference_bit: false,
            evictable: false,
        });
        self.index.insert(frame_id, idx);
        idx
    }
}

impl ReplacementPolicy for ClockReplacer {
    fn record_access(&mut self, frame_id: FrameId) {
        let idx = self.slot_of(frame_id);
        let slot = self.slots[idx].as_mut().unwrap();
        slot.reference_bit = true;
        slot.evictable = false;
    }

    fn pin(&mut self, frame_id: FrameId) {
        let idx = self.slot_of(frame_id);
        self.slots[idx].as_mut().unwrap().evictable = false;
    }

    fn unpin(&mut self, frame_id: FrameId) {
        let idx = self.slot_of(frame_id);
        let slot = self.slots[idx].as_mut().unwrap();
        slot.evictable = true;
        slot.reference_bit = true;
    }

    fn victim(&mut self) -> Option<FrameId> {
        if self.size() == 0 {
            return None;
        }
        // two sweeps suffice: the first clears reference bits, the
        // second then finds a clear evictable slot
        for _ in 0..self.slots.len() * 2 {
            let idx = self.hand;
            self.hand = (self.hand + 1) % self.slots.len();
            if let Some(slot) = self.slots[idx].as_mut() {
                if !slot.evictable {
                    continue;
                }
                if slot.reference_bit {
                    slot.reference_bit = false;
                    continue;
                }
                let frame_id = slot.frame_id;
                self.slots[idx] = None;
                self.index.remove(&frame_id);
                return Some(frame_id);
            }
        }
        None
    }

    fn remove(&mut self, frame_id: FrameId) {
        if let Some(idx) = self.index.remove(&frame_id) {
            self.slots[idx] = None;
        }
    }

    fn size(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Some(slot) if slot.evictable))
            .count()
    }
}
