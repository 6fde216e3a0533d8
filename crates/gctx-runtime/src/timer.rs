//! Reactor timers
//!
//! Timer queue design:
//! - BinaryHeap (min-heap) for O(1) next deadline peek
//! - Entries name a context by id and the switch epoch at arming time;
//!   an entry whose context was freed or resumed since is stale and
//!   silently discarded when it fires
//! - Owned by one reactor, so no locking

use gctx_core::CtxId;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::OnceLock;
use std::time::Instant;

static START_INSTANT: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds since the first call in this process
#[inline]
pub fn now_ns() -> u64 {
    START_INSTANT.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TimerEntry {
    pub deadline: Instant,
    pub ctx: CtxId,
    pub epoch: u64,
    seq: u64,
}

// Min-heap ordering (earliest deadline first, then arming order)
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, deadline: Instant, ctx: CtxId, epoch: u64) {
        self.seq += 1;
        self.heap.push(TimerEntry { deadline, ctx, epoch, seq: self.seq });
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }

    /// Pop the earliest entry if it is due at `now`
    pub fn pop_expired(&mut self, now: Instant) -> Option<TimerEntry> {
        match self.heap.peek() {
            Some(e) if e.deadline <= now => self.heap.pop(),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Keep only the entries `f` accepts
    pub fn retain(&mut self, f: impl FnMut(&TimerEntry) -> bool) {
        self.heap.retain(f);
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}
