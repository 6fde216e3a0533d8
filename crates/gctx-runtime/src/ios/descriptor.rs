//! Handler descriptors
//!
//! A descriptor tags a family of submitted handlers and accumulates their
//! statistics. Descriptors are long-lived (normally `static`) and join the
//! process-wide registry the first time a handler is submitted with them.

use gctx_core::SpinLock;
use std::fmt::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub const HISTORY_SIZE: usize = 256;

static REGISTRY: SpinLock<Vec<&'static Descriptor>> = SpinLock::new(Vec::new());

/// Every descriptor that has had a handler submitted
pub fn descriptors() -> Vec<&'static Descriptor> {
    REGISTRY.lock().clone()
}

struct History {
    pos: usize,
    ring: [(u64, u64); HISTORY_SIZE],
}

pub struct Descriptor {
    name: &'static str,
    continuation: bool,
    retain_faults: bool,
    registered: AtomicBool,

    queued: AtomicU64,
    calls: AtomicU64,
    faults: AtomicU64,
    allocs: AtomicU64,
    alloc_bytes: AtomicU64,
    frees: AtomicU64,
    free_bytes: AtomicU64,
    slice_last: AtomicU64,
    slice_total: AtomicU64,
    latency_last: AtomicU64,
    latency_total: AtomicU64,

    history: SpinLock<History>,
}

/// Point-in-time copy of a descriptor's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub queued: u64,
    pub calls: u64,
    pub faults: u64,
    pub allocs: u64,
    pub alloc_bytes: u64,
    pub frees: u64,
    pub free_bytes: u64,
    /// Cycles of the last invocation
    pub slice_last: u64,
    pub slice_total: u64,
    /// Cycles from submission to invocation, last and total
    pub latency_last: u64,
    pub latency_total: u64,
}

impl Descriptor {
    pub const fn new(name: &'static str) -> Self {
        Self::with_options(name, false, false)
    }

    /// `continuation` marks handlers that resume contexts; `retain_faults`
    /// skips the leave accounting of a faulting handler
    pub const fn with_options(name: &'static str, continuation: bool, retain_faults: bool) -> Self {
        Self {
            name,
            continuation,
            retain_faults,
            registered: AtomicBool::new(false),
            queued: AtomicU64::new(0),
            calls: AtomicU64::new(0),
            faults: AtomicU64::new(0),
            allocs: AtomicU64::new(0),
            alloc_bytes: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            free_bytes: AtomicU64::new(0),
            slice_last: AtomicU64::new(0),
            slice_total: AtomicU64::new(0),
            latency_last: AtomicU64::new(0),
            latency_total: AtomicU64::new(0),
            history: SpinLock::new(History { pos: 0, ring: [(0, 0); HISTORY_SIZE] }),
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn is_continuation(&self) -> bool {
        self.continuation
    }

    #[inline]
    pub fn retains_faults(&self) -> bool {
        self.retain_faults
    }

    pub(crate) fn register(&'static self) {
        if !self.registered.swap(true, Ordering::AcqRel) {
            REGISTRY.lock().push(self);
        }
    }

    pub(crate) fn on_submit(&self, bytes: usize) {
        self.queued.fetch_add(1, Ordering::Relaxed);
        self.on_alloc(bytes);
    }

    pub(crate) fn on_alloc(&self, bytes: usize) {
        self.allocs.fetch_add(1, Ordering::Relaxed);
        self.alloc_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_free(&self, bytes: usize) {
        self.frees.fetch_add(1, Ordering::Relaxed);
        self.free_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// A queued handler left without running
    pub(crate) fn on_cancel(&self) {
        self.queued.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn on_enter(&self, latency: Option<u64>) {
        if let Some(latency) = latency {
            self.queued.fetch_sub(1, Ordering::Relaxed);
            self.latency_last.store(latency, Ordering::Relaxed);
            self.latency_total.fetch_add(latency, Ordering::Relaxed);
        }
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_leave(&self, slice: u64) {
        self.slice_last.store(slice, Ordering::Relaxed);
        self.slice_total.fetch_add(slice, Ordering::Relaxed);
    }

    pub(crate) fn on_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record(&self, epoch: u64, slice: u64) {
        let mut h = self.history.lock();
        let pos = h.pos;
        h.ring[pos % HISTORY_SIZE] = (epoch, slice);
        h.pos = pos + 1;
    }

    /// Recorded `(handler epoch, slice cycles)`, oldest first
    pub fn history(&self) -> Vec<(u64, u64)> {
        let h = self.history.lock();
        let n = h.pos.min(HISTORY_SIZE);
        (h.pos - n..h.pos).map(|i| h.ring[i % HISTORY_SIZE]).collect()
    }

    pub fn stats(&self) -> StatsSnapshot {
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        StatsSnapshot {
            queued: load(&self.queued),
            calls: load(&self.calls),
            faults: load(&self.faults),
            allocs: load(&self.allocs),
            alloc_bytes: load(&self.alloc_bytes),
            frees: load(&self.frees),
            free_bytes: load(&self.free_bytes),
            slice_last: load(&self.slice_last),
            slice_total: load(&self.slice_total),
            latency_last: load(&self.latency_last),
            latency_total: load(&self.latency_total),
        }
    }

    /// Nothing queued and every allocation freed
    pub fn is_balanced(&self) -> bool {
        let s = self.stats();
        s.queued == 0 && s.allocs == s.frees && s.alloc_bytes == s.free_bytes
    }

    /// Render the counters into `buf`, truncating if it is too small
    pub fn write_stats<'b>(&self, buf: &'b mut [u8]) -> &'b str {
        let mut w = SpanWriter { buf, len: 0 };
        let _ = write!(w, "{}", self);
        let SpanWriter { buf, len } = w;
        std::str::from_utf8(&buf[..len]).unwrap_or("")
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.stats();
        write!(
            f,
            "{}{} queued:{} calls:{} faults:{} allocs:{}/{}B frees:{}/{}B slice:{}/{} latency:{}/{}",
            self.name,
            if self.continuation { " (cont)" } else { "" },
            s.queued,
            s.calls,
            s.faults,
            s.allocs,
            s.alloc_bytes,
            s.frees,
            s.free_bytes,
            s.slice_last,
            s.slice_total,
            s.latency_last,
            s.latency_total,
        )
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Drop for Descriptor {
    fn drop(&mut self) {
        debug_assert!(
            std::thread::panicking() || self.is_balanced(),
            "descriptor '{}' dropped unbalanced: {:?}",
            self.name,
            self.stats()
        );
    }
}

/// `fmt::Write` into a fixed span, dropping what does not fit
struct SpanWriter<'b> {
    buf: &'b mut [u8],
    len: usize,
}

impl Write for SpanWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len() - self.len;
        let mut n = s.len().min(room);
        while !s.is_char_boundary(n) {
            n -= 1;
        }
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        if n < s.len() {
            return Err(fmt::Error);
        }
        Ok(())
    }
}
