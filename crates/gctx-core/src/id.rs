//! Context identifier type

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Diagnostic identifier for a context
///
/// Ids are assigned from a process-wide counter and never reused. The
/// value 0 is reserved as a sentinel for "no context".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CtxId(u64);

impl CtxId {
    /// Sentinel value indicating no context
    pub const NONE: CtxId = CtxId(0);

    /// Allocate the next unused id
    #[inline]
    pub fn next() -> Self {
        CtxId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create an id from a raw value
    #[inline]
    pub const fn new(id: u64) -> Self {
        CtxId(id)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if this is the NONE sentinel
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Convert to Option
    #[inline]
    pub const fn to_option(self) -> Option<CtxId> {
        if self.is_none() {
            None
        } else {
            Some(self)
        }
    }
}

impl From<CtxId> for u64 {
    #[inline]
    fn from(id: CtxId) -> Self {
        id.0
    }
}

impl fmt::Debug for CtxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "CtxId(NONE)")
        } else {
            write!(f, "CtxId({})", self.0)
        }
    }
}

impl fmt::Display for CtxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Default for CtxId {
    fn default() -> Self {
        CtxId::NONE
    }
}
