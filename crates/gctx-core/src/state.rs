//! Context flags, lifecycle state and queue membership

use core::fmt;
use core::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Context flag bitset
///
/// The low byte selects spawn and lifetime behavior; the two high bits are
/// indicators set by `interrupt()` and `terminate()`.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
pub struct CtxFlags(u32);

impl CtxFlags {
    pub const NONE: CtxFlags = CtxFlags(0);
    /// Defers spawn with a post
    pub const POST: CtxFlags = CtxFlags(0x0001);
    /// Defers spawn with a dispatch
    pub const DISPATCH: CtxFlags = CtxFlags(0x0002);
    /// Defers spawn with a defer
    pub const DEFER: CtxFlags = CtxFlags(0x0004);
    /// Context frees itself when finished
    pub const DETACH: CtxFlags = CtxFlags(0x0008);
    /// Interruption points won't deliver while lit
    pub const NOINTERRUPT: CtxFlags = CtxFlags(0x0010);
    /// The slice watchdog ignores long execution slices
    pub const SLICE_EXEMPT: CtxFlags = CtxFlags(0x0020);
    /// The stack watchdog ignores high stack usage
    pub const STACK_EXEMPT: CtxFlags = CtxFlags(0x0040);
    /// Destruction of the handle joins without interrupting
    pub const WAIT_JOIN: CtxFlags = CtxFlags(0x0080);
    /// (indicator) interruption pending
    pub const INTERRUPTED: CtxFlags = CtxFlags(0x4000);
    /// (indicator) termination requested
    pub const TERMINATED: CtxFlags = CtxFlags(0x8000);

    /// Flags that select a deferred first resumption
    pub const SPAWN_MASK: CtxFlags = CtxFlags(0x0007);

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        CtxFlags(bits)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: CtxFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn intersects(self, other: CtxFlags) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn with(self, other: CtxFlags) -> Self {
        CtxFlags(self.0 | other.0)
    }

    #[inline]
    pub const fn without(self, other: CtxFlags) -> Self {
        CtxFlags(self.0 & !other.0)
    }
}

impl BitOr for CtxFlags {
    type Output = CtxFlags;
    #[inline]
    fn bitor(self, rhs: CtxFlags) -> CtxFlags {
        CtxFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for CtxFlags {
    #[inline]
    fn bitor_assign(&mut self, rhs: CtxFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for CtxFlags {
    type Output = CtxFlags;
    #[inline]
    fn bitand(self, rhs: CtxFlags) -> CtxFlags {
        CtxFlags(self.0 & rhs.0)
    }
}

impl Not for CtxFlags {
    type Output = CtxFlags;
    #[inline]
    fn not(self) -> CtxFlags {
        CtxFlags(!self.0)
    }
}

impl fmt::Debug for CtxFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(CtxFlags, &str); 10] = [
            (CtxFlags::POST, "POST"),
            (CtxFlags::DISPATCH, "DISPATCH"),
            (CtxFlags::DEFER, "DEFER"),
            (CtxFlags::DETACH, "DETACH"),
            (CtxFlags::NOINTERRUPT, "NOINTERRUPT"),
            (CtxFlags::SLICE_EXEMPT, "SLICE_EXEMPT"),
            (CtxFlags::STACK_EXEMPT, "STACK_EXEMPT"),
            (CtxFlags::WAIT_JOIN, "WAIT_JOIN"),
            (CtxFlags::INTERRUPTED, "INTERRUPTED"),
            (CtxFlags::TERMINATED, "TERMINATED"),
        ];

        if self.is_empty() {
            return write!(f, "CtxFlags(NONE)");
        }
        write!(f, "CtxFlags(")?;
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, " | ")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        write!(f, ")")
    }
}

/// State of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CtxState {
    /// Constructed, never resumed
    Created = 0,

    /// Resumption submitted to the reactor
    Queued = 1,

    /// Currently executing on its reactor thread
    Running = 2,

    /// Parked on a primitive's wait-queue or a timer
    Waiting = 3,

    /// Entry function returned; stack no longer executing
    Terminated = 4,
}

impl CtxState {
    #[inline]
    pub const fn is_finished(&self) -> bool {
        matches!(self, CtxState::Terminated)
    }

    /// Check if a resumption may be submitted for this state
    #[inline]
    pub const fn is_resumable(&self) -> bool {
        matches!(self, CtxState::Created | CtxState::Waiting)
    }
}

impl fmt::Display for CtxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CtxState::Created => "created",
            CtxState::Queued => "queued",
            CtxState::Running => "running",
            CtxState::Waiting => "waiting",
            CtxState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Which wait-queue currently owns a context's link fields
///
/// A context is linked into at most one queue. The queue is identified by
/// the address of its list head, which cannot move while it has members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Membership {
    #[default]
    None,
    List(usize),
}

impl Membership {
    #[inline]
    pub const fn is_none(&self) -> bool {
        matches!(self, Membership::None)
    }
}
