//! Dock: condition wait for contexts
//!
//! Waiters queue on an intrusive list and re-check their predicate after
//! every wake. The predicate is checked first, so a satisfied predicate
//! never suspends. A waiter that was dequeued by `notify_one` and then
//! leaves with an error passes the wake to the next waiter.

use crate::context::Ctx;
use crate::list::List;
use crate::sched;
use crate::this_ctx;
use gctx_core::CtxResult;
use std::ptr::NonNull;
use std::time::{Duration, Instant};

/// Queueing options for a waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DockOpts(u8);

impl DockOpts {
    /// FIFO
    pub const NONE: DockOpts = DockOpts(0);
    /// Queue at the front
    pub const LIFO: DockOpts = DockOpts(1);
    /// Queue by context nice value, FIFO among equals
    pub const SORT: DockOpts = DockOpts(2);

    #[inline]
    pub const fn contains(self, other: DockOpts) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl std::ops::BitOr for DockOpts {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        DockOpts(self.0 | rhs.0)
    }
}

#[derive(Default)]
pub struct Dock {
    q: List,
}

#[inline]
fn ctx<'a>(p: NonNull<Ctx>) -> &'a Ctx {
    // Safety: queued waiters are alive until they dequeue themselves
    unsafe { &*p.as_ptr() }
}

impl Dock {
    pub const fn new() -> Self {
        Self { q: List::new() }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.q.size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    fn push(&self, c: &Ctx, opts: DockOpts) {
        if opts.contains(DockOpts::SORT) {
            self.q.push_sort(c, |a, b| a.nice.get() < b.nice.get());
        } else if opts.contains(DockOpts::LIFO) {
            self.q.push_front(c);
        } else {
            self.q.push_back(c);
        }
    }

    /// Leave the queue after a wake; forwards a consumed single wake when
    /// the waiter is giving up
    fn leave(&self, c: &Ctx, giving_up: bool) {
        let dequeued = !self.q.remove(c);
        if giving_up && dequeued {
            self.notify_one();
        }
    }

    /// Wait until `pred` holds (interruption point)
    pub fn wait(&self, pred: impl FnMut() -> bool) -> CtxResult<()> {
        self.wait_opts(DockOpts::NONE, pred)
    }

    pub fn wait_opts(&self, opts: DockOpts, mut pred: impl FnMut() -> bool) -> CtxResult<()> {
        if pred() {
            return Ok(());
        }
        let c = sched::require_current()?;
        loop {
            self.push(c, opts);
            let woke = this_ctx::wait();
            self.leave(c, woke.is_err());
            woke?;
            if pred() {
                return Ok(());
            }
        }
    }

    /// Wait until `pred` holds or `deadline` passes; returns `pred()`
    pub fn wait_until(&self, deadline: Instant, pred: impl FnMut() -> bool) -> CtxResult<bool> {
        self.wait_until_opts(DockOpts::NONE, deadline, pred)
    }

    pub fn wait_until_opts(
        &self,
        opts: DockOpts,
        deadline: Instant,
        mut pred: impl FnMut() -> bool,
    ) -> CtxResult<bool> {
        if pred() {
            return Ok(true);
        }
        let c = sched::require_current()?;
        loop {
            self.push(c, opts);
            let woke = this_ctx::wait_until(deadline);
            match woke {
                Err(e) => {
                    self.leave(c, true);
                    return Err(e);
                }
                Ok(timed_out) => {
                    let ok = pred();
                    self.leave(c, timed_out && !ok);
                    if ok {
                        return Ok(true);
                    }
                    if timed_out {
                        return Ok(false);
                    }
                }
            }
        }
    }

    pub fn wait_for(&self, timeout: Duration, pred: impl FnMut() -> bool) -> CtxResult<bool> {
        self.wait_until(Instant::now() + timeout, pred)
    }

    /// Wake the front waiter
    pub fn notify_one(&self) {
        if let Some(p) = self.q.pop_front() {
            sched::notify(ctx(p));
        }
    }

    /// Wake every waiter
    pub fn notify_all(&self) {
        while let Some(p) = self.q.pop_front() {
            sched::notify(ctx(p));
        }
    }

    /// Wake a specific context, removing it from this dock if queued
    pub fn notify(&self, c: &Ctx) {
        self.q.remove(c);
        sched::notify(c);
    }

    /// Interrupt every waiter; they dequeue themselves
    pub fn interrupt_all(&self) {
        self.q.for_each(sched::interrupt);
    }

    /// Terminate every waiter; they dequeue themselves
    pub fn terminate_all(&self) {
        self.q.for_each(sched::terminate);
    }
}

impl std::fmt::Debug for Dock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dock").field("waiting", &self.size()).finish()
    }
}
