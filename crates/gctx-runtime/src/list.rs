//! Intrusive context list
//!
//! Doubly linked through the `prev`/`next` fields of the control blocks; no
//! node allocation. A context's `member` tag names the list holding it and
//! every operation asserts it, so a context is never in two lists at once.
//!
//! The list's identity is its own address, so a list must not move while
//! it has members. Every owner keeps it behind `&self` for as long as a
//! waiter is linked.

use crate::context::Ctx;
use gctx_core::Membership;
use std::cell::Cell;
use std::ptr::NonNull;

pub struct List {
    head: Cell<Option<NonNull<Ctx>>>,
    tail: Cell<Option<NonNull<Ctx>>>,
}

impl Default for List {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn ctx<'a>(p: NonNull<Ctx>) -> &'a Ctx {
    // Safety: linked contexts are alive; they unlink before finishing
    unsafe { &*p.as_ptr() }
}

impl List {
    pub const fn new() -> Self {
        Self {
            head: Cell::new(None),
            tail: Cell::new(None),
        }
    }

    #[inline]
    fn tag(&self) -> Membership {
        Membership::List(self as *const List as usize)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.get().is_none()
    }

    /// O(n)
    pub fn size(&self) -> usize {
        let mut n = 0;
        self.for_each(|_| n += 1);
        n
    }

    #[inline]
    pub fn front(&self) -> Option<NonNull<Ctx>> {
        self.head.get()
    }

    #[inline]
    pub fn back(&self) -> Option<NonNull<Ctx>> {
        self.tail.get()
    }

    #[inline]
    pub fn contains(&self, c: &Ctx) -> bool {
        c.member.get() == self.tag()
    }

    fn link(&self, c: &Ctx, prev: Option<NonNull<Ctx>>, next: Option<NonNull<Ctx>>) {
        assert!(
            c.member.get().is_none(),
            "context '{}' {} already in a list: {:?}",
            c.name,
            c.id,
            c.member.get()
        );
        let p = c.ptr();
        c.prev.set(prev);
        c.next.set(next);
        c.member.set(self.tag());
        match prev {
            Some(prev) => ctx(prev).next.set(Some(p)),
            None => self.head.set(Some(p)),
        }
        match next {
            Some(next) => ctx(next).prev.set(Some(p)),
            None => self.tail.set(Some(p)),
        }
    }

    fn unlink(&self, c: &Ctx) {
        debug_assert!(self.contains(c));
        let (prev, next) = (c.prev.take(), c.next.take());
        match prev {
            Some(prev) => ctx(prev).next.set(next),
            None => self.head.set(next),
        }
        match next {
            Some(next) => ctx(next).prev.set(prev),
            None => self.tail.set(prev),
        }
        c.member.set(Membership::None);
    }

    pub fn push_front(&self, c: &Ctx) {
        self.link(c, None, self.head.get());
    }

    pub fn push_back(&self, c: &Ctx) {
        self.link(c, self.tail.get(), None);
    }

    /// Insert `c` immediately before `anchor`
    pub fn push_before(&self, anchor: &Ctx, c: &Ctx) {
        assert!(self.contains(anchor), "anchor not in this list");
        self.link(c, anchor.prev.get(), Some(anchor.ptr()));
    }

    /// Insert `c` immediately after `anchor`
    pub fn push_after(&self, anchor: &Ctx, c: &Ctx) {
        assert!(self.contains(anchor), "anchor not in this list");
        self.link(c, Some(anchor.ptr()), anchor.next.get());
    }

    /// Insert before the first element `c` orders before; stable
    pub fn push_sort(&self, c: &Ctx, mut less: impl FnMut(&Ctx, &Ctx) -> bool) {
        let mut cur = self.head.get();
        while let Some(p) = cur {
            let other = ctx(p);
            if less(c, other) {
                self.push_before(other, c);
                return;
            }
            cur = other.next.get();
        }
        self.push_back(c);
    }

    pub fn pop_front(&self) -> Option<NonNull<Ctx>> {
        let p = self.head.get()?;
        self.unlink(ctx(p));
        Some(p)
    }

    pub fn pop_back(&self) -> Option<NonNull<Ctx>> {
        let p = self.tail.get()?;
        self.unlink(ctx(p));
        Some(p)
    }

    /// Remove `c`; false if it is not a member of this list
    pub fn remove(&self, c: &Ctx) -> bool {
        if !self.contains(c) {
            return false;
        }
        self.unlink(c);
        true
    }

    /// Visit front to back
    ///
    /// The closure may not modify this list.
    pub fn for_each(&self, mut f: impl FnMut(&Ctx)) {
        let mut cur = self.head.get();
        while let Some(p) = cur {
            let c = ctx(p);
            cur = c.next.get();
            f(c);
        }
    }

    /// Visit back to front
    pub fn rfor_each(&self, mut f: impl FnMut(&Ctx)) {
        let mut cur = self.tail.get();
        while let Some(p) = cur {
            let c = ctx(p);
            cur = c.prev.get();
            f(c);
        }
    }

    /// Visit front to back while `f` returns true; false if stopped early
    pub fn for_each_until(&self, mut f: impl FnMut(&Ctx) -> bool) -> bool {
        let mut cur = self.head.get();
        while let Some(p) = cur {
            let c = ctx(p);
            cur = c.next.get();
            if !f(c) {
                return false;
            }
        }
        true
    }
}

impl Drop for List {
    fn drop(&mut self) {
        debug_assert!(
            std::thread::panicking() || self.is_empty(),
            "list dropped with {} linked contexts",
            self.size()
        );
    }
}
