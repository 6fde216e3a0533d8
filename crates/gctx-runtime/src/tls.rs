//! Thread-local runtime state
//!
//! Provides fast access to the installed reactor, the running context and
//! the running handler of this OS thread.

use crate::context::Ctx;
use crate::ios::Descriptor;
use crate::reactor::Inner;
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::rc::Rc;

thread_local! {
    /// Reactor installed on this OS thread
    static REACTOR: RefCell<Option<Rc<Inner>>> = const { RefCell::new(None) };

    /// Context currently executing on this OS thread
    static CURRENT_CTX: Cell<Option<NonNull<Ctx>>> = const { Cell::new(None) };

    /// Descriptor of the handler currently executing
    static CURRENT_HANDLER: Cell<Option<&'static Descriptor>> = const { Cell::new(None) };

    /// Count of handler entries on this thread
    static HANDLER_EPOCH: Cell<u64> = const { Cell::new(0) };
}

/// Install `inner` as this thread's reactor; fails if one is installed
pub(crate) fn install_reactor(inner: Rc<Inner>) -> bool {
    REACTOR.with(|r| {
        let mut slot = r.borrow_mut();
        if slot.is_some() {
            return false;
        }
        *slot = Some(inner);
        true
    })
}

pub(crate) fn uninstall_reactor() -> Option<Rc<Inner>> {
    REACTOR.try_with(|r| r.borrow_mut().take()).ok().flatten()
}

/// This thread's reactor, if installed
#[inline]
pub(crate) fn reactor() -> Option<Rc<Inner>> {
    REACTOR.try_with(|r| r.borrow().clone()).ok().flatten()
}

#[inline]
pub fn has_reactor() -> bool {
    REACTOR.try_with(|r| r.borrow().is_some()).unwrap_or(false)
}

#[inline]
pub(crate) fn set_current_ctx(ctx: Option<NonNull<Ctx>>) {
    CURRENT_CTX.with(|c| c.set(ctx));
}

#[inline]
pub(crate) fn current_ctx() -> Option<NonNull<Ctx>> {
    CURRENT_CTX.try_with(|c| c.get()).ok().flatten()
}

/// Check if we're running inside a context
#[inline]
pub fn in_context() -> bool {
    current_ctx().is_some()
}

/// Swap the current handler, returning the previous one
#[inline]
pub(crate) fn replace_handler(desc: Option<&'static Descriptor>) -> Option<&'static Descriptor> {
    CURRENT_HANDLER.with(|c| c.replace(desc))
}

#[inline]
pub fn current_handler() -> Option<&'static Descriptor> {
    CURRENT_HANDLER.try_with(|c| c.get()).ok().flatten()
}

#[inline]
pub(crate) fn bump_handler_epoch() -> u64 {
    HANDLER_EPOCH.with(|e| {
        let v = e.get() + 1;
        e.set(v);
        v
    })
}

/// Handler entries on this thread so far
#[inline]
pub fn handler_epoch() -> u64 {
    HANDLER_EPOCH.with(|e| e.get())
}
