//! Suspension and resumption protocol
//!
//! Only the reactor stack switches into a context (`Inner::switch_in`), and
//! a context only ever switches back to the reactor stack (`suspend`). A
//! context that wants to block records why in its state first:
//!
//! - `Waiting`: parked on a primitive or timer; `wake` makes it `Queued`
//!   and posts exactly one resume handle.
//! - `Queued`: a resume handle is already in flight (yield, eager spawn).
//!
//! Each `Queued` period has exactly one resume handle, so a handle never
//! outlives the context it names.

use crate::context::Ctx;
use crate::ios::{Descriptor, Handle};
use crate::tls;
use gctx_core::{kwarn, CtxError, CtxFlags, CtxResult, CtxState};
use std::ptr::NonNull;
use std::time::Instant;

pub(crate) static RESUME: Descriptor = Descriptor::with_options("ctx.resume", true, false);
pub(crate) static SPAWN: Descriptor = Descriptor::with_options("ctx.spawn", true, false);

/// The running context
///
/// A context cannot be freed while its own code runs, so the reference is
/// valid for the duration of any call made from that code.
#[inline]
pub(crate) fn current<'a>() -> Option<&'a Ctx> {
    tls::current_ctx().map(|p| unsafe { &*p.as_ptr() })
}

#[inline]
pub(crate) fn require_current<'a>() -> CtxResult<&'a Ctx> {
    current().ok_or(CtxError::NotInContext)
}

/// Suspension is refused while this thread unwinds a panic
#[inline]
pub(crate) fn check_switch() -> CtxResult<()> {
    if std::thread::panicking() {
        return Err(CtxError::SwitchDuringUnwind);
    }
    Ok(())
}

/// Checks made before a context records why it suspends
#[inline]
pub(crate) fn may_suspend(c: &Ctx) -> CtxResult<()> {
    check_switch()?;
    debug_assert!(
        c.critical.get() == 0,
        "context '{}' {} suspended inside a critical assertion",
        c.name,
        c.id
    );
    Ok(())
}

pub(crate) fn resume_handle(ptr: NonNull<Ctx>) -> Handle {
    Handle::new(&RESUME, move || resume(ptr))
}

/// Switch into a queued context from the reactor stack
pub(crate) fn resume(ptr: NonNull<Ctx>) {
    // Safety: a queued context is alive until it has run to completion
    let inner = unsafe { ptr.as_ref() }.reactor.clone();
    inner.switch_in(ptr);
}

/// Return to the reactor stack; returns when resumed
pub(crate) fn suspend(c: &Ctx) {
    debug_assert_eq!(tls::current_ctx(), Some(c.ptr()));

    if c.reactor.config.stack_profiling {
        let marker = 0u8;
        let at = c.stack.sample(&marker as *const u8 as usize);
        check_stack(c, at);
    }

    // Safety: the reactor stack is suspended in switch_in and its register
    // file stays valid until this context switches back
    unsafe { crate::arch::switch_context(c.regs.get(), c.reactor.main_regs()) };
}

/// Stack watchdog, run on the sample taken at each suspension
fn check_stack(c: &Ctx, at: usize) {
    let percent = c.stack.usage_percent();
    if percent < c.reactor.config.stack_warn_percent || c.flags.get().contains(CtxFlags::STACK_EXEMPT) {
        return;
    }
    c.reactor.warned();
    kwarn!(
        "context '{}' {} stack usage {}% ({} of {} bytes)",
        c.name,
        c.id,
        percent,
        at,
        c.stack.max()
    );
}

/// Park until woken
pub(crate) fn park(c: &Ctx) -> CtxResult<()> {
    may_suspend(c)?;
    c.state.set(CtxState::Waiting);
    suspend(c);
    Ok(())
}

/// Park until woken or `deadline`; returns true when the deadline fired
pub(crate) fn park_until(c: &Ctx, deadline: Instant) -> CtxResult<bool> {
    may_suspend(c)?;
    if deadline <= Instant::now() {
        return Ok(true);
    }
    c.timed_out.set(false);
    c.reactor.arm_timer(deadline, c.id, c.epoch.get());
    c.state.set(CtxState::Waiting);
    suspend(c);
    Ok(c.timed_out.replace(false))
}

/// Requeue behind everything already queued
pub(crate) fn yield_queued(c: &Ctx) -> CtxResult<()> {
    may_suspend(c)?;
    c.state.set(CtxState::Queued);
    c.reactor.enqueue(resume_handle(c.ptr()));
    suspend(c);
    Ok(())
}

/// Make a waiting context runnable; false if it was not waiting
pub(crate) fn wake(c: &Ctx) -> bool {
    if c.state.get() != CtxState::Waiting {
        return false;
    }
    c.state.set(CtxState::Queued);
    c.reactor.enqueue(resume_handle(c.ptr()));
    true
}

/// Wake, or leave a note if the context is not waiting
pub(crate) fn notify(c: &Ctx) {
    if c.state.get().is_finished() {
        return;
    }
    if !wake(c) {
        c.notes.set(c.notes.get() + 1);
    }
}

/// Consume one pending note
#[inline]
pub(crate) fn take_note(c: &Ctx) -> bool {
    let n = c.notes.get();
    if n == 0 {
        return false;
    }
    c.notes.set(n - 1);
    true
}

fn signal(c: &Ctx, flag: CtxFlags) {
    if c.state.get().is_finished() {
        return;
    }
    c.set_flag(flag);
    if !c.flags.get().contains(CtxFlags::NOINTERRUPT) {
        wake(c);
    }
}

pub(crate) fn interrupt(c: &Ctx) {
    signal(c, CtxFlags::INTERRUPTED);
}

pub(crate) fn terminate(c: &Ctx) {
    signal(c, CtxFlags::TERMINATED);
}

/// Deliver a pending signal
///
/// TERMINATED stays set; INTERRUPTED is consumed. Nothing is delivered
/// while NOINTERRUPT is set.
pub(crate) fn interruption_point(c: &Ctx) -> CtxResult<()> {
    let flags = c.flags.get();
    if flags.contains(CtxFlags::NOINTERRUPT) {
        return Ok(());
    }
    if flags.contains(CtxFlags::TERMINATED) {
        return Err(CtxError::Terminated);
    }
    if flags.contains(CtxFlags::INTERRUPTED) {
        c.clear_flag(CtxFlags::INTERRUPTED);
        return Err(CtxError::Interrupted);
    }
    Ok(())
}

#[inline]
pub(crate) fn interruption_pending(c: &Ctx) -> bool {
    c.flags.get().intersects(CtxFlags::INTERRUPTED | CtxFlags::TERMINATED)
}
