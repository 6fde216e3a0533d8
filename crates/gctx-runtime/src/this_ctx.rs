//! Operations on the currently running context
//!
//! Every blocking call here is an interruption point and fails with
//! `NotInContext` when called from the reactor stack.

use crate::sched;
use gctx_core::{CtxError, CtxFlags, CtxId, CtxResult};
use std::time::{Duration, Instant};

/// Id of the running context, `CtxId::NONE` outside any context
pub fn id() -> CtxId {
    sched::current().map_or(CtxId::NONE, |c| c.id)
}

pub fn name() -> Option<String> {
    sched::current().map(|c| c.name.clone())
}

pub fn nice() -> i8 {
    sched::current().map_or(0, |c| c.nice.get())
}

/// Change the running context's queueing priority for SORT docks
pub fn set_nice(nice: i8) -> CtxResult<()> {
    sched::require_current()?.nice.set(nice);
    Ok(())
}

/// Switches into the running context so far
pub fn epoch() -> u64 {
    sched::current().map_or(0, |c| c.epoch.get())
}

pub fn flags() -> CtxFlags {
    sched::current().map_or(CtxFlags::NONE, |c| c.flags.get())
}

/// Deliver a pending interruption or termination
pub fn interruption_point() -> CtxResult<()> {
    sched::interruption_point(sched::require_current()?)
}

/// True when a signal is pending (delivered or not)
pub fn interruption_requested() -> bool {
    sched::current().is_some_and(sched::interruption_pending)
}

/// Whether the running code may suspend right now
pub fn may_switch() -> bool {
    sched::current().is_some() && sched::check_switch().is_ok()
}

/// Bytes of stack in use at the caller's frame; 0 outside a context
pub fn stack_at_here() -> usize {
    let Some(c) = sched::current() else {
        return 0;
    };
    let marker = 0u8;
    c.stack.offset_of(&marker as *const u8 as usize)
}

/// Requeue behind everything already queued
pub fn yield_now() -> CtxResult<()> {
    let c = sched::require_current()?;
    sched::interruption_point(c)?;
    sched::yield_queued(c)?;
    sched::interruption_point(c)
}

/// Suspend until notified
///
/// Returns at once when a note is pending.
pub fn wait() -> CtxResult<()> {
    let c = sched::require_current()?;
    sched::interruption_point(c)?;
    if !sched::take_note(c) {
        sched::park(c)?;
    }
    sched::interruption_point(c)
}

/// Suspend until notified or `deadline`; true when the deadline passed
pub fn wait_until(deadline: Instant) -> CtxResult<bool> {
    let c = sched::require_current()?;
    sched::interruption_point(c)?;
    if sched::take_note(c) {
        return Ok(false);
    }
    let timed_out = sched::park_until(c, deadline)?;
    sched::interruption_point(c)?;
    Ok(timed_out)
}

/// Like `wait_until`, failing with `Timeout` when the deadline passed
pub fn wait_deadline(deadline: Instant) -> CtxResult<()> {
    if wait_until(deadline)? {
        return Err(CtxError::Timeout);
    }
    Ok(())
}

/// Suspend until notified or `timeout`; returns the time left
pub fn wait_for(timeout: Duration) -> CtxResult<Duration> {
    let deadline = Instant::now() + timeout;
    if wait_until(deadline)? {
        return Ok(Duration::ZERO);
    }
    Ok(deadline.saturating_duration_since(Instant::now()))
}

/// Suspend until `deadline`; notifications do not end the sleep
pub fn sleep_until(deadline: Instant) -> CtxResult<()> {
    while !wait_until(deadline)? {}
    Ok(())
}

pub fn sleep(d: Duration) -> CtxResult<()> {
    sleep_until(Instant::now() + d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::reactor::Reactor;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[test]
    fn test_outside_context() {
        assert_eq!(id(), CtxId::NONE);
        assert_eq!(name(), None);
        assert_eq!(stack_at_here(), 0);
        assert!(!may_switch());
        assert_eq!(wait(), Err(CtxError::NotInContext));
        assert_eq!(yield_now(), Err(CtxError::NotInContext));
        assert_eq!(sleep(Duration::from_millis(1)), Err(CtxError::NotInContext));
    }

    #[test]
    fn test_identity_inside() {
        let reactor = Reactor::new().unwrap();
        let seen = Rc::new(RefCell::new(None));
        let s = seen.clone();
        let ctx = Context::new("me", move || {
            *s.borrow_mut() = Some((id(), name(), may_switch(), epoch()));
        })
        .unwrap();
        let (cid, cname, may, ep) = seen.borrow_mut().take().unwrap();
        assert_eq!(cid, ctx.id());
        assert_eq!(cname.as_deref(), Some("me"));
        assert!(may);
        assert_eq!(ep, 1);
        drop(reactor);
    }

    #[test]
    fn test_pending_note_skips_wait() {
        let reactor = Reactor::new().unwrap();
        let rounds = Rc::new(Cell::new(0));
        let r = rounds.clone();
        let ctx = Context::new("noted", move || -> CtxResult<()> {
            // the parent notifies while this context is queued
            yield_now()?;
            wait()?;
            r.set(1);
            Ok(())
        })
        .unwrap();
        crate::sched::notify(unsafe { ctx.as_ptr().unwrap().as_ref() });
        reactor.run();
        assert_eq!(rounds.get(), 1);
    }

    #[test]
    fn test_double_interrupt_delivers_once() {
        let reactor = Reactor::new().unwrap();
        let results = Rc::new(RefCell::new(Vec::new()));
        let r = results.clone();
        let ctx = Context::new("sig", move || {
            r.borrow_mut().push(wait());
            r.borrow_mut().push(interruption_point());
        })
        .unwrap();
        ctx.interrupt();
        ctx.interrupt();
        reactor.run();
        assert_eq!(*results.borrow(), vec![Err(CtxError::Interrupted), Ok(())]);
    }

    #[test]
    fn test_terminate_is_sticky() {
        let reactor = Reactor::new().unwrap();
        let results = Rc::new(RefCell::new(Vec::new()));
        let r = results.clone();
        let ctx = Context::new("term", move || {
            r.borrow_mut().push(wait());
            r.borrow_mut().push(interruption_point());
            r.borrow_mut().push(yield_now());
        })
        .unwrap();
        ctx.terminate();
        reactor.run();
        assert_eq!(
            *results.borrow(),
            vec![Err(CtxError::Terminated), Err(CtxError::Terminated), Err(CtxError::Terminated)]
        );
    }

    #[test]
    fn test_timed_waits() {
        let reactor = Reactor::new().unwrap();
        let out = Rc::new(RefCell::new(Vec::new()));
        let o = out.clone();
        let _ctx = Context::new("timed", move || -> CtxResult<()> {
            let left = wait_for(Duration::from_millis(5))?;
            o.borrow_mut().push(left == Duration::ZERO);
            let r = wait_deadline(Instant::now() + Duration::from_millis(5));
            o.borrow_mut().push(r == Err(CtxError::Timeout));
            // an already-passed deadline never suspends
            o.borrow_mut().push(wait_until(Instant::now() - Duration::from_millis(1))?);
            Ok(())
        })
        .unwrap();
        reactor.run();
        assert_eq!(*out.borrow(), vec![true, true, true]);
    }

    #[test]
    fn test_sleep_ignores_notes() {
        let reactor = Reactor::new().unwrap();
        let start = Instant::now();
        let ctx = Context::new("sleeper", || sleep(Duration::from_millis(20))).unwrap();
        crate::sched::notify(unsafe { ctx.as_ptr().unwrap().as_ref() });
        reactor.run();
        assert!(ctx.joined());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_yield_interleaves() {
        let reactor = Reactor::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));
        let spawn = |tag: &'static str| {
            let o = order.clone();
            Context::builder()
                .flags(CtxFlags::POST)
                .spawn(move || -> CtxResult<()> {
                    for i in 0..2 {
                        o.borrow_mut().push((tag, i));
                        yield_now()?;
                    }
                    Ok(())
                })
                .unwrap()
        };
        let _a = spawn("a");
        let _b = spawn("b");
        reactor.run();
        assert_eq!(*order.borrow(), vec![("a", 0), ("b", 0), ("a", 1), ("b", 1)]);
    }
}
