//! Scope guards around interruption and suspension

use crate::sched;
use gctx_core::CtxFlags;
use std::marker::PhantomData;

/// Holds NOINTERRUPT on the running context for its scope
///
/// Signals arriving meanwhile stay pending and are delivered at the first
/// interruption point after the guard drops. No effect outside a context.
pub struct Uninterruptible {
    prior: Option<bool>,
    _not_send: PhantomData<*const ()>,
}

impl Uninterruptible {
    pub fn new() -> Self {
        let prior = sched::current().map(|c| {
            let was = c.flags.get().contains(CtxFlags::NOINTERRUPT);
            c.set_flag(CtxFlags::NOINTERRUPT);
            was
        });
        Self { prior, _not_send: PhantomData }
    }
}

impl Default for Uninterruptible {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Uninterruptible {
    fn drop(&mut self) {
        let (Some(false), Some(c)) = (self.prior, sched::current()) else {
            return;
        };
        c.clear_flag(CtxFlags::NOINTERRUPT);
    }
}

/// True until the running context is switched out
///
/// Code that must not lose atomicity across a call can check `get()`
/// afterwards. Outside a context nothing switches, so it stays true.
pub struct CriticalIndicator {
    start: u64,
    _not_send: PhantomData<*const ()>,
}

impl CriticalIndicator {
    pub fn new() -> Self {
        Self { start: crate::this_ctx::epoch(), _not_send: PhantomData }
    }

    /// No switch happened since construction
    #[inline]
    pub fn get(&self) -> bool {
        self.count() == 0
    }

    /// Switches out and back in since construction
    #[inline]
    pub fn count(&self) -> u64 {
        crate::this_ctx::epoch() - self.start
    }
}

impl Default for CriticalIndicator {
    fn default() -> Self {
        Self::new()
    }
}

/// Asserts in debug builds that the running context does not suspend
/// while in scope
pub struct CriticalAssertion {
    counted: bool,
    _not_send: PhantomData<*const ()>,
}

impl CriticalAssertion {
    pub fn new() -> Self {
        let counted = match sched::current() {
            Some(c) if cfg!(debug_assertions) => {
                c.critical.set(c.critical.get() + 1);
                true
            }
            _ => false,
        };
        Self { counted, _not_send: PhantomData }
    }
}

impl Default for CriticalAssertion {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CriticalAssertion {
    fn drop(&mut self) {
        if !self.counted {
            return;
        }
        if let Some(c) = sched::current() {
            c.critical.set(c.critical.get().saturating_sub(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::reactor::Reactor;
    use crate::this_ctx;
    use gctx_core::{CtxError, CtxResult};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_uninterruptible_defers_delivery() {
        let reactor = Reactor::new().unwrap();
        let out = Rc::new(RefCell::new(Vec::new()));
        let o = out.clone();
        let ctx = Context::new("guarded", move || -> CtxResult<()> {
            {
                let _ni = Uninterruptible::new();
                {
                    // nested guards restore the outer state
                    let _inner = Uninterruptible::new();
                }
                this_ctx::yield_now()?;
                o.borrow_mut().push(this_ctx::interruption_point());
                o.borrow_mut().push(Ok(()));
            }
            o.borrow_mut().push(this_ctx::interruption_point());
            Ok(())
        })
        .unwrap();
        ctx.interrupt();
        reactor.run();
        assert_eq!(*out.borrow(), vec![Ok(()), Ok(()), Err(CtxError::Interrupted)]);
        assert!(!ctx.flags().contains(CtxFlags::NOINTERRUPT));
    }

    #[test]
    fn test_interrupt_does_not_wake_uninterruptible_waiter() {
        let reactor = Reactor::new().unwrap();
        let ctx = Context::new("sleeper", || -> CtxResult<()> {
            let _ni = Uninterruptible::new();
            this_ctx::sleep(std::time::Duration::from_millis(10))
        })
        .unwrap();
        ctx.interrupt();
        assert_eq!(ctx.state(), Some(gctx_core::CtxState::Waiting));
        reactor.run();
        assert!(ctx.joined());
    }

    #[test]
    fn test_critical_indicator() {
        let reactor = Reactor::new().unwrap();
        let out = Rc::new(RefCell::new(Vec::new()));
        let o = out.clone();
        let _ctx = Context::new("crit", move || -> CtxResult<()> {
            let ci = CriticalIndicator::new();
            o.borrow_mut().push((ci.get(), ci.count()));
            this_ctx::yield_now()?;
            this_ctx::yield_now()?;
            o.borrow_mut().push((ci.get(), ci.count()));
            Ok(())
        })
        .unwrap();
        reactor.run();
        assert_eq!(*out.borrow(), vec![(true, 0), (false, 2)]);
        assert!(CriticalIndicator::new().get());
    }

    #[test]
    #[cfg(debug_assertions)]
    fn test_critical_assertion_catches_suspend() {
        let reactor = Reactor::new().unwrap();
        let ctx = Context::builder()
            .flags(CtxFlags::POST)
            .spawn(|| -> CtxResult<()> {
                let _ca = CriticalAssertion::new();
                this_ctx::yield_now()
            })
            .unwrap();
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| reactor.run()));
        assert!(res.is_err());
        assert!(ctx.joined());
    }
}
