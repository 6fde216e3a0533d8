//! Submission modes
//!
//! All functions submit to the calling thread's reactor.

use super::descriptor::Descriptor;
use super::handler::{self, Handle};
use crate::interrupt::Uninterruptible;
use crate::latch::Latch;
use crate::reactor::{Reactor, ReactorHandle};
use crate::sched;
use crate::tls;
use gctx_core::{kerror, CtxError, CtxResult};
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};

/// Queue `f`; it runs after everything already queued
pub fn post(desc: &'static Descriptor, f: impl FnOnce() + 'static) -> CtxResult<()> {
    let inner = tls::reactor().ok_or(CtxError::NoReactor)?;
    inner.enqueue(Handle::new(desc, f));
    Ok(())
}

/// Run `f` inline on the reactor stack outside any context, else post it
pub fn dispatch(desc: &'static Descriptor, f: impl FnOnce() + 'static) -> CtxResult<()> {
    if !tls::has_reactor() {
        return Err(CtxError::NoReactor);
    }
    if tls::in_context() {
        return post(desc, f);
    }
    handler::invoke_inline(desc, f);
    Ok(())
}

/// Queue `f`; never inline
pub fn defer(desc: &'static Descriptor, f: impl FnOnce() + 'static) -> CtxResult<()> {
    post(desc, f)
}

/// Post `f` and yield the calling context behind it
///
/// Inline outside a context. Interruption point.
pub fn dispatch_yield(desc: &'static Descriptor, f: impl FnOnce() + 'static) -> CtxResult<()> {
    let Some(c) = sched::current() else {
        return dispatch(desc, f);
    };
    sched::interruption_point(c)?;
    post(desc, f)?;
    sched::yield_queued(c)?;
    sched::interruption_point(c)
}

/// Run `f` as a deferred handler and block until it has run
///
/// `f` may borrow from the caller. Inline outside a context. A panic in
/// `f` is re-raised here.
pub fn dispatch_wait<R>(desc: &'static Descriptor, f: impl FnOnce() -> R) -> CtxResult<R> {
    let Some(c) = sched::current() else {
        if !tls::has_reactor() {
            return Err(CtxError::NoReactor);
        }
        return Ok(handler::invoke_inline(desc, f));
    };
    sched::interruption_point(c)?;
    sched::check_switch()?;
    let inner = tls::reactor().ok_or(CtxError::NoReactor)?;

    let slot: RefCell<Option<std::thread::Result<R>>> = RefCell::new(None);
    let latch = Latch::new(1);
    let task = || {
        let r = panic::catch_unwind(AssertUnwindSafe(f));
        *slot.borrow_mut() = Some(r);
        latch.count_down(1);
    };
    let task: Box<dyn FnOnce() + '_> = Box::new(task);
    // Safety: this frame does not return before the task ran; the wait
    // below cannot fail and the context cannot be freed while waiting
    let task: Box<dyn FnOnce() + 'static> = unsafe { std::mem::transmute(task) };
    inner.enqueue(Handle::from_box(desc, task));

    let waited = {
        let _ni = Uninterruptible::new();
        latch.wait()
    };
    if let Err(e) = waited {
        kerror!("dispatch_wait on '{}' lost its task: {}", desc.name(), e);
        std::process::abort();
    }

    match slot.into_inner() {
        Some(Ok(v)) => Ok(v),
        Some(Err(payload)) => panic::resume_unwind(payload),
        None => Err(CtxError::Stalled),
    }
}

/// Anything that accepts tasks for a reactor
pub trait Executor {
    type Task;

    fn post(&self, desc: &'static Descriptor, task: Self::Task) -> CtxResult<()>;
    fn dispatch(&self, desc: &'static Descriptor, task: Self::Task) -> CtxResult<()>;
    fn defer(&self, desc: &'static Descriptor, task: Self::Task) -> CtxResult<()>;
}

impl Executor for Reactor {
    type Task = Box<dyn FnOnce()>;

    fn post(&self, desc: &'static Descriptor, task: Self::Task) -> CtxResult<()> {
        self.inner().enqueue(Handle::from_box(desc, task));
        Ok(())
    }

    fn dispatch(&self, desc: &'static Descriptor, task: Self::Task) -> CtxResult<()> {
        if tls::in_context() {
            return Executor::post(self, desc, task);
        }
        handler::invoke_inline(desc, task);
        Ok(())
    }

    fn defer(&self, desc: &'static Descriptor, task: Self::Task) -> CtxResult<()> {
        Executor::post(self, desc, task)
    }
}

impl Executor for ReactorHandle {
    type Task = Box<dyn FnOnce() + Send>;

    fn post(&self, desc: &'static Descriptor, task: Self::Task) -> CtxResult<()> {
        ReactorHandle::post(self, desc, task)
    }

    fn dispatch(&self, desc: &'static Descriptor, task: Self::Task) -> CtxResult<()> {
        ReactorHandle::dispatch(self, desc, task)
    }

    fn defer(&self, desc: &'static Descriptor, task: Self::Task) -> CtxResult<()> {
        ReactorHandle::defer(self, desc, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use gctx_core::CtxFlags;
    use std::cell::Cell;
    use std::rc::Rc;

    static TEST_DISPATCH: Descriptor = Descriptor::new("test.dispatch");

    fn log() -> (Rc<RefCell<Vec<&'static str>>>, impl Fn(&'static str) -> Box<dyn FnOnce()>) {
        let v = Rc::new(RefCell::new(Vec::new()));
        let w = v.clone();
        (v, move |tag| {
            let w = w.clone();
            Box::new(move || w.borrow_mut().push(tag))
        })
    }

    #[test]
    fn test_modes_outside_context() {
        let reactor = Reactor::new().unwrap();
        let (v, push) = log();
        post(&TEST_DISPATCH, push("post")).unwrap();
        defer(&TEST_DISPATCH, push("defer")).unwrap();
        dispatch(&TEST_DISPATCH, push("dispatch")).unwrap();
        assert_eq!(*v.borrow(), vec!["dispatch"]);
        reactor.run();
        assert_eq!(*v.borrow(), vec!["dispatch", "post", "defer"]);
    }

    #[test]
    fn test_no_reactor() {
        assert_eq!(post(&TEST_DISPATCH, || ()), Err(CtxError::NoReactor));
        assert_eq!(dispatch(&TEST_DISPATCH, || ()), Err(CtxError::NoReactor));
        assert_eq!(dispatch_wait(&TEST_DISPATCH, || 1), Err(CtxError::NoReactor));
    }

    #[test]
    fn test_dispatch_yield_runs_first() {
        let reactor = Reactor::new().unwrap();
        let (v, push) = log();
        let w = v.clone();
        let _c = Context::builder()
            .flags(CtxFlags::POST)
            .spawn(move || -> CtxResult<()> {
                dispatch_yield(&TEST_DISPATCH, push("posted"))?;
                w.borrow_mut().push("resumed");
                Ok(())
            })
            .unwrap();
        reactor.run();
        assert_eq!(*v.borrow(), vec!["posted", "resumed"]);
    }

    #[test]
    fn test_dispatch_wait_borrows_and_returns() {
        let reactor = Reactor::new().unwrap();
        let got = Rc::new(Cell::new(0));
        let g = got.clone();
        let _c = Context::new("waiter", move || -> CtxResult<()> {
            let local = vec![1, 2, 3];
            let sum = dispatch_wait(&TEST_DISPATCH, || {
                assert!(!tls::in_context());
                local.iter().sum::<i32>()
            })?;
            g.set(sum);
            Ok(())
        })
        .unwrap();
        assert_eq!(got.get(), 0);
        reactor.run();
        assert_eq!(got.get(), 6);
    }

    #[test]
    fn test_dispatch_wait_reraises_in_caller() {
        let reactor = Reactor::new().unwrap();
        let caught = Rc::new(Cell::new(false));
        let k = caught.clone();
        let _c = Context::new("reraise", move || {
            let r = panic::catch_unwind(AssertUnwindSafe(|| {
                dispatch_wait(&TEST_DISPATCH, || -> i32 { panic!("in handler") })
            }));
            k.set(r.is_err());
        })
        .unwrap();
        reactor.run();
        assert!(caught.get());
    }

    #[test]
    fn test_executor_trait() {
        fn submit<E: Executor>(e: &E, t: E::Task) {
            e.defer(&TEST_DISPATCH, t).unwrap();
        }
        let reactor = Reactor::new().unwrap();
        let hit = Rc::new(Cell::new(0));
        let h = hit.clone();
        submit(&reactor, Box::new(move || h.set(h.get() + 1)));

        let handle = reactor.handle();
        let n = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let m = n.clone();
        submit(&handle, Box::new(move || {
            m.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));
        reactor.run();
        assert_eq!(hit.get(), 1);
        assert_eq!(n.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
