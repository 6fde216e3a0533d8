//! Fan-out over a context pool
//!
//! `Concurrent` submits one pool task per value and collects the first
//! error any of them returns. The error is reported exactly once, by
//! whichever of `submit` or `wait` observes it first.

use crate::dock::Dock;
use crate::interrupt::Uninterruptible;
use crate::pool::Pool;
use gctx_core::{kwarn, CtxError};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

struct State<E> {
    sent: Cell<usize>,
    received: Cell<usize>,
    finished: Cell<usize>,
    error: RefCell<Option<E>>,
    dock: Dock,
}

impl<E> State<E> {
    fn done(&self) -> bool {
        self.finished.get() == self.sent.get()
    }

    fn take_error(&self) -> Result<(), E> {
        match self.error.borrow_mut().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

pub struct Concurrent<'p, V, E> {
    pool: &'p Pool,
    state: Rc<State<E>>,
    func: Rc<dyn Fn(V) -> Result<(), E>>,
}

impl<'p, V, E> Concurrent<'p, V, E>
where
    V: 'static,
    E: From<CtxError> + 'static,
{
    pub fn new(pool: &'p Pool, f: impl Fn(V) -> Result<(), E> + 'static) -> Self {
        Self {
            pool,
            state: Rc::new(State {
                sent: Cell::new(0),
                received: Cell::new(0),
                finished: Cell::new(0),
                error: RefCell::new(None),
                dock: Dock::new(),
            }),
            func: Rc::new(f),
        }
    }

    /// Queue `value`; returns an error captured from earlier tasks instead
    pub fn submit(&self, value: V) -> Result<(), E> {
        self.state.take_error()?;
        self.state.sent.set(self.state.sent.get() + 1);

        let state = Rc::clone(&self.state);
        let func = Rc::clone(&self.func);
        self.pool.submit(move || {
            state.received.set(state.received.get() + 1);
            if let Err(e) = func(value) {
                let mut slot = state.error.borrow_mut();
                if slot.is_none() {
                    *slot = Some(e);
                }
            }
            state.finished.set(state.finished.get() + 1);
            if state.done() {
                state.dock.notify_all();
            }
        });
        Ok(())
    }

    /// Block until every submitted task finished
    pub fn wait(&self) -> Result<(), E> {
        let state = &*self.state;
        state.dock.wait(|| state.done()).map_err(E::from)?;
        state.take_error()
    }

    #[inline]
    pub fn sent(&self) -> usize {
        self.state.sent.get()
    }

    /// Tasks a worker has started
    #[inline]
    pub fn received(&self) -> usize {
        self.state.received.get()
    }

    #[inline]
    pub fn finished(&self) -> usize {
        self.state.finished.get()
    }

    /// An error is captured and not yet reported
    pub fn has_error(&self) -> bool {
        self.state.error.borrow().is_some()
    }
}

impl<V, E> Drop for Concurrent<'_, V, E> {
    fn drop(&mut self) {
        let state = &*self.state;
        if state.done() {
            return;
        }
        let _ni = Uninterruptible::new();
        if let Err(e) = state.dock.wait(|| state.done()) {
            let left = state.sent.get() - state.finished.get();
            kwarn!("concurrent dropped with {} tasks unfinished: {}", left, e);
        }
    }
}

impl<V, E> fmt::Debug for Concurrent<'_, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Concurrent")
            .field("pool", &self.pool.name())
            .field("sent", &self.state.sent.get())
            .field("received", &self.state.received.get())
            .field("finished", &self.state.finished.get())
            .finish()
    }
}

/// Run `f` over `items` on `pool`, returning the first error
///
/// Submission stops once an error has been observed; tasks already
/// submitted still run to completion and later errors are discarded.
pub fn concurrent_for_each<V, E, I, F>(pool: &Pool, items: I, f: F) -> Result<(), E>
where
    I: IntoIterator<Item = V>,
    F: Fn(V) -> Result<(), E> + 'static,
    V: 'static,
    E: From<CtxError> + 'static,
{
    let c = Concurrent::new(pool, f);
    for item in items {
        if c.has_error() {
            break;
        }
        c.submit(item)?;
    }
    c.wait()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;
    use crate::this_ctx;
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    enum JobError {
        Bad(u32),
        Ctx(CtxError),
    }

    impl From<CtxError> for JobError {
        fn from(e: CtxError) -> Self {
            JobError::Ctx(e)
        }
    }

    #[test]
    fn test_wait_for_all() {
        let reactor = Reactor::new().unwrap();
        let out = reactor
            .block_on(|| {
                let pool = Pool::new("sum", 2).unwrap();
                let total = Rc::new(Cell::new(0));
                let t = total.clone();
                let c = Concurrent::new(&pool, move |v: u32| -> Result<(), JobError> {
                    this_ctx::sleep(Duration::from_millis(1))?;
                    t.set(t.get() + v);
                    Ok(())
                });
                for v in 1..=5 {
                    c.submit(v).unwrap();
                }
                let r = c.wait();
                (r, total.get(), c.sent(), c.received(), c.finished())
            })
            .unwrap();
        assert_eq!(out, (Ok(()), 15, 5, 5, 5));
    }

    #[test]
    fn test_first_error_reported_once() {
        let reactor = Reactor::new().unwrap();
        let out = reactor
            .block_on(|| {
                let pool = Pool::new("errs", 1).unwrap();
                let c = Concurrent::new(&pool, |v: u32| if v > 1 { Err(JobError::Bad(v)) } else { Ok(()) });
                for v in 0..4 {
                    c.submit(v).unwrap();
                }
                (c.wait(), c.wait())
            })
            .unwrap();
        assert_eq!(out, (Err(JobError::Bad(2)), Ok(())));
    }

    #[test]
    fn test_for_each_stops_after_error() {
        let reactor = Reactor::new().unwrap();
        let out = reactor
            .block_on(|| {
                let pool = Pool::new("stop", 1).unwrap();
                let ran = Rc::new(Cell::new(0));
                let r = ran.clone();
                let items = (0..100u32).inspect(|_| {
                    // let the single worker catch up between submissions
                    let _ = this_ctx::yield_now();
                });
                let res = concurrent_for_each(&pool, items, move |v| {
                    r.set(r.get() + 1);
                    if v == 3 { Err(JobError::Bad(v)) } else { Ok(()) }
                });
                (res, ran.get())
            })
            .unwrap();
        assert_eq!(out.0, Err(JobError::Bad(3)));
        assert!(out.1 < 100);
    }
}
