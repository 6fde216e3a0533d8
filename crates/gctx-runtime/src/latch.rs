//! Count-down latch for contexts

use crate::dock::Dock;
use gctx_core::{kerror, CtxResult};
use std::cell::Cell;

/// Releases every waiter once the count reaches zero
#[derive(Debug)]
pub struct Latch {
    count: Cell<usize>,
    dock: Dock,
}

impl Latch {
    pub const fn new(count: usize) -> Self {
        Self { count: Cell::new(count), dock: Dock::new() }
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count.get()
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.count.get() == 0
    }

    /// Decrement by `n`, releasing the waiters at zero
    ///
    /// Decrementing past zero is a caller bug: it asserts in debug builds
    /// and is logged and clamped to zero otherwise.
    pub fn count_down(&self, n: usize) {
        let count = self.count.get();
        debug_assert!(n <= count, "latch over-decrement: {} of {}", n, count);
        if n > count {
            kerror!("latch over-decrement: {} of {}", n, count);
        }
        let count = count.saturating_sub(n);
        self.count.set(count);
        if count == 0 {
            self.dock.notify_all();
        }
    }

    pub fn count_down_and_wait(&self) -> CtxResult<()> {
        self.count_down(1);
        self.wait()
    }

    /// Wait for zero (interruption point unless already ready)
    pub fn wait(&self) -> CtxResult<()> {
        self.dock.wait(|| self.is_ready())
    }
}

impl Drop for Latch {
    fn drop(&mut self) {
        debug_assert!(
            std::thread::panicking() || self.dock.is_empty(),
            "latch dropped with {} waiters",
            self.dock.size()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::reactor::Reactor;
    use std::rc::Rc;

    #[test]
    fn test_releases_all_waiters() {
        let reactor = Reactor::new().unwrap();
        let latch = Rc::new(Latch::new(3));
        let released = Rc::new(Cell::new(0));

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let (l, r) = (latch.clone(), released.clone());
                Context::new("waiter", move || -> CtxResult<()> {
                    l.wait()?;
                    r.set(r.get() + 1);
                    Ok(())
                })
                .unwrap()
            })
            .collect();

        for left in (0..3).rev() {
            assert_eq!(released.get(), 0);
            latch.count_down(1);
            assert_eq!(latch.count(), left);
            reactor.run();
        }
        assert!(latch.is_ready());
        assert_eq!(released.get(), 4);
        assert!(waiters.iter().all(Context::joined));
    }

    #[test]
    fn test_count_down_and_wait_rendezvous() {
        let reactor = Reactor::new().unwrap();
        let latch = Rc::new(Latch::new(2));
        let ctxs: Vec<_> = (0..2)
            .map(|_| {
                let l = latch.clone();
                Context::new("party", move || l.count_down_and_wait()).unwrap()
            })
            .collect();
        reactor.run();
        assert!(ctxs.iter().all(Context::joined));
    }

    #[test]
    fn test_ready_latch_does_not_suspend() {
        let latch = Latch::new(0);
        assert!(latch.wait().is_ok());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "over-decrement")]
    fn test_over_decrement_asserts() {
        let latch = Latch::new(1);
        latch.count_down(2);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_over_decrement_clamps() {
        let latch = Latch::new(1);
        latch.count_down(2);
        assert_eq!(latch.count(), 0);
        assert!(latch.is_ready());
    }
}
