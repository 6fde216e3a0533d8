//! Context pool
//!
//! A fixed set of worker contexts draining a FIFO of submitted closures on
//! the calling thread's reactor.

use crate::context::Context;
use crate::dock::Dock;
use gctx_core::{ktrace, CtxResult};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

type Task = Box<dyn FnOnce()>;

struct Shared {
    queue: RefCell<VecDeque<Task>>,
    dock: Dock,
    active: Cell<usize>,
    closed: Cell<bool>,
}

pub struct Pool {
    name: String,
    shared: Rc<Shared>,
    workers: Vec<Context>,
}

fn worker(shared: Rc<Shared>) -> CtxResult<()> {
    loop {
        shared.dock.wait(|| shared.closed.get() || !shared.queue.borrow().is_empty())?;
        let task = shared.queue.borrow_mut().pop_front();
        let Some(task) = task else {
            return Ok(());
        };
        shared.active.set(shared.active.get() + 1);
        task();
        shared.active.set(shared.active.get() - 1);
    }
}

impl Pool {
    /// Spawn `size` worker contexts on this thread's reactor
    pub fn new(name: impl Into<String>, size: usize) -> CtxResult<Self> {
        let name = name.into();
        let shared = Rc::new(Shared {
            queue: RefCell::new(VecDeque::new()),
            dock: Dock::new(),
            active: Cell::new(0),
            closed: Cell::new(false),
        });
        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let s = Rc::clone(&shared);
            workers.push(Context::new(format!("{}.{}", name, i), move || worker(s))?);
        }
        ktrace!("pool '{}' started {} workers", name, size);
        Ok(Self { name, shared, workers })
    }

    /// Queue `f` for the next idle worker
    pub fn submit(&self, f: impl FnOnce() + 'static) {
        self.shared.queue.borrow_mut().push_back(Box::new(f));
        self.shared.dock.notify_one();
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Submitted tasks no worker picked up yet
    #[inline]
    pub fn queued(&self) -> usize {
        self.shared.queue.borrow().len()
    }

    /// Tasks currently running
    #[inline]
    pub fn active(&self) -> usize {
        self.shared.active.get()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shared.closed.set(true);
        self.shared.dock.notify_all();
        // each worker is interrupted and joined
        self.workers.clear();
        let dropped = self.shared.queue.borrow_mut().drain(..).count();
        if dropped > 0 {
            ktrace!("pool '{}' dropped {} queued tasks", self.name, dropped);
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("size", &self.size())
            .field("queued", &self.queued())
            .field("active", &self.active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;
    use crate::this_ctx;
    use std::time::Duration;

    #[test]
    fn test_tasks_run_fifo() {
        let reactor = Reactor::new().unwrap();
        let pool = Pool::new("fifo", 1).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        for i in 0..4 {
            let s = seen.clone();
            pool.submit(move || s.borrow_mut().push(i));
        }
        assert_eq!(pool.queued(), 4);
        reactor.run();
        assert_eq!(*seen.borrow(), vec![0, 1, 2, 3]);
        assert_eq!(pool.queued(), 0);
        assert_eq!(pool.active(), 0);
    }

    #[test]
    fn test_workers_overlap_blocking_tasks() {
        let reactor = Reactor::new().unwrap();
        let pool = Pool::new("overlap", 3).unwrap();
        assert_eq!(pool.size(), 3);
        let peak = Rc::new(Cell::new(0));
        for _ in 0..3 {
            let (p, s) = (peak.clone(), pool.shared.clone());
            pool.submit(move || {
                p.set(p.get().max(s.active.get()));
                let _ = this_ctx::sleep(Duration::from_millis(10));
            });
        }
        reactor.run();
        assert_eq!(peak.get(), 3);
    }

    #[test]
    fn test_drop_joins_idle_workers() {
        let reactor = Reactor::new().unwrap();
        let pool = Pool::new("idle", 2).unwrap();
        reactor.run();
        assert_eq!(reactor.live(), 2);
        drop(pool);
        assert_eq!(reactor.live(), 0);
    }
}
