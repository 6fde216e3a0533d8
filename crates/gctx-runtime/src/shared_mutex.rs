//! Shared/upgrade/unique lock for contexts
//!
//! State is an owner `u` and a signed share count `s`:
//!
//! | u     | s         | meaning                                  |
//! |-------|-----------|------------------------------------------|
//! | none  | 0         | free                                     |
//! | none  | > 0       | `s` shared holders                       |
//! | some  | >= 0      | upgrade held; shared access still open   |
//! | some  | MIN       | unique                                   |
//!
//! Releases that may admit several waiters wake all of them; each waiter
//! re-checks its own condition.

use crate::dock::Dock;
use crate::this_ctx;
use gctx_core::{CtxId, CtxResult};
use std::cell::Cell;
use std::time::{Duration, Instant};

const UNIQUE: isize = isize::MIN;

#[derive(Debug)]
pub struct SharedMutex {
    u: Cell<Option<CtxId>>,
    s: Cell<isize>,
    dock: Dock,
}

impl Default for SharedMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedMutex {
    pub const fn new() -> Self {
        Self { u: Cell::new(None), s: Cell::new(0), dock: Dock::new() }
    }

    // queries

    pub fn can_lock(&self) -> bool {
        self.s.get() == 0 && self.u.get().is_none_or(|u| u == this_ctx::id())
    }

    pub fn can_lock_shared(&self) -> bool {
        self.s.get() >= 0
    }

    pub fn can_lock_upgrade(&self) -> bool {
        self.u.get().is_none()
    }

    /// Shared holders
    pub fn shares(&self) -> usize {
        self.s.get().max(0) as usize
    }

    pub fn unique(&self) -> bool {
        self.s.get() == UNIQUE
    }

    /// Upgrade held (and not promoted to unique)
    pub fn upgrade(&self) -> bool {
        self.u.get().is_some() && self.s.get() >= 0
    }

    /// Contexts queued on the lock
    pub fn waiting(&self) -> usize {
        self.dock.size()
    }

    // commits

    fn take_unique(&self) {
        self.u.set(Some(this_ctx::id()));
        self.s.set(UNIQUE);
    }

    fn take_shared(&self) {
        self.s.set(self.s.get() + 1);
    }

    fn take_upgrade(&self) {
        self.u.set(Some(this_ctx::id()));
    }

    // unique

    pub fn lock(&self) -> CtxResult<()> {
        self.dock.wait(|| self.can_lock())?;
        self.take_unique();
        Ok(())
    }

    pub fn try_lock(&self) -> bool {
        if !self.can_lock() {
            return false;
        }
        self.take_unique();
        true
    }

    pub fn try_lock_until(&self, deadline: Instant) -> CtxResult<bool> {
        if !self.dock.wait_until(deadline, || self.can_lock())? {
            return Ok(false);
        }
        self.take_unique();
        Ok(true)
    }

    pub fn try_lock_for(&self, timeout: Duration) -> CtxResult<bool> {
        self.try_lock_until(Instant::now() + timeout)
    }

    pub fn unlock(&self) {
        debug_assert!(self.unique(), "unlock without unique ownership");
        self.u.set(None);
        self.s.set(0);
        self.dock.notify_all();
    }

    // shared

    pub fn lock_shared(&self) -> CtxResult<()> {
        self.dock.wait(|| self.can_lock_shared())?;
        self.take_shared();
        Ok(())
    }

    pub fn try_lock_shared(&self) -> bool {
        if !self.can_lock_shared() {
            return false;
        }
        self.take_shared();
        true
    }

    pub fn try_lock_shared_until(&self, deadline: Instant) -> CtxResult<bool> {
        if !self.dock.wait_until(deadline, || self.can_lock_shared())? {
            return Ok(false);
        }
        self.take_shared();
        Ok(true)
    }

    pub fn try_lock_shared_for(&self, timeout: Duration) -> CtxResult<bool> {
        self.try_lock_shared_until(Instant::now() + timeout)
    }

    pub fn unlock_shared(&self) {
        debug_assert!(self.s.get() > 0, "unlock_shared without a share");
        let s = self.s.get() - 1;
        self.s.set(s);
        // a last remaining share may be the one waiting to convert
        if s <= 1 {
            self.dock.notify_all();
        } else {
            self.dock.notify_one();
        }
    }

    // upgrade

    pub fn lock_upgrade(&self) -> CtxResult<()> {
        self.dock.wait(|| self.can_lock_upgrade())?;
        self.take_upgrade();
        Ok(())
    }

    pub fn try_lock_upgrade(&self) -> bool {
        if !self.can_lock_upgrade() {
            return false;
        }
        self.take_upgrade();
        true
    }

    pub fn try_lock_upgrade_until(&self, deadline: Instant) -> CtxResult<bool> {
        if !self.dock.wait_until(deadline, || self.can_lock_upgrade())? {
            return Ok(false);
        }
        self.take_upgrade();
        Ok(true)
    }

    pub fn try_lock_upgrade_for(&self, timeout: Duration) -> CtxResult<bool> {
        self.try_lock_upgrade_until(Instant::now() + timeout)
    }

    pub fn unlock_upgrade(&self) {
        debug_assert!(self.upgrade(), "unlock_upgrade without upgrade ownership");
        self.u.set(None);
        self.dock.notify_all();
    }

    // conversions

    pub fn unlock_and_lock_shared(&self) {
        debug_assert!(self.unique());
        self.u.set(None);
        self.s.set(1);
        self.dock.notify_all();
    }

    pub fn unlock_and_lock_upgrade(&self) {
        debug_assert!(self.unique());
        self.s.set(0);
        self.dock.notify_all();
    }

    /// Wait for the shares to drain, then promote; keeps the upgrade on error
    pub fn unlock_upgrade_and_lock(&self) -> CtxResult<()> {
        debug_assert!(self.upgrade());
        self.dock.wait(|| self.s.get() == 0)?;
        self.s.set(UNIQUE);
        Ok(())
    }

    pub fn unlock_upgrade_and_lock_shared(&self) {
        debug_assert!(self.upgrade());
        self.u.set(None);
        self.s.set(self.s.get() + 1);
        self.dock.notify_all();
    }

    pub fn try_unlock_shared_and_lock(&self) -> bool {
        if self.s.get() != 1 || self.u.get().is_some() {
            return false;
        }
        self.take_unique();
        true
    }

    pub fn try_unlock_shared_and_lock_upgrade(&self) -> bool {
        if self.u.get().is_some() {
            return false;
        }
        self.take_upgrade();
        self.s.set(self.s.get() - 1);
        true
    }

    pub fn try_unlock_upgrade_and_lock(&self) -> bool {
        if self.s.get() != 0 {
            return false;
        }
        self.s.set(UNIQUE);
        true
    }

    // timed conversions: wait for the condition, then commit; the held lock
    // is kept on timeout

    pub fn try_unlock_shared_and_lock_until(&self, deadline: Instant) -> CtxResult<bool> {
        let ready = || self.s.get() == 1 && self.u.get().is_none();
        if !self.dock.wait_until(deadline, ready)? {
            return Ok(false);
        }
        Ok(self.try_unlock_shared_and_lock())
    }

    pub fn try_unlock_shared_and_lock_for(&self, timeout: Duration) -> CtxResult<bool> {
        self.try_unlock_shared_and_lock_until(Instant::now() + timeout)
    }

    pub fn try_unlock_shared_and_lock_upgrade_until(&self, deadline: Instant) -> CtxResult<bool> {
        if !self.dock.wait_until(deadline, || self.can_lock_upgrade())? {
            return Ok(false);
        }
        Ok(self.try_unlock_shared_and_lock_upgrade())
    }

    pub fn try_unlock_shared_and_lock_upgrade_for(&self, timeout: Duration) -> CtxResult<bool> {
        self.try_unlock_shared_and_lock_upgrade_until(Instant::now() + timeout)
    }

    pub fn try_unlock_upgrade_and_lock_until(&self, deadline: Instant) -> CtxResult<bool> {
        if !self.dock.wait_until(deadline, || self.s.get() == 0)? {
            return Ok(false);
        }
        Ok(self.try_unlock_upgrade_and_lock())
    }

    pub fn try_unlock_upgrade_and_lock_for(&self, timeout: Duration) -> CtxResult<bool> {
        self.try_unlock_upgrade_and_lock_until(Instant::now() + timeout)
    }

    // guards

    pub fn write(&self) -> CtxResult<UniqueGuard<'_>> {
        self.lock()?;
        Ok(UniqueGuard { m: self })
    }

    pub fn read(&self) -> CtxResult<SharedGuard<'_>> {
        self.lock_shared()?;
        Ok(SharedGuard { m: self })
    }

    pub fn upgradable(&self) -> CtxResult<UpgradeGuard<'_>> {
        self.lock_upgrade()?;
        Ok(UpgradeGuard { m: self })
    }
}

impl Drop for SharedMutex {
    fn drop(&mut self) {
        debug_assert!(
            std::thread::panicking() || self.dock.is_empty(),
            "shared mutex dropped with {} waiters",
            self.dock.size()
        );
    }
}

#[must_use]
pub struct UniqueGuard<'a> {
    m: &'a SharedMutex,
}

impl Drop for UniqueGuard<'_> {
    fn drop(&mut self) {
        self.m.unlock();
    }
}

#[must_use]
pub struct SharedGuard<'a> {
    m: &'a SharedMutex,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.m.unlock_shared();
    }
}

#[must_use]
pub struct UpgradeGuard<'a> {
    m: &'a SharedMutex,
}

impl<'a> UpgradeGuard<'a> {
    /// Promote once the shares drain; the upgrade is released on error
    pub fn upgrade(self) -> CtxResult<UniqueGuard<'a>> {
        self.m.unlock_upgrade_and_lock()?;
        let m = self.m;
        std::mem::forget(self);
        Ok(UniqueGuard { m })
    }
}

impl Drop for UpgradeGuard<'_> {
    fn drop(&mut self) {
        self.m.unlock_upgrade();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::reactor::Reactor;
    use gctx_core::{CtxError, CtxState};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_shares_accounting() {
        let m = SharedMutex::new();
        assert!(m.can_lock());
        assert!(m.try_lock_shared());
        assert!(m.try_lock_shared());
        assert_eq!(m.shares(), 2);
        assert!(!m.can_lock());
        assert!(m.can_lock_upgrade());
        m.unlock_shared();
        m.unlock_shared();
        assert_eq!(m.shares(), 0);
        assert!(m.can_lock());
    }

    #[test]
    fn test_unique_excludes_shared() {
        let m = SharedMutex::new();
        assert!(m.try_lock());
        assert!(m.unique());
        assert!(!m.can_lock_shared());
        assert!(!m.try_lock_shared());
        assert_eq!(m.shares(), 0);

        m.unlock_and_lock_shared();
        assert_eq!(m.shares(), 1);
        assert!(!m.unique());
        m.unlock_shared();
        assert!(m.can_lock() && m.can_lock_upgrade());
        assert_eq!(m.shares(), 0);
    }

    #[test]
    fn test_upgrade_conversions() {
        let m = SharedMutex::new();
        assert!(m.try_lock_upgrade());
        assert!(m.upgrade());
        // shared access stays open while upgrade is held
        assert!(m.try_lock_shared());
        assert!(!m.try_unlock_upgrade_and_lock());
        m.unlock_shared();
        assert!(m.try_unlock_upgrade_and_lock());
        assert!(m.unique());

        m.unlock_and_lock_upgrade();
        assert!(m.upgrade());
        m.unlock_upgrade_and_lock_shared();
        assert_eq!(m.shares(), 1);
        assert!(m.try_unlock_shared_and_lock_upgrade());
        assert_eq!(m.shares(), 0);
        m.unlock_upgrade();

        assert!(m.try_lock_shared());
        assert!(m.try_unlock_shared_and_lock());
        m.unlock();
        assert!(m.can_lock());
    }

    #[test]
    fn test_contention_wakes_loser() {
        let reactor = Reactor::new().unwrap();
        let m = Rc::new(SharedMutex::new());
        let order = Rc::new(RefCell::new(Vec::new()));

        let (mw, o) = (m.clone(), order.clone());
        let winner = Context::new("winner", move || -> CtxResult<()> {
            mw.lock()?;
            o.borrow_mut().push("winner");
            crate::this_ctx::wait()?;
            mw.unlock();
            Ok(())
        })
        .unwrap();

        let (ml, o) = (m.clone(), order.clone());
        let loser = Context::new("loser", move || -> CtxResult<()> {
            let _g = ml.write()?;
            o.borrow_mut().push("loser");
            Ok(())
        })
        .unwrap();

        assert_eq!(m.waiting(), 1);
        assert_eq!(loser.state(), Some(CtxState::Waiting));

        // release the winner; unlock makes the loser runnable
        crate::sched::notify(unsafe { winner.as_ptr().unwrap().as_ref() });
        reactor.run();
        assert_eq!(*order.borrow(), vec!["winner", "loser"]);
        assert!(m.can_lock());
        assert!(winner.joined() && loser.joined());
    }

    #[test]
    fn test_timed_conversion_keeps_lock() {
        let reactor = Reactor::new().unwrap();
        let m = Rc::new(SharedMutex::new());
        assert!(m.try_lock_shared());

        let mc = m.clone();
        let result = Rc::new(Cell::new(None));
        let r = result.clone();
        let _c = Context::new("upgrader", move || -> CtxResult<()> {
            let _g = mc.upgradable()?;
            // the outside share blocks the promotion
            r.set(Some(mc.try_unlock_upgrade_and_lock_for(Duration::from_millis(10))?));
            assert!(mc.upgrade());
            Ok(())
        })
        .unwrap();
        reactor.run();
        assert_eq!(result.get(), Some(false));
        assert!(m.can_lock_upgrade());
        m.unlock_shared();
        assert!(m.can_lock());
    }

    #[test]
    fn test_conversion_wakes_behind_unique_waiter() {
        let reactor = Reactor::new().unwrap();
        let m = Rc::new(SharedMutex::new());
        assert!(m.try_lock_shared());
        assert!(m.try_lock_shared());

        let result = Rc::new(Cell::new(None));
        let (mc, r) = (m.clone(), result.clone());
        let converter = Context::new("converter", move || -> CtxResult<()> {
            assert!(mc.try_lock_shared());
            let start = Instant::now();
            let won = mc.try_unlock_shared_and_lock_for(Duration::from_millis(300))?;
            r.set(Some((won, start.elapsed())));
            if won {
                mc.unlock();
            }
            Ok(())
        })
        .unwrap();

        let mw = m.clone();
        let writer = Context::new("writer", move || -> CtxResult<()> {
            let _g = mw.write()?;
            Ok(())
        })
        .unwrap();
        assert_eq!(m.waiting(), 2);

        // the converter ends up queued behind the writer before its share
        // is the last one left
        m.unlock_shared();
        reactor.poll();
        m.unlock_shared();
        reactor.poll();
        reactor.run();

        let (won, elapsed) = result.get().unwrap();
        assert!(won);
        assert!(elapsed < Duration::from_millis(100), "conversion took {:?}", elapsed);
        assert!(converter.joined() && writer.joined());
        assert!(m.can_lock());
        assert_eq!(m.waiting(), 0);
    }

    #[test]
    fn test_timed_locks_time_out_when_contended() {
        let reactor = Reactor::new().unwrap();
        let m = Rc::new(SharedMutex::new());
        assert!(m.try_lock());

        let results = Rc::new(RefCell::new(Vec::new()));
        let (mc, r) = (m.clone(), results.clone());
        let c = Context::new("timed", move || -> CtxResult<()> {
            let d = Duration::from_millis(10);
            let start = Instant::now();
            r.borrow_mut().push(mc.try_lock_for(d)?);
            r.borrow_mut().push(mc.try_lock_shared_for(d)?);
            r.borrow_mut().push(mc.try_lock_upgrade_for(d)?);
            r.borrow_mut().push(mc.try_lock_until(Instant::now() + d)?);
            r.borrow_mut().push(mc.try_lock_shared_until(Instant::now() + d)?);
            r.borrow_mut().push(mc.try_lock_upgrade_until(Instant::now() + d)?);
            assert!(start.elapsed() >= 6 * d);
            assert_eq!(mc.waiting(), 0);
            Ok(())
        })
        .unwrap();
        reactor.run();

        assert!(c.joined());
        assert_eq!(*results.borrow(), vec![false; 6]);
        assert!(m.unique());
        m.unlock();
        assert!(m.can_lock());
    }

    #[test]
    fn test_timed_locks_succeed_before_deadline() {
        let reactor = Reactor::new().unwrap();
        let m = Rc::new(SharedMutex::new());
        assert!(m.try_lock());

        let results = Rc::new(RefCell::new(Vec::new()));
        let deadline = Duration::from_secs(1);

        let (mc, r) = (m.clone(), results.clone());
        let unique = Context::new("unique", move || -> CtxResult<()> {
            let start = Instant::now();
            let won = mc.try_lock_until(start + deadline)?;
            r.borrow_mut().push(("unique", won, start.elapsed()));
            if won {
                mc.unlock();
            }
            Ok(())
        })
        .unwrap();

        let (mc, r) = (m.clone(), results.clone());
        let shared = Context::new("shared", move || -> CtxResult<()> {
            let start = Instant::now();
            let won = mc.try_lock_shared_for(deadline)?;
            r.borrow_mut().push(("shared", won, start.elapsed()));
            if won {
                mc.unlock_shared();
            }
            Ok(())
        })
        .unwrap();

        let (mc, r) = (m.clone(), results.clone());
        let upgrade = Context::new("upgrade", move || -> CtxResult<()> {
            let start = Instant::now();
            let won = mc.try_lock_upgrade_for(deadline)?;
            r.borrow_mut().push(("upgrade", won, start.elapsed()));
            if won {
                mc.unlock_upgrade();
            }
            Ok(())
        })
        .unwrap();

        assert_eq!(m.waiting(), 3);
        assert!(results.borrow().is_empty());
        m.unlock();
        reactor.run();

        let results = results.borrow();
        assert_eq!(results.len(), 3);
        for (name, won, elapsed) in results.iter() {
            assert!(won, "{} timed out", name);
            assert!(*elapsed < Duration::from_millis(500), "{} took {:?}", name, elapsed);
        }
        assert!(unique.joined() && shared.joined() && upgrade.joined());
        assert!(m.can_lock());
    }

    #[test]
    fn test_timed_locks_interrupted() {
        let reactor = Reactor::new().unwrap();
        let m = Rc::new(SharedMutex::new());
        assert!(m.try_lock());

        let results = Rc::new(RefCell::new(Vec::new()));
        let deadline = Duration::from_secs(1);
        let attempts: [fn(&SharedMutex, Duration) -> CtxResult<bool>; 3] = [
            |m, d| m.try_lock_for(d),
            |m, d| m.try_lock_shared_until(Instant::now() + d),
            |m, d| m.try_lock_upgrade_for(d),
        ];
        let ctxs: Vec<_> = attempts
            .into_iter()
            .map(|attempt| {
                let (mc, r) = (m.clone(), results.clone());
                Context::new("attempt", move || {
                    r.borrow_mut().push(attempt(&mc, deadline));
                })
                .unwrap()
            })
            .collect();
        assert_eq!(m.waiting(), 3);

        for c in &ctxs {
            c.interrupt();
        }
        reactor.run();

        assert!(ctxs.iter().all(Context::joined));
        assert_eq!(*results.borrow(), vec![Err(CtxError::Interrupted); 3]);
        // the unique hold is untouched and nobody is left queued
        assert!(m.unique());
        assert_eq!(m.shares(), 0);
        assert_eq!(m.waiting(), 0);
        m.unlock();
        assert!(m.can_lock());
    }

    #[test]
    fn test_guards() {
        let reactor = Reactor::new().unwrap();
        let m = Rc::new(SharedMutex::new());
        let mc = m.clone();
        let _c = Context::new("guards", move || -> CtxResult<()> {
            {
                let _a = mc.read()?;
                let _b = mc.read()?;
                assert_eq!(mc.shares(), 2);
            }
            let up = mc.upgradable()?;
            let w = up.upgrade()?;
            assert!(mc.unique());
            drop(w);
            assert!(mc.can_lock());
            Ok(())
        })
        .unwrap();
        reactor.run();
        assert!(m.can_lock());
    }
}
