//! Executor integration
//!
//! Descriptors and handlers instrument every unit of work handed to a
//! reactor. The submission modes live in `dispatch`. This module also holds
//! the process-wide main executor and the process lifecycle flags.

pub mod descriptor;
pub mod dispatch;
pub(crate) mod handler;

pub use descriptor::{descriptors, Descriptor, StatsSnapshot, HISTORY_SIZE};
pub use dispatch::{defer, dispatch, dispatch_wait, dispatch_yield, post, Executor};
pub use handler::Handle;
pub(crate) use handler::SendHandle;

use crate::ole;
use crate::reactor::{Reactor, ReactorHandle};
use gctx_core::{kinfo, kwarn, CtxError, CtxResult, SpinLock};
#[cfg(unix)]
use nix::unistd::ForkResult;
use std::sync::atomic::{AtomicBool, Ordering};

static MAIN: SpinLock<Option<ReactorHandle>> = SpinLock::new(None);

static FORKING: AtomicBool = AtomicBool::new(false);
static FORKED_CHILD: AtomicBool = AtomicBool::new(false);
static FORKED_PARENT: AtomicBool = AtomicBool::new(false);
static EXITING: AtomicBool = AtomicBool::new(false);

/// Make `reactor` the process's main executor
pub fn init(reactor: &Reactor) -> CtxResult<()> {
    let mut main = MAIN.lock();
    if main.as_ref().is_some_and(|h| !h.is_closed()) {
        return Err(CtxError::ReactorExists);
    }
    let handle = reactor.handle();
    kinfo!("ios main executor on {:?}", handle.thread());
    *main = Some(handle);
    EXITING.store(false, Ordering::Release);
    Ok(())
}

/// The main executor
pub fn main() -> CtxResult<ReactorHandle> {
    MAIN.lock()
        .as_ref()
        .filter(|h| !h.is_closed())
        .cloned()
        .ok_or(CtxError::NoReactor)
}

pub fn available() -> bool {
    main().is_ok()
}

/// Whether the calling thread runs the main executor
pub fn is_main_thread() -> bool {
    main().is_ok_and(|h| h.is_local())
}

#[inline]
pub fn forking() -> bool {
    FORKING.load(Ordering::Acquire)
}

#[inline]
pub fn forked_child() -> bool {
    FORKED_CHILD.load(Ordering::Acquire)
}

#[inline]
pub fn forked_parent() -> bool {
    FORKED_PARENT.load(Ordering::Acquire)
}

#[inline]
pub fn exiting() -> bool {
    EXITING.load(Ordering::Acquire)
}

/// `fork(2)` with the runtime's hooks around it
///
/// Offload workers are stopped first so no thread holds runtime locks
/// across the fork; both processes respawn them on next use. The
/// `forked_*` flags describe the most recent fork only.
#[cfg(unix)]
pub fn fork() -> nix::Result<ForkResult> {
    FORKING.store(true, Ordering::Release);
    ole::shutdown();
    kinfo!("forking");
    // Safety: the only other runtime threads (offload workers) are joined
    let result = unsafe { nix::unistd::fork() };
    FORKING.store(false, Ordering::Release);
    match &result {
        Ok(ForkResult::Child) => {
            FORKED_PARENT.store(false, Ordering::Release);
            FORKED_CHILD.store(true, Ordering::Release);
        }
        Ok(ForkResult::Parent { child }) => {
            FORKED_CHILD.store(false, Ordering::Release);
            FORKED_PARENT.store(true, Ordering::Release);
            kinfo!("forked child {}", child);
        }
        Err(e) => kwarn!("fork failed: {}", e),
    }
    result
}

/// Process lifecycle guard
///
/// Installs the main executor on construction; on drop marks the process
/// as exiting, stops the offload engine and releases the executor.
#[must_use]
pub struct Init {
    _private: (),
}

impl Init {
    pub fn new(reactor: &Reactor) -> CtxResult<Self> {
        init(reactor)?;
        Ok(Self { _private: () })
    }
}

impl Drop for Init {
    fn drop(&mut self) {
        EXITING.store(true, Ordering::Release);
        ole::shutdown();
        MAIN.lock().take();
        kinfo!("ios shutdown");
    }
}
