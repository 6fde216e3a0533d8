//! Instrumented handlers
//!
//! A `Handle` is one submitted closure tagged with its descriptor. Its
//! accounting spans submission to drop: queued/alloc at construction,
//! enter/leave around the call, free when the handle goes away.

use super::descriptor::Descriptor;
use crate::config;
use crate::prof;
use crate::tls;
use std::panic::{self, AssertUnwindSafe};

/// Per-thread bookkeeping of a running handler
struct Frame {
    desc: &'static Descriptor,
    prior: Option<&'static Descriptor>,
    start: u64,
}

fn enter(desc: &'static Descriptor, latency: Option<u64>) -> Frame {
    desc.on_enter(latency);
    tls::bump_handler_epoch();
    let prior = tls::replace_handler(Some(desc));
    Frame { desc, prior, start: prof::cycles() }
}

/// The running reactor's setting; the global one off reactor threads
fn history_enabled() -> bool {
    tls::reactor().map_or_else(|| config::global().ios_history, |r| r.config.ios_history)
}

fn leave(frame: Frame) {
    let slice = prof::cycles().saturating_sub(frame.start);
    frame.desc.on_leave(slice);
    if history_enabled() {
        frame.desc.record(tls::handler_epoch(), slice);
    }
    tls::replace_handler(frame.prior);
}

/// Fault path: the leave accounting is skipped for descriptors that retain
/// faults; the handler slot is restored either way
fn fault(frame: Frame) {
    frame.desc.on_fault();
    if frame.desc.retains_faults() {
        tls::replace_handler(frame.prior);
        return;
    }
    leave(frame);
}

/// Call `f` as a handler without boxing or queueing it
pub(crate) fn invoke_inline<R>(desc: &'static Descriptor, f: impl FnOnce() -> R) -> R {
    desc.register();
    let frame = enter(desc, None);
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(r) => {
            leave(frame);
            r
        }
        Err(payload) => {
            fault(frame);
            panic::resume_unwind(payload)
        }
    }
}

pub struct Handle {
    desc: &'static Descriptor,
    f: Option<Box<dyn FnOnce()>>,
    bytes: usize,
    submitted: u64,
}

impl Handle {
    pub fn new(desc: &'static Descriptor, f: impl FnOnce() + 'static) -> Self {
        let f: Box<dyn FnOnce()> = Box::new(f);
        Self::from_box(desc, f)
    }

    pub(crate) fn from_box(desc: &'static Descriptor, f: Box<dyn FnOnce()>) -> Self {
        desc.register();
        let bytes = std::mem::size_of_val(&*f);
        desc.on_submit(bytes);
        Self { desc, f: Some(f), bytes, submitted: prof::cycles() }
    }

    #[inline]
    pub fn descriptor(&self) -> &'static Descriptor {
        self.desc
    }

    /// Run the handler; a panic is accounted as a fault and re-raised
    pub fn invoke(mut self) {
        let Some(f) = self.f.take() else {
            return;
        };
        let frame = enter(self.desc, Some(prof::cycles().saturating_sub(self.submitted)));
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(()) => leave(frame),
            Err(payload) => {
                fault(frame);
                drop(self);
                panic::resume_unwind(payload);
            }
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.f.take().is_some() {
            self.desc.on_cancel();
        }
        self.desc.on_free(self.bytes);
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").field("desc", &self.desc.name()).finish()
    }
}

/// A handle built from a `Send` closure, movable to the reactor's thread
pub(crate) struct SendHandle(Handle);

// Safety: constructed only from `Send` closures; the descriptor is `Sync`
unsafe impl Send for SendHandle {}

impl SendHandle {
    pub(crate) fn new(desc: &'static Descriptor, f: impl FnOnce() + Send + 'static) -> Self {
        Self(Handle::new(desc, f))
    }

    #[inline]
    pub(crate) fn into_local(self) -> Handle {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_invoke_accounting() {
        static TEST_INVOKE: Descriptor = Descriptor::new("test.invoke");
        let hit = Rc::new(Cell::new(false));
        let h = hit.clone();
        let handle = Handle::new(&TEST_INVOKE, move || {
            assert_eq!(tls::current_handler().map(Descriptor::name), Some("test.invoke"));
            h.set(true);
        });
        assert_eq!(TEST_INVOKE.stats().queued, 1);
        handle.invoke();
        assert!(hit.get());
        assert!(tls::current_handler().is_none());
        assert!(TEST_INVOKE.is_balanced());
        assert_eq!(TEST_INVOKE.stats().calls, 1);
    }

    #[test]
    fn test_dropped_handle_is_balanced() {
        static TEST_DROP: Descriptor = Descriptor::new("test.drop");
        drop(Handle::new(&TEST_DROP, || ()));
        assert!(TEST_DROP.is_balanced());
        assert_eq!(TEST_DROP.stats().calls, 0);
    }

    #[test]
    fn test_fault_path() {
        static TEST_FAULT: Descriptor = Descriptor::new("test.fault");
        static TEST_RETAIN: Descriptor = Descriptor::with_options("test.retain", false, true);

        let h = Handle::new(&TEST_FAULT, || panic!("handler fault"));
        assert!(panic::catch_unwind(AssertUnwindSafe(|| h.invoke())).is_err());
        let s = TEST_FAULT.stats();
        assert_eq!((s.calls, s.faults), (1, 1));
        assert!(TEST_FAULT.is_balanced());
        assert!(tls::current_handler().is_none());

        let h = Handle::new(&TEST_RETAIN, || panic!("retained fault"));
        assert!(panic::catch_unwind(AssertUnwindSafe(|| h.invoke())).is_err());
        assert_eq!(TEST_RETAIN.stats().faults, 1);
        assert!(tls::current_handler().is_none());
    }

    #[test]
    fn test_inline_nests() {
        static OUTER: Descriptor = Descriptor::new("test.outer");
        static INNER: Descriptor = Descriptor::new("test.inner");
        let v = invoke_inline(&OUTER, || {
            let inner = invoke_inline(&INNER, || tls::current_handler().map(Descriptor::name));
            assert_eq!(tls::current_handler().map(Descriptor::name), Some("test.outer"));
            inner
        });
        assert_eq!(v, Some("test.inner"));
        assert_eq!(OUTER.stats().queued, 0);
    }

    #[test]
    fn test_history_follows_reactor_config() {
        use crate::config::RuntimeConfig;
        use crate::reactor::Reactor;

        static TEST_HISTORY: Descriptor = Descriptor::new("test.history");
        static TEST_NO_HISTORY: Descriptor = Descriptor::new("test.no_history");

        let reactor = Reactor::with_config(RuntimeConfig::new().ios_history(true)).unwrap();
        invoke_inline(&TEST_HISTORY, || ());
        Handle::new(&TEST_HISTORY, || ()).invoke();
        let history = TEST_HISTORY.history();
        assert_eq!(history.len(), 2);
        assert!(history[0].0 < history[1].0);
        drop(reactor);

        let reactor = Reactor::with_config(RuntimeConfig::new().ios_history(false)).unwrap();
        invoke_inline(&TEST_NO_HISTORY, || ());
        assert!(TEST_NO_HISTORY.history().is_empty());
        drop(reactor);
    }
}
