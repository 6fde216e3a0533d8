//! Fallback parking using std::sync::Condvar
//!
//! Used on platforms without futex support.

use super::Parking;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

pub struct FallbackParking {
    /// wake pending
    pending: Mutex<bool>,
    condvar: Condvar,
    parked: AtomicUsize,
}

impl FallbackParking {
    pub const fn new() -> Self {
        Self {
            pending: Mutex::new(false),
            condvar: Condvar::new(),
            parked: AtomicUsize::new(0),
        }
    }

    fn set_pending(&self) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }
}

impl Default for FallbackParking {
    fn default() -> Self {
        Self::new()
    }
}

impl Parking for FallbackParking {
    fn park(&self, timeout: Option<Duration>) -> bool {
        let mut guard = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if !*guard {
            self.parked.fetch_add(1, Ordering::SeqCst);
            guard = match timeout {
                Some(t) => {
                    self.condvar
                        .wait_timeout(guard, t)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self.condvar.wait(guard).unwrap_or_else(PoisonError::into_inner),
            };
            self.parked.fetch_sub(1, Ordering::SeqCst);
        }
        std::mem::replace(&mut *guard, false)
    }

    fn wake_one(&self) {
        self.set_pending();
        self.condvar.notify_one();
    }

    fn wake_all(&self) {
        self.set_pending();
        self.condvar.notify_all();
    }

    fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}
