//! Thread parking
//!
//! Sleep/wake for OS threads with nothing to do: a reactor waiting on its
//! remote inbox, or an offload worker waiting for jobs.
//!
//! Wakes are sticky: a wake issued while nobody is parked is remembered and
//! consumed by the next `park`, so a wake racing a thread about to park is
//! never lost.

use std::time::Duration;

/// Platform-specific parking primitive
pub trait Parking: Send + Sync {
    /// Park the calling thread until woken or `timeout` elapses
    ///
    /// Returns `true` when a wake was consumed. Callers re-check their work
    /// source regardless of the result.
    fn park(&self, timeout: Option<Duration>) -> bool;

    /// Wake one parked thread, or leave a pending wake for the next park
    fn wake_one(&self);

    /// Wake every parked thread
    fn wake_all(&self);

    /// Number of currently parked threads (hint, may be stale)
    fn parked_count(&self) -> usize;
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub use futex_linux::FutexParking as PlatformParking;
    } else {
        mod fallback;
        pub use fallback::FallbackParking as PlatformParking;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_park_timeout() {
        let parking = PlatformParking::new();
        let start = Instant::now();
        assert!(!parking.park(Some(Duration::from_millis(50))));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_wake_before_park_is_kept() {
        let parking = PlatformParking::new();
        parking.wake_one();
        let start = Instant::now();
        assert!(parking.park(Some(Duration::from_secs(5))));
        assert!(start.elapsed() < Duration::from_secs(1));
        // consumed
        assert!(!parking.park(Some(Duration::from_millis(10))));
    }

    #[test]
    fn test_wake_one() {
        let parking = Arc::new(PlatformParking::new());
        let parking2 = Arc::clone(&parking);

        let handle = thread::spawn(move || parking2.park(Some(Duration::from_secs(10))));

        while parking.parked_count() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        parking.wake_one();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_wake_all() {
        let parking = Arc::new(PlatformParking::new());
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let p = Arc::clone(&parking);
                thread::spawn(move || {
                    let start = Instant::now();
                    while start.elapsed() < Duration::from_secs(5) {
                        if p.park(Some(Duration::from_millis(100))) {
                            return true;
                        }
                    }
                    false
                })
            })
            .collect();

        while parking.parked_count() < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        // a single sticky word may be consumed by one thread; keep waking
        // until every thread has seen a wake
        let start = Instant::now();
        while handles.iter().any(|h| !h.is_finished()) && start.elapsed() < Duration::from_secs(5) {
            parking.wake_all();
            thread::sleep(Duration::from_millis(1));
        }
        for h in handles {
            assert!(h.join().unwrap());
        }
    }
}
