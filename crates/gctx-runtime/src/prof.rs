//! Cycle counters for handler instrumentation

/// Current value of the cheapest monotonic cycle counter
#[inline(always)]
pub fn cycles() -> u64 {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            // Safety: rdtsc has no preconditions on x86_64
            unsafe { core::arch::x86_64::_rdtsc() }
        } else if #[cfg(target_arch = "aarch64")] {
            let v: u64;
            // Safety: the virtual counter is readable from EL0 on Linux
            unsafe { core::arch::asm!("mrs {}, cntvct_el0", out(reg) v, options(nomem, nostack)) };
            v
        } else {
            crate::timer::now_ns()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycles_advance() {
        let a = cycles();
        let mut x = 0u64;
        for i in 0..10_000 {
            x = x.wrapping_add(std::hint::black_box(i));
        }
        std::hint::black_box(x);
        assert!(cycles() >= a);
    }
}
