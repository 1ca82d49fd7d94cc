//! Monotonic timestamps and current-CPU observation.
//!
//! Userspace timestamps must share a timeline with the kernel tracer, which
//! stamps records via `bpf_ktime_get_ns()`. That helper reads
//! `CLOCK_MONOTONIC`, so the same clock is used here.

use crate::topology::CpuId;

const NS_PER_SEC: u64 = 1_000_000_000;

/// Nanoseconds since boot on `CLOCK_MONOTONIC`.
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };

    // clock_gettime cannot fail for CLOCK_MONOTONIC with a valid pointer.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }

    (ts.tv_sec as u64) * NS_PER_SEC + ts.tv_nsec as u64
}

/// CPU the calling thread is currently running on, or 0 if unavailable.
pub fn current_cpu() -> CpuId {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        return 0;
    }
    cpu as CpuId
}
