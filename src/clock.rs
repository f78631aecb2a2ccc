// HOLDFAST CLOCK HELPERS
// MONOTONIC FOR INTERVALS, REALTIME FOR SAMPLE TIMESTAMPS AND SLOT MATH

pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
}

// WALL-CLOCK SECONDS. SAMPLES, SLOT INDICES AND RETENTION CUTOFFS ALL USE
// THIS BASE SO A RESTART LANDS IN THE SAME SLOT NUMBERING.
pub fn now_ts() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
    }
    ts.tv_sec as u64
}
