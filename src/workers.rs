// HOLDFAST CPU WORKERS
// ONE THREAD PER LOGICAL CORE AT THE LOWEST SCHEDULABLE PRIORITY.
// INTENSITY IS APPROXIMATED BY DUTY CYCLE: SHORT ARITHMETIC BURSTS
// (~5 MS) FOLLOWED BY A COMPUTED SLEEP, SO ANY REAL WORKLOAD PREEMPTS
// WITHIN ONE SLICE. NO MUTEXES -- INTENSITY AND PAUSE ARE ATOMICS.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

// SLEEP FOR A GIVEN BUSY SLICE AND TARGET INTENSITY SO THAT
// busy / (busy + sleep) ~= pct / 100. CAPPED SO A TINY INTENSITY CANNOT
// PARK A WORKER PAST THE CANCELLATION BOUND.
pub fn sleep_for_intensity(busy_ms: u64, pct: f64) -> Duration {
    if pct >= 100.0 {
        return Duration::ZERO;
    }
    if pct <= 0.0 {
        return Duration::from_millis(50);
    }
    let sleep_ms = busy_ms as f64 * (100.0 - pct) / pct;
    Duration::from_micros((sleep_ms * 1000.0).min(50_000.0) as u64)
}

// SCHED_IDLE IF THE KERNEL ALLOWS IT, NICE 19 AS THE FLOOR EITHER WAY.
fn drop_to_idle_priority() {
    unsafe {
        let param = libc::sched_param { sched_priority: 0 };
        libc::sched_setscheduler(0, libc::SCHED_IDLE, &param);
        libc::setpriority(libc::PRIO_PROCESS as _, 0, 19);
    }
}

pub struct WorkerPool {
    // INTENSITY IN HUNDREDTHS OF A PERCENT (35.25% -> 3525)
    intensity_cpct: Arc<AtomicU64>,
    paused: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(workers: usize, busy_slice_ms: u64, shutdown: Arc<AtomicBool>) -> Self {
        let intensity_cpct = Arc::new(AtomicU64::new(0));
        let paused = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(workers);
        for core in 0..workers {
            let intensity = Arc::clone(&intensity_cpct);
            let pause = Arc::clone(&paused);
            let stop = Arc::clone(&shutdown);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("holdfast-cpu{}", core))
                    .spawn(move || worker_loop(core as u64, busy_slice_ms, intensity, pause, stop))
                    .expect("spawn cpu worker"),
            );
        }
        Self {
            intensity_cpct,
            paused,
            handles,
        }
    }

    pub fn set_intensity(&self, pct: f64) {
        let cpct = (pct.clamp(0.0, 100.0) * 100.0) as u64;
        self.intensity_cpct.store(cpct, Ordering::Relaxed);
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    pub fn intensity(&self) -> f64 {
        self.intensity_cpct.load(Ordering::Relaxed) as f64 / 100.0
    }

    pub fn join(self) {
        for h in self.handles {
            let _ = h.join();
        }
    }
}

fn worker_loop(
    seed: u64,
    busy_slice_ms: u64,
    intensity_cpct: Arc<AtomicU64>,
    paused: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
) {
    drop_to_idle_priority();

    // XORSHIFT STATE. THE VALUE IS NEVER USED; THE MIXING IS THE WORK.
    let mut x: u64 = 0x9e37_79b9_7f4a_7c15 ^ (seed.wrapping_add(1) << 17);

    while !shutdown.load(Ordering::Relaxed) {
        let pct = intensity_cpct.load(Ordering::Relaxed) as f64 / 100.0;
        if paused.load(Ordering::Relaxed) || pct <= 0.0 {
            std::thread::sleep(Duration::from_millis(50));
            continue;
        }

        let burst_end = Instant::now() + Duration::from_millis(busy_slice_ms);
        while Instant::now() < burst_end {
            // A FEW HUNDRED MIXES BETWEEN CLOCK CHECKS
            for _ in 0..512 {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
            }
        }
        std::hint::black_box(x);

        std::thread::sleep(sleep_for_intensity(busy_slice_ms, pct));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duty_cycle_math() {
        // 50%: SLEEP EQUALS BUSY
        assert_eq!(sleep_for_intensity(5, 50.0), Duration::from_millis(5));
        // 20%: 5MS BUSY, 20MS SLEEP
        assert_eq!(sleep_for_intensity(5, 20.0), Duration::from_millis(20));
        // 100%: NO SLEEP
        assert_eq!(sleep_for_intensity(5, 100.0), Duration::ZERO);
    }

    #[test]
    fn sleep_capped_for_cancellation() {
        // 1% WOULD BE 495MS UNCAPPED -- MUST STAY WITHIN ONE SUSPENSION BOUND
        assert!(sleep_for_intensity(5, 1.0) <= Duration::from_millis(50));
        assert!(sleep_for_intensity(5, 0.0) <= Duration::from_millis(50));
    }

    #[test]
    fn intensity_round_trips_through_atomic() {
        let shutdown = Arc::new(AtomicBool::new(true)); // WORKERS EXIT AT ONCE
        let pool = WorkerPool::spawn(2, 5, shutdown);
        pool.set_intensity(35.25);
        assert!((pool.intensity() - 35.25).abs() < 0.01);
        pool.set_intensity(150.0);
        assert_eq!(pool.intensity(), 100.0);
        pool.join();
    }

    #[test]
    fn workers_stop_on_shutdown() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let pool = WorkerPool::spawn(2, 5, Arc::clone(&shutdown));
        pool.set_intensity(30.0);
        std::thread::sleep(Duration::from_millis(30));
        shutdown.store(true, Ordering::Relaxed);
        // JOIN RETURNS PROMPTLY: EVERY SLEEP IS <= 50MS
        let start = Instant::now();
        pool.join();
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
