// HOLDFAST CLI SUPPORT
// LOG MACROS + RATE-LIMITED WARNING COUNTER
//
// ALL DIAGNOSTICS GO TO STDERR. STDOUT IS RESERVED FOR THE PER-TICK
// TELEMETRY LINE AND THE SHUTDOWN SUMMARY.

pub mod check;

use std::sync::OnceLock;
use std::time::Instant;

static PROC_START: OnceLock<Instant> = OnceLock::new();

// SECONDS SINCE PROCESS START, DMESG-STYLE
pub fn uptime_s() -> f64 {
    let start = PROC_START.get_or_init(Instant::now);
    start.elapsed().as_secs_f64()
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        eprintln!("[{:>10.3}] INFO  {}", $crate::cli::uptime_s(), format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        eprintln!("[{:>10.3}] WARN  {}", $crate::cli::uptime_s(), format_args!($($arg)*))
    };
}

// RUNTIME FAULTS REPEAT (A DEAD PEER FAILS EVERY CYCLE). ONE WARNING PER
// INTERVAL PER CALL SITE, WITH A SUPPRESSION COUNT WHEN IT RE-FIRES.
pub struct WarnLimiter {
    interval_sec: u64,
    last_ts: u64,
    suppressed: u64,
}

impl WarnLimiter {
    pub fn new(interval_sec: u64) -> Self {
        Self {
            interval_sec,
            last_ts: 0,
            suppressed: 0,
        }
    }

    // Some(n) => CALLER SHOULD LOG, n = WARNINGS SWALLOWED SINCE LAST LOG
    pub fn fire(&mut self, now: u64) -> Option<u64> {
        if self.last_ts == 0 || now.saturating_sub(self.last_ts) >= self.interval_sec {
            self.last_ts = now;
            let n = self.suppressed;
            self.suppressed = 0;
            Some(n)
        } else {
            self.suppressed += 1;
            None
        }
    }
}
