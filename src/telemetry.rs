// HOLDFAST TELEMETRY LOG
// RECORDS PER-TICK SNAPSHOTS OF SENSORS AND CONTROLLER STATE.
// PRE-ALLOCATED RING BUFFER. NO HEAP ALLOCATION DURING MONITORING.
// WRAPS AROUND AT CAPACITY -- OLDEST ENTRIES OVERWRITTEN.

use serde::Serialize;

const MAX_SNAPSHOTS: usize = 8192;

#[derive(Clone, Copy, Serialize)]
pub struct Snapshot {
    pub ts: u64,
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub net_pct: f64,
    pub load_per_core: f64,
    pub cpu_p95: f64,
    pub exceedance_ratio: f64,
    pub target_ratio: f64,
    pub intensity_pct: f64,
    pub occupied_mb: u64,
    pub controller_state: &'static str,
    pub net_state: &'static str,
    pub store_health: &'static str,
}

impl Snapshot {
    fn zero() -> Self {
        Self {
            ts: 0,
            cpu_pct: 0.0,
            mem_pct: 0.0,
            net_pct: 0.0,
            load_per_core: 0.0,
            cpu_p95: 0.0,
            exceedance_ratio: 0.0,
            target_ratio: 0.0,
            intensity_pct: 0.0,
            occupied_mb: 0,
            controller_state: "BUILDING",
            net_state: "OFF",
            store_health: "AVAILABLE",
        }
    }
}

pub struct TelemetryLog {
    snapshots: Vec<Snapshot>,
    head: usize,
    len: usize,
}

impl TelemetryLog {
    pub fn new() -> Self {
        Self {
            snapshots: vec![Snapshot::zero(); MAX_SNAPSHOTS],
            head: 0,
            len: 0,
        }
    }

    // RECORD ONE SNAPSHOT. CALLED ONCE PER TICK FROM THE COORDINATOR.
    // OVERWRITES OLDEST ENTRY WHEN FULL.
    pub fn record(&mut self, snap: Snapshot) {
        self.snapshots[self.head] = snap;
        self.head = (self.head + 1) % MAX_SNAPSHOTS;
        if self.len < MAX_SNAPSHOTS {
            self.len += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    // ITERATE SNAPSHOTS IN CHRONOLOGICAL ORDER
    fn iter_chronological(&self) -> impl Iterator<Item = &Snapshot> {
        let start = if self.len < MAX_SNAPSHOTS { 0 } else { self.head };
        (0..self.len).map(move |i| &self.snapshots[(start + i) % MAX_SNAPSHOTS])
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        if self.len == 0 {
            return None;
        }
        let idx = (self.head + MAX_SNAPSHOTS - 1) % MAX_SNAPSHOTS;
        Some(&self.snapshots[idx])
    }

    // MACHINE-READABLE SNAPSHOT ON DEMAND
    pub fn latest_json(&self) -> Option<String> {
        self.latest().and_then(|s| serde_json::to_string(s).ok())
    }

    // SUMMARY STATISTICS AT SHUTDOWN
    pub fn summary(&self) {
        if self.len < 2 {
            return;
        }

        let snapshots: Vec<&Snapshot> = self.iter_chronological().collect();
        let n = snapshots.len() as f64;

        let avg = |f: fn(&Snapshot) -> f64| snapshots.iter().map(|s| f(s)).sum::<f64>() / n;
        let avg_cpu = avg(|s| s.cpu_pct);
        let avg_mem = avg(|s| s.mem_pct);
        let avg_net = avg(|s| s.net_pct);
        let avg_intensity = avg(|s| s.intensity_pct);

        let high_ticks = snapshots.iter().filter(|s| s.intensity_pct > 0.0).count();
        let net_on_ticks = snapshots
            .iter()
            .filter(|s| s.net_state.starts_with("ACTIVE"))
            .count();

        let first = snapshots.first().map(|s| s.ts).unwrap_or(0);
        let last = snapshots.last().map(|s| s.ts).unwrap_or(0);

        println!("\n{}", "=".repeat(50));
        println!("HOLDFAST SUMMARY");
        println!("{}", "=".repeat(50));
        println!("  AVG CPU:           {:.1}%", avg_cpu);
        println!("  AVG MEM:           {:.1}%", avg_mem);
        println!("  AVG NET:           {:.1}%", avg_net);
        println!("  AVG INTENSITY:     {:.1}%", avg_intensity);
        println!("  ACTIVE TICKS:      {}/{}", high_ticks, snapshots.len());
        println!("  NET FALLBACK ON:   {} TICKS", net_on_ticks);
        if let Some(s) = snapshots.last() {
            println!("  FINAL P95:         {:.1}% ({})", s.cpu_p95, s.controller_state);
            println!("  FINAL RATIO:       {:.2}% -> {:.2}%", s.exceedance_ratio * 100.0, s.target_ratio * 100.0);
        }
        println!("  ELAPSED:           {}s", last.saturating_sub(first));
        println!("  SAMPLES:           {}", self.len);
    }
}

impl Default for TelemetryLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(ts: u64, intensity: f64) -> Snapshot {
        let mut s = Snapshot::zero();
        s.ts = ts;
        s.intensity_pct = intensity;
        s
    }

    #[test]
    fn records_and_reports_latest() {
        let mut log = TelemetryLog::new();
        assert!(log.latest().is_none());
        log.record(snap(100, 20.0));
        log.record(snap(105, 35.0));
        assert_eq!(log.len(), 2);
        assert_eq!(log.latest().unwrap().ts, 105);
    }

    #[test]
    fn ring_wraps() {
        let mut log = TelemetryLog::new();
        for i in 0..MAX_SNAPSHOTS + 5 {
            log.record(snap(i as u64, 0.0));
        }
        assert_eq!(log.len(), MAX_SNAPSHOTS);
        let ordered: Vec<u64> = log.iter_chronological().map(|s| s.ts).collect();
        assert_eq!(ordered[0], 5); // OLDEST SURVIVING ENTRY
        assert_eq!(*ordered.last().unwrap(), (MAX_SNAPSHOTS + 4) as u64);
    }

    #[test]
    fn latest_json_is_parseable() {
        let mut log = TelemetryLog::new();
        log.record(snap(42, 35.0));
        let json = log.latest_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["ts"], 42);
        assert_eq!(value["controller_state"], "BUILDING");
    }

    #[test]
    fn summary_no_panic_when_short() {
        let log = TelemetryLog::new();
        log.summary();
        let mut log = TelemetryLog::new();
        log.record(snap(1, 0.0));
        log.summary();
    }
}
