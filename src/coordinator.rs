// HOLDFAST COORDINATOR
// THE 5-SECOND CONTROL LOOP. EACH TICK: SENSE, PERSIST, DECIDE, GATE,
// PROGRAM WORKERS, STEP THE OCCUPIER, STEER THE GENERATOR, EMIT ONE
// TELEMETRY LINE. THE SAMPLE IS PERSISTED BEFORE THE CONTROLLER DECIDES
// ON IT, AND THE CONTROLLER SEES THE GATE VERDICT SO THE RING RECORDS
// WHAT RAN.
//
// THE SAFETY GATE IS A SCHMITT TRIGGER ON PER-CORE LOAD: HOT AT
// load_threshold, COOL AGAIN ONLY BELOW load_resume. WHILE HOT THE
// WORKERS ARE SCALED DOWN IN PROPORTION (TO ZERO PAST TWICE THE
// THRESHOLD) SO CO-TENANT WORK ALWAYS WINS.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::cli::WarnLimiter;
use crate::clock;
use crate::config::Config;
use crate::controller::{GateVerdict, P95Controller};
use crate::log_info;
use crate::log_warn;
use crate::memory::{plan_step, MemoryOccupier, StepInputs};
use crate::metrics::{MetricsStore, SampleKind};
use crate::netgen::GenControl;
use crate::netstate::NetFallback;
use crate::sensors::{Readings, Sensors};
use crate::telemetry::{Snapshot, TelemetryLog};
use crate::workers::WorkerPool;

// WORKER SCALE WHILE THE LOAD GATE IS HOT. PROPORTIONAL BACK-OFF,
// HARD ZERO PAST TWICE THE THRESHOLD.
pub fn gate_scale(load_per_core: f64, threshold: f64) -> f64 {
    if load_per_core >= 2.0 * threshold {
        0.0
    } else if load_per_core > 0.0 {
        (threshold / load_per_core).min(1.0)
    } else {
        1.0
    }
}

pub struct Coordinator {
    cfg: Config,
    store: Arc<MetricsStore>,
    controller: P95Controller,
    pool: WorkerPool,
    occupier: MemoryOccupier,
    fallback: NetFallback,
    gen_control: Arc<GenControl>,
    pub telemetry: TelemetryLog,
    shutdown: Arc<AtomicBool>,
    load_gate_hot: bool,
    last_load: f64,
    tick_count: u64,
    sensor_warn: WarnLimiter,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Config,
        store: Arc<MetricsStore>,
        controller: P95Controller,
        pool: WorkerPool,
        occupier: MemoryOccupier,
        fallback: NetFallback,
        gen_control: Arc<GenControl>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            cfg,
            store,
            controller,
            pool,
            occupier,
            fallback,
            gen_control,
            telemetry: TelemetryLog::new(),
            shutdown,
            load_gate_hot: false,
            last_load: 0.0,
            tick_count: 0,
            sensor_warn: WarnLimiter::new(300),
        }
    }

    pub fn load_gate_hot(&self) -> bool {
        self.load_gate_hot
    }

    pub fn controller(&self) -> &P95Controller {
        &self.controller
    }

    // ONE TICK OVER A FIXED SET OF READINGS. PURE ENOUGH TO DRIVE FROM
    // TESTS WITH FABRICATED SENSOR DATA.
    pub fn tick(&mut self, now: u64, r: Readings) {
        self.tick_count += 1;

        // 1. PERSIST WHAT WE SAW. MISSING READINGS ARE SKIPPED, NEVER
        //    FABRICATED.
        if let Some(v) = r.cpu_pct {
            self.store.record(SampleKind::Cpu, v, now);
        }
        if let Some(v) = r.mem_pct {
            self.store.record(SampleKind::Mem, v, now);
        }
        if let Some(v) = r.net_pct {
            self.store.record(SampleKind::Net, v, now);
        }
        if let Some(v) = r.load_per_core {
            self.store.record(SampleKind::Load, v, now);
        }
        // THE FIRST TICK HAS NO CPU/NET DELTAS YET; AFTER THAT A MISSING
        // READING IS A FAULT WORTH (RATE-LIMITED) NOISE.
        if self.tick_count > 1
            && (r.mem_pct.is_none() || r.cpu_pct.is_none() || r.load_per_core.is_none())
        {
            if let Some(suppressed) = self.sensor_warn.fire(now) {
                log_warn!(
                    "SENSOR READINGS MISSING THIS TICK ({} EARLIER WARNINGS SUPPRESSED)",
                    suppressed
                );
            }
        }

        // 2. REFRESH THE CACHED P95 AND LET THE STATE MACHINE MOVE.
        let (p95, p95_ok) = self.store.p95(SampleKind::Cpu, now);
        self.controller.observe_p95(p95, p95_ok);

        // 3. SAFETY GATE.
        if let Some(load) = r.load_per_core {
            self.last_load = load;
            if self.load_gate_hot {
                if load < self.cfg.load_resume {
                    self.load_gate_hot = false;
                    log_info!("LOAD GATE COOL ({:.2}/CORE) -- RESUMING", load);
                }
            } else if load >= self.cfg.load_threshold {
                self.load_gate_hot = true;
                log_warn!("LOAD GATE HOT ({:.2}/CORE) -- WORKERS PAUSED", load);
            }
        }
        let cpu_stop_hit = r
            .cpu_pct
            .map_or(false, |c| c >= self.cfg.cpu_stop_pct);
        let load_zeroed =
            self.load_gate_hot && gate_scale(self.last_load, self.cfg.load_threshold) <= 0.0;
        let gate = GateVerdict {
            force_baseline: self.load_gate_hot || cpu_stop_hit,
            zero_duty: cpu_stop_hit || load_zeroed,
        };

        // 4. SLOT DECISION, POST-GATE.
        let decision = self.controller.tick(now, gate);
        let mut intensity = decision.intensity_now;
        if self.load_gate_hot && !gate.zero_duty {
            intensity *= gate_scale(self.last_load, self.cfg.load_threshold);
        }
        self.pool.set_paused(intensity <= 0.0);
        self.pool.set_intensity(intensity);

        // 5. MEMORY OCCUPIER.
        if let (Some(mem_pct), Some(avail_mb)) = (r.mem_pct, r.mem_avail_mb) {
            let action = plan_step(StepInputs {
                mem_pct,
                avail_mb,
                target_pct: self.cfg.mem_target_pct,
                hysteresis_pct: self.cfg.mem_hysteresis_pct,
                stop_pct: self.cfg.mem_stop_pct,
                min_free_mb: self.cfg.min_free_mb as f64,
                step_mb: self.cfg.mem_step_mb as f64,
                load_gate_hot: self.load_gate_hot,
            });
            self.occupier.step(action);
        }

        // 6. NETWORK FALLBACK.
        let net_decision = self.fallback.tick(
            now,
            self.controller.cached_p95(),
            r.mem_pct,
            r.net_pct,
            r.net_mbps,
        );
        self.gen_control
            .steer(net_decision.active, net_decision.rate_mbps);

        // 7. TELEMETRY.
        let snap = Snapshot {
            ts: now,
            cpu_pct: r.cpu_pct.unwrap_or(0.0),
            mem_pct: r.mem_pct.unwrap_or(0.0),
            net_pct: r.net_pct.unwrap_or(0.0),
            load_per_core: r.load_per_core.unwrap_or(0.0),
            cpu_p95: decision.cached_p95.unwrap_or(0.0),
            exceedance_ratio: decision.current_ratio,
            target_ratio: decision.target_ratio,
            intensity_pct: intensity,
            occupied_mb: self.occupier.occupied_mb() as u64,
            controller_state: decision.state.label(),
            net_state: self.gen_control.state().label(),
            store_health: self.store.health().label(),
        };
        println!(
            "cpu: {:>5.1}% mem: {:>5.1}% net: {:>5.1}% load: {:>4.2} p95: {:>5.1}% ratio: {:>5.2}%->{:<5.2}% int: {:>5.1}% occ: {:>6}MB gen: {:<12} store: {:<11} [{}]",
            snap.cpu_pct,
            snap.mem_pct,
            snap.net_pct,
            snap.load_per_core,
            snap.cpu_p95,
            snap.exceedance_ratio * 100.0,
            snap.target_ratio * 100.0,
            snap.intensity_pct,
            snap.occupied_mb,
            snap.net_state,
            snap.store_health,
            snap.controller_state,
        );
        self.telemetry.record(snap);
    }

    // TICK LOOP UNTIL SHUTDOWN, THEN DRAIN. THE SLEEP IS CHOPPED INTO
    // 100MS PIECES SO THE CANCELLATION BOUND HOLDS.
    pub fn run(mut self, mut sensors: Sensors) -> Result<TelemetryLog> {
        while !self.shutdown.load(Ordering::Relaxed) {
            let now = clock::now_ts();
            let readings = sensors.sample();
            self.tick(now, readings);

            let mut slept_ms = 0u64;
            while slept_ms < self.cfg.tick_sec * 1000 && !self.shutdown.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(100));
                slept_ms += 100;
            }
        }
        self.drain()
    }

    // BOUNDED DRAIN: STOP WORKERS, RELEASE MEMORY, ONE FINAL RING FLUSH.
    fn drain(mut self) -> Result<TelemetryLog> {
        log_info!("DRAINING");
        self.pool.set_paused(true);
        self.pool.join();
        self.occupier.join_toucher();
        self.occupier.release_all();
        self.gen_control.steer(false, 0.0);
        if let Err(e) = self.controller.flush() {
            log_warn!("FINAL RING FLUSH FAILED: {}", e);
        }
        Ok(self.telemetry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RING_SLOTS, SHAPE_E2_MICRO};
    use crate::controller::ControllerConfig;
    use crate::netstate::{FallbackConfig, Mode};
    use std::path::PathBuf;

    fn scratch(tag: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("holdfast-coord-{}-{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn build(dir: &PathBuf) -> Coordinator {
        let mut cfg = Config::default();
        cfg.apply_shape(SHAPE_E2_MICRO);
        cfg.storage_dir = dir.clone();
        let store = Arc::new(MetricsStore::open(dir, 300, 3600).unwrap());
        let controller = P95Controller::new(ControllerConfig {
            slot_len_sec: cfg.slot_len_sec,
            ring_slots: RING_SLOTS,
            target_ratio: cfg.target_ratio,
            p95_min: cfg.p95_min,
            p95_max: cfg.p95_max,
            p95_deadband: cfg.p95_deadband,
            high_intensity: cfg.high_intensity,
            baseline_intensity: cfg.baseline_intensity,
            max_consecutive_skipped_slots: cfg.max_consecutive_skipped_slots,
            ring_flush_every: cfg.ring_flush_every,
            ring_path: dir.join("p95_ring_buffer.json"),
        });
        let shutdown = Arc::new(AtomicBool::new(true)); // WORKERS EXIT AT ONCE
        let pool = WorkerPool::spawn(0, cfg.busy_slice_ms, Arc::clone(&shutdown));
        let occupier = MemoryOccupier::new(1).unwrap();
        let fallback = NetFallback::new(
            FallbackConfig {
                risk_pct: cfg.net_risk_pct,
                counts_memory: cfg.counts_memory,
                debounce_sec: cfg.net_debounce_sec,
                min_on_sec: cfg.net_min_on_sec,
                min_off_sec: cfg.net_min_off_sec,
                ema_tau_sec: cfg.net_ema_tau_sec,
                target_mbps: cfg.net_target_mbps(),
            },
            Mode::Off,
            0,
        );
        let gen_control = Arc::new(GenControl::new());
        Coordinator::new(
            cfg,
            store,
            controller,
            pool,
            occupier,
            fallback,
            gen_control,
            shutdown,
        )
    }

    fn readings(cpu: f64, load: f64) -> Readings {
        Readings {
            cpu_pct: Some(cpu),
            mem_pct: Some(40.0),
            mem_avail_mb: Some(4000.0),
            net_pct: Some(1.0),
            net_mbps: Some(1.0),
            load_per_core: Some(load),
        }
    }

    #[test]
    fn load_storm_pauses_within_one_tick_and_resumes_with_hysteresis() {
        let dir = scratch("storm");
        let mut coord = build(&dir);

        coord.tick(60, readings(25.0, 0.2));
        assert!(!coord.load_gate_hot());
        assert!(coord.pool.intensity() > 0.0);

        // STORM: 1.5/CORE AGAINST A 0.6 THRESHOLD -- ZEROED THIS TICK
        coord.tick(65, readings(25.0, 1.5));
        assert!(coord.load_gate_hot());
        assert_eq!(coord.pool.intensity(), 0.0);

        // 0.5 IS BELOW THRESHOLD BUT ABOVE RESUME: STILL HOT
        coord.tick(70, readings(25.0, 0.5));
        assert!(coord.load_gate_hot());

        // BELOW RESUME: COOL AGAIN
        coord.tick(75, readings(25.0, 0.3));
        assert!(!coord.load_gate_hot());
        assert!(coord.pool.intensity() > 0.0);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn storm_slot_recorded_baseline() {
        let dir = scratch("slot");
        let mut coord = build(&dir);
        // BOUNDARY TICK: COLD RING WANTS HIGH
        coord.tick(60, readings(25.0, 0.2));
        assert_eq!(coord.controller().ring().counts(), (1, 1));
        // STORM MID-SLOT: THE HIGH SLOT IS DEMOTED TO BASELINE
        coord.tick(70, readings(25.0, 1.5));
        assert_eq!(coord.controller().ring().counts(), (1, 0));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn cpu_stop_zeroes_duty() {
        let dir = scratch("stop");
        let mut coord = build(&dir);
        coord.tick(60, readings(90.0, 0.1));
        assert_eq!(coord.pool.intensity(), 0.0);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn gate_scale_shape() {
        assert_eq!(gate_scale(1.5, 0.6), 0.0); // PAST 2X: HARD ZERO
        assert!((gate_scale(0.8, 0.6) - 0.75).abs() < 1e-9);
        assert_eq!(gate_scale(0.2, 0.6), 1.0);
    }
}
