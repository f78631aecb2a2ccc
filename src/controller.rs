// HOLDFAST P95 CONTROLLER
// SLOT-QUANTIZED EXCEEDANCE-BUDGET STATE MACHINE. EACH ONE-MINUTE SLOT
// CARRIES ONE BIT (HIGH OR BASELINE); THE FRACTION OF HIGH SLOTS OVER THE
// 7-DAY RING IS STEERED ONTO A TARGET SO THE OBSERVED CPU P95 LANDS IN
// [p95_min, p95_max].
//
// DIRECTION-AWARE HYSTERESIS ON THE STATE MACHINE (SCHMITT TRIGGER):
// WIDE DEAD ZONES, MUST CLEARLY LEAVE THE BAND TO CHANGE STATE.
//
// THE RING RECORDS WHAT RAN, NOT WHAT WAS WANTED. A SLOT THE SAFETY GATE
// FORCED DOWN IS A BASELINE SLOT, EVEN IF THE BUDGET ASKED FOR HIGH --
// LOGGING WISHES INSTEAD OF OUTCOMES BIASES THE BUDGET AND OVERSHOOTS.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::log_warn;

pub const RING_FORMAT_VERSION: u32 = 1;
pub const RING_FILE: &str = "p95_ring_buffer.json";

// --- SLOT RING ---

// SLOTS ARE 0 (BASELINE), 1 (HIGH) OR null (UNKNOWN -- NEVER BACKFILLED).
// UNKNOWN SLOTS SIT IN NEITHER THE NUMERATOR NOR THE DENOMINATOR OF THE
// EXCEEDANCE RATIO; A RESTART GAP MUST NOT DILUTE THE BUDGET.
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct SlotRing {
    pub version: u32,
    pub slot_len_sec: u64,
    pub slots: Vec<Option<u8>>,
    pub last_slot_index: Option<u64>,
    pub last_slot_start_ts: u64,
}

impl SlotRing {
    pub fn new(capacity: usize, slot_len_sec: u64) -> Self {
        Self {
            version: RING_FORMAT_VERSION,
            slot_len_sec,
            slots: vec![None; capacity],
            last_slot_index: None,
            last_slot_start_ts: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    // WRITE ONE SLOT AT idx. INTERMEDIATE SLOTS SINCE THE LAST WRITE ARE
    // CLEARED TO UNKNOWN; INDICES AT OR BEFORE THE LAST WRITE ARE REFUSED
    // (MONOTONIC FILL, AT MOST ONE WRITE PER BOUNDARY).
    pub fn record(&mut self, idx: u64, high: bool) {
        let cap = self.capacity() as u64;
        if let Some(last) = self.last_slot_index {
            if idx <= last {
                return;
            }
            let gap = idx - last - 1;
            for i in 1..=gap.min(cap) {
                let pos = ((last + i) % cap) as usize;
                self.slots[pos] = None;
            }
        }
        self.slots[(idx % cap) as usize] = Some(high as u8);
        self.last_slot_index = Some(idx);
        self.last_slot_start_ts = idx * self.slot_len_sec;
    }

    // REWRITE THE CURRENT SLOT TO BASELINE. USED WHEN THE SAFETY GATE
    // FIRES MID-SLOT: THE HIGH INTENSITY DID NOT RUN FOR THE FULL SLOT,
    // SO THE BUDGET MUST NOT COUNT IT.
    pub fn demote_current(&mut self) -> bool {
        if let Some(last) = self.last_slot_index {
            let pos = (last % self.capacity() as u64) as usize;
            if self.slots[pos] == Some(1) {
                self.slots[pos] = Some(0);
                return true;
            }
        }
        false
    }

    pub fn counts(&self) -> (usize, usize) {
        let mut known = 0;
        let mut high = 0;
        for slot in &self.slots {
            if let Some(bit) = slot {
                known += 1;
                if *bit != 0 {
                    high += 1;
                }
            }
        }
        (known, high)
    }

    pub fn ratio(&self) -> f64 {
        let (known, high) = self.counts();
        if known == 0 {
            0.0
        } else {
            high as f64 / known as f64
        }
    }

    // CONSECUTIVE BASELINE SLOTS ENDING AT THE LAST WRITE. UNKNOWN STOPS
    // THE RUN; DERIVED FROM THE RING SO IT SURVIVES RESTART.
    pub fn trailing_baseline_run(&self) -> u32 {
        let Some(last) = self.last_slot_index else { return 0 };
        let cap = self.capacity() as u64;
        let mut run = 0u32;
        let mut idx = last;
        loop {
            match self.slots[(idx % cap) as usize] {
                Some(0) => run += 1,
                _ => break,
            }
            if idx == 0 || last - idx + 1 >= cap {
                break;
            }
            idx -= 1;
        }
        run
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("serialize ring")
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let ring: Self = serde_json::from_str(raw).context("parse ring")?;
        Ok(ring)
    }
}

// ATOMIC PERSISTENCE: UNIQUE TEMP NAME (PID + TID), FLUSH, RENAME.
// THE LIVE FILE IS NEVER TRUNCATED.
pub fn flush_ring(ring: &SlotRing, path: &Path) -> Result<()> {
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    let tmp = PathBuf::from(format!(
        "{}.{}.{}.tmp",
        path.display(),
        std::process::id(),
        tid
    ));
    let json = ring.to_json()?;
    {
        let mut f = fs::File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
        f.write_all(json.as_bytes())
            .with_context(|| format!("write {}", tmp.display()))?;
        f.sync_all().with_context(|| format!("sync {}", tmp.display()))?;
    }
    fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

// LOAD OR START FRESH. A FILE WITH DIFFERENT GEOMETRY IS DISCARDED BUT
// ITS last_slot_index IS CARRIED FORWARD -- THE INDEX IS NON-DECREASING
// ACROSS RESTARTS NO MATTER WHAT.
pub fn load_ring(path: &Path, capacity: usize, slot_len_sec: u64) -> SlotRing {
    let fresh = SlotRing::new(capacity, slot_len_sec);
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return fresh,
    };
    match SlotRing::from_json(&raw) {
        Ok(ring)
            if ring.version == RING_FORMAT_VERSION
                && ring.slot_len_sec == slot_len_sec
                && ring.capacity() == capacity =>
        {
            ring
        }
        Ok(stale) => {
            log_warn!(
                "RING FILE GEOMETRY CHANGED (v{} len={} cap={}) -- STARTING FRESH",
                stale.version,
                stale.slot_len_sec,
                stale.capacity()
            );
            let mut ring = fresh;
            ring.last_slot_index = stale.last_slot_index;
            ring.last_slot_start_ts = stale.last_slot_start_ts;
            ring
        }
        Err(e) => {
            log_warn!("RING FILE UNPARSEABLE ({}) -- STARTING FRESH", e);
            fresh
        }
    }
}

// --- STATE MACHINE ---

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CtrlState {
    Building,
    Maintaining,
    Reducing,
}

impl CtrlState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Building => "BUILDING",
            Self::Maintaining => "MAINTAINING",
            Self::Reducing => "REDUCING",
        }
    }
}

// TARGET-RATIO SHAPING PER STATE. BUILDING OVERSHOOTS THE BUDGET TO PULL
// THE P95 UP FASTER; REDUCING STARVES IT; MAINTAINING SITS ON TARGET.
pub const BUILDING_RATIO_FACTOR: f64 = 1.5;
pub const REDUCING_RATIO_FACTOR: f64 = 0.5;

pub fn state_target_ratio(state: CtrlState, configured: f64) -> f64 {
    match state {
        CtrlState::Building => (configured * BUILDING_RATIO_FACTOR).min(2.0 * configured),
        CtrlState::Maintaining => configured,
        CtrlState::Reducing => configured * REDUCING_RATIO_FACTOR,
    }
}

// MAINTAINING GETS THE FULL DEADBAND; THE TRANSIENT STATES GET HALF SO
// THEY HAND BACK CONTROL PROMPTLY ONCE THE BAND IS REACHED.
pub fn state_deadband(state: CtrlState, deadband: f64) -> f64 {
    match state {
        CtrlState::Maintaining => deadband,
        CtrlState::Building | CtrlState::Reducing => deadband * 0.5,
    }
}

pub fn next_state(state: CtrlState, p95: f64, p95_min: f64, p95_max: f64, deadband: f64) -> CtrlState {
    let d = state_deadband(state, deadband);
    match state {
        CtrlState::Building => {
            if p95 >= p95_min + d {
                CtrlState::Maintaining
            } else {
                CtrlState::Building
            }
        }
        CtrlState::Maintaining => {
            if p95 > p95_max + d {
                CtrlState::Reducing
            } else if p95 < p95_min - d {
                CtrlState::Building
            } else {
                CtrlState::Maintaining
            }
        }
        CtrlState::Reducing => {
            if p95 <= p95_max - d {
                CtrlState::Maintaining
            } else {
                CtrlState::Reducing
            }
        }
    }
}

// --- CONTROLLER ---

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub slot_len_sec: u64,
    pub ring_slots: usize,
    pub target_ratio: f64,
    pub p95_min: f64,
    pub p95_max: f64,
    pub p95_deadband: f64,
    pub high_intensity: f64,
    pub baseline_intensity: f64,
    pub max_consecutive_skipped_slots: u32,
    pub ring_flush_every: u32,
    pub ring_path: PathBuf,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct GateVerdict {
    pub force_baseline: bool,
    pub zero_duty: bool,
}

// PER-TICK TELEMETRY
#[derive(Clone, Copy, Debug)]
pub struct TickDecision {
    pub state: CtrlState,
    pub cached_p95: Option<f64>,
    pub current_ratio: f64,
    pub target_ratio: f64,
    pub intensity_now: f64,
    pub slot_advanced: bool,
    pub forced_high: bool,
}

pub struct P95Controller {
    cfg: ControllerConfig,
    ring: SlotRing,
    state: CtrlState,
    cached_p95: Option<f64>,
    current_high: bool,
    slots_since_flush: u32,
    pub flush_count: u64,
}

impl P95Controller {
    pub fn new(cfg: ControllerConfig) -> Self {
        let ring = load_ring(&cfg.ring_path, cfg.ring_slots, cfg.slot_len_sec);
        Self {
            cfg,
            ring,
            state: CtrlState::Building, // COLD START OR UNKNOWN P95
            cached_p95: None,
            current_high: false,
            slots_since_flush: 0,
            flush_count: 0,
        }
    }

    pub fn state(&self) -> CtrlState {
        self.state
    }

    pub fn ring(&self) -> &SlotRing {
        &self.ring
    }

    pub fn cached_p95(&self) -> Option<f64> {
        self.cached_p95
    }

    // FEED THE LATEST 7-DAY CPU P95. ok=false (DEGRADED STORE, EMPTY
    // WINDOW) KEEPS THE PREVIOUS CACHED VALUE; STATE ONLY MOVES ON A
    // KNOWN P95.
    pub fn observe_p95(&mut self, p95: f64, ok: bool) {
        if ok {
            self.cached_p95 = Some(p95);
        }
        if let Some(p) = self.cached_p95 {
            self.state = next_state(
                self.state,
                p,
                self.cfg.p95_min,
                self.cfg.p95_max,
                self.cfg.p95_deadband,
            );
        }
    }

    // ONE COORDINATOR TICK. DETECTS THE SLOT BOUNDARY, MAKES THE SLOT
    // DECISION, APPLIES THE GATE VERDICT, RECORDS THE FINAL OUTCOME.
    pub fn tick(&mut self, now: u64, gate: GateVerdict) -> TickDecision {
        let idx = now / self.cfg.slot_len_sec;
        let boundary = match self.ring.last_slot_index {
            Some(last) => idx > last,
            None => true,
        };

        let mut forced_high = false;
        if boundary {
            let ratio = self.ring.ratio();
            let target = state_target_ratio(self.state, self.cfg.target_ratio);
            let mut want_high = ratio < target;

            // ANTI-COLLAPSE: WHILE THE P95 SITS BELOW THE BAND, NEVER LET
            // A LONG BASELINE RUN STALL THE BUILD.
            let below_band = self.cached_p95.map_or(true, |p| p < self.cfg.p95_min);
            if !want_high
                && below_band
                && self.ring.trailing_baseline_run() >= self.cfg.max_consecutive_skipped_slots
            {
                want_high = true;
                forced_high = true;
            }

            let final_high = want_high && !gate.force_baseline;
            self.ring.record(idx, final_high);
            self.current_high = final_high;

            self.slots_since_flush += 1;
            if self.slots_since_flush >= self.cfg.ring_flush_every {
                if let Err(e) = self.flush() {
                    log_warn!("RING FLUSH FAILED: {}", e);
                }
            }
        } else if gate.force_baseline && self.current_high {
            // GATE FIRED MID-SLOT: THE HIGH SLOT DID NOT ACTUALLY RUN
            self.ring.demote_current();
            self.current_high = false;
        }

        let intensity_now = if gate.zero_duty {
            0.0
        } else if gate.force_baseline || !self.current_high {
            self.cfg.baseline_intensity
        } else {
            self.cfg.high_intensity
        };

        TickDecision {
            state: self.state,
            cached_p95: self.cached_p95,
            current_ratio: self.ring.ratio(),
            target_ratio: state_target_ratio(self.state, self.cfg.target_ratio),
            intensity_now,
            slot_advanced: boundary,
            forced_high,
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        flush_ring(&self.ring, &self.cfg.ring_path)?;
        self.slots_since_flush = 0;
        self.flush_count += 1;
        Ok(())
    }
}
