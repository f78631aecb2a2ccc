// HOLDFAST CONFIGURATION
// FLAT OPTION SET. PRECEDENCE: EXPLICIT CLI OVERRIDE > SHAPE TEMPLATE > DEFAULT.
// CROSS-PARAMETER VALIDATION IS FATAL AT STARTUP -- A MISCONFIGURED SHAPER
// IS WORSE THAN NO SHAPER.

use std::path::PathBuf;

use anyhow::{bail, Result};

use crate::netstate::Mode;

// --- PROVIDER POLICY CONSTANTS ---
// THE RECLAMATION FLOOR IS 20% SUSTAINED OVER 7 DAYS. EVERYTHING BELOW
// DERIVES FROM THOSE TWO NUMBERS.

pub const RECLAIM_FLOOR_PCT: f64 = 20.0;
pub const RETENTION_SEC: u64 = 7 * 24 * 3600;
pub const RING_SLOTS: usize = 7 * 24 * 60; // 10080 ONE-MINUTE SLOTS

// --- SHAPE TEMPLATES ---
// WHICH METRICS THE PROVIDER COUNTS DIFFERS PER SHAPE. MEMORY IS ONLY IN
// THE IDLE PREDICATE ON FLEX SHAPES; MICRO SHAPES COUNT CPU AND NETWORK.

#[derive(Clone, Copy, Debug)]
pub struct ShapeTemplate {
    pub name: &'static str,
    pub counts_memory: bool,
    pub requires_external_egress: bool,
    pub link_mbit: f64,
    pub mem_target_pct: f64,
}

pub const SHAPE_E2_MICRO: ShapeTemplate = ShapeTemplate {
    name: "e2-micro",
    counts_memory: false,
    requires_external_egress: true,
    link_mbit: 480.0,
    mem_target_pct: 0.0, // MEMORY NOT IN THE PREDICATE -- OCCUPIER DORMANT
};

pub const SHAPE_A1_FLEX: ShapeTemplate = ShapeTemplate {
    name: "a1-flex",
    counts_memory: true,
    requires_external_egress: true,
    link_mbit: 1000.0,
    mem_target_pct: 30.0,
};

pub fn shape_by_name(name: &str) -> Option<ShapeTemplate> {
    match name {
        "e2-micro" => Some(SHAPE_E2_MICRO),
        "a1-flex" => Some(SHAPE_A1_FLEX),
        _ => None,
    }
}

// --- THE FULL OPTION SET ---

#[derive(Clone, Debug)]
pub struct Config {
    // CADENCE
    pub tick_sec: u64,
    pub slot_len_sec: u64,

    // P95 CONTROLLER
    pub target_ratio: f64,    // LONG-RUN FRACTION OF HIGH SLOTS
    pub p95_min: f64,         // TARGET BAND, PERCENT CPU
    pub p95_max: f64,
    pub p95_deadband: f64,    // FULL WIDTH IN MAINTAINING, HALVED ELSEWHERE
    pub high_intensity: f64,
    pub baseline_intensity: f64,
    pub max_consecutive_skipped_slots: u32,
    pub ring_flush_every: u32,

    // METRICS STORE
    pub p95_cache_ttl_sec: u64,
    pub integrity_probe_interval_sec: u64,
    pub purge_interval_sec: u64,

    // SAFETY GATE
    pub load_threshold: f64,  // PER-CORE 1-MINUTE LOAD THAT PAUSES WORKERS
    pub load_resume: f64,     // MUST DROP BELOW THIS TO RESUME
    pub cpu_stop_pct: f64,    // INSTANTANEOUS CPU THAT ZEROES DUTY FOR A TICK

    // CPU WORKERS
    pub busy_slice_ms: u64,
    pub workers: Option<usize>, // DEFAULT: ONE PER LOGICAL CORE

    // MEMORY OCCUPIER
    pub mem_target_pct: f64,  // 0 = DORMANT
    pub mem_stop_pct: f64,
    pub mem_hysteresis_pct: f64,
    pub mem_step_mb: usize,
    pub min_free_mb: u64,
    pub touch_interval_ms: u64,

    // NETWORK FALLBACK
    pub net_mode: Mode,
    pub net_risk_pct: f64,    // AT-RISK THRESHOLD FOR THE ACTIVATION PREDICATE
    pub net_debounce_sec: u64,
    pub net_min_on_sec: u64,
    pub net_min_off_sec: u64,
    pub net_ema_tau_sec: f64,
    pub net_target_pct: f64,  // TARGET EGRESS AS PERCENT OF LINK BANDWIDTH
    pub net_port: u16,
    pub net_peers: Vec<String>,
    pub net_packet_bytes: usize,
    pub net_ttl: u32,
    pub net_validation_interval_sec: u64,
    pub net_validation_timeout_ms: u64,
    pub net_min_tx_delta: u64,
    pub net_validation_misses: u32, // CONSECUTIVE SHORT DELTAS BEFORE FALLBACK
    pub net_err_threshold: u32,     // CONSECUTIVE SEND ERRORS BEFORE FALLBACK
    pub net_rep_floor: f64,
    pub net_error_cooldown_sec: u64,

    // ENVIRONMENT
    pub nic: Option<String>,
    pub link_mbit: Option<f64>, // OVERRIDES /sys SPEED (VIRTIO REPORTS -1)
    pub storage_dir: PathBuf,
    pub allow_non_mount: bool,
    pub shape: ShapeTemplate,
    pub counts_memory: bool,
    pub requires_external_egress: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_sec: 5,
            slot_len_sec: 60,

            target_ratio: 0.065,
            p95_min: 22.0,
            p95_max: 28.0,
            p95_deadband: 1.0,
            high_intensity: 35.0,
            baseline_intensity: 20.0,
            max_consecutive_skipped_slots: 15,
            ring_flush_every: 10,

            p95_cache_ttl_sec: 300,
            integrity_probe_interval_sec: 3600,
            purge_interval_sec: 600,

            load_threshold: 0.6,
            load_resume: 0.4,
            cpu_stop_pct: 85.0,

            busy_slice_ms: 5,
            workers: None,

            mem_target_pct: 0.0,
            mem_stop_pct: 90.0,
            mem_hysteresis_pct: 2.0,
            mem_step_mb: 64,
            min_free_mb: 512,
            touch_interval_ms: 1000,

            net_mode: Mode::Adaptive,
            net_risk_pct: 22.0,
            net_debounce_sec: 30,
            net_min_on_sec: 300,
            net_min_off_sec: 120,
            net_ema_tau_sec: 30.0,
            net_target_pct: 25.0,
            net_port: 15201,
            net_peers: Vec::new(),
            net_packet_bytes: 8900,
            net_ttl: 7,
            net_validation_interval_sec: 60,
            net_validation_timeout_ms: 2000,
            net_min_tx_delta: 65536,
            net_validation_misses: 3,
            net_err_threshold: 5,
            net_rep_floor: 20.0,
            net_error_cooldown_sec: 120,

            nic: None,
            link_mbit: None,
            storage_dir: PathBuf::from("/var/lib/holdfast"),
            allow_non_mount: false,
            shape: SHAPE_E2_MICRO,
            counts_memory: SHAPE_E2_MICRO.counts_memory,
            requires_external_egress: SHAPE_E2_MICRO.requires_external_egress,
        }
    }
}

impl Config {
    // TEMPLATE LAYER. CALLED BEFORE EXPLICIT OVERRIDES SO OVERRIDES WIN.
    pub fn apply_shape(&mut self, shape: ShapeTemplate) {
        self.shape = shape;
        self.counts_memory = shape.counts_memory;
        self.requires_external_egress = shape.requires_external_egress;
        self.mem_target_pct = shape.mem_target_pct;
        if self.link_mbit.is_none() {
            self.link_mbit = Some(shape.link_mbit);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.p95_min >= self.p95_max {
            bail!(
                "p95-min ({}) must be below p95-max ({})",
                self.p95_min,
                self.p95_max
            );
        }
        if self.baseline_intensity >= self.high_intensity {
            bail!(
                "baseline-intensity ({}) must be below high-intensity ({})",
                self.baseline_intensity,
                self.high_intensity
            );
        }
        if self.baseline_intensity < RECLAIM_FLOOR_PCT {
            bail!(
                "baseline-intensity ({}) is below the {}% reclamation floor; \
                 off slots would no longer protect the instance",
                self.baseline_intensity,
                RECLAIM_FLOOR_PCT
            );
        }
        if !(self.target_ratio > 0.0 && self.target_ratio < 1.0) {
            bail!("target-ratio ({}) must be inside (0, 1)", self.target_ratio);
        }
        if self.net_debounce_sec > self.net_min_on_sec
            || self.net_debounce_sec > self.net_min_off_sec
        {
            bail!(
                "net-debounce ({}) must not exceed net-min-on ({}) or net-min-off ({})",
                self.net_debounce_sec,
                self.net_min_on_sec,
                self.net_min_off_sec
            );
        }
        if self.load_resume >= self.load_threshold {
            bail!(
                "load-resume ({}) must be below load-threshold ({})",
                self.load_resume,
                self.load_threshold
            );
        }
        if self.cpu_stop_pct <= self.high_intensity {
            bail!(
                "cpu-stop ({}) must be above high-intensity ({})",
                self.cpu_stop_pct,
                self.high_intensity
            );
        }
        if self.mem_target_pct > 0.0 && self.mem_stop_pct <= self.mem_target_pct {
            bail!(
                "mem-stop ({}) must be above mem-target ({})",
                self.mem_stop_pct,
                self.mem_target_pct
            );
        }
        if self.tick_sec == 0 || self.slot_len_sec == 0 {
            bail!("tick ({}) and slot-len ({}) must be nonzero", self.tick_sec, self.slot_len_sec);
        }
        if self.slot_len_sec < self.tick_sec {
            bail!(
                "slot-len ({}) must be at least one tick ({})",
                self.slot_len_sec,
                self.tick_sec
            );
        }
        if self.net_packet_bytes == 0 || self.net_packet_bytes > 65507 {
            bail!(
                "net-packet-bytes ({}) must fit a UDP datagram",
                self.net_packet_bytes
            );
        }
        if self.ring_flush_every == 0 {
            bail!("ring-flush-every must be nonzero");
        }
        Ok(())
    }

    pub fn net_target_mbps(&self) -> f64 {
        let link = self.link_mbit.unwrap_or(self.shape.link_mbit);
        link * self.net_target_pct / 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn shape_templates_validate() {
        for shape in [SHAPE_E2_MICRO, SHAPE_A1_FLEX] {
            let mut cfg = Config::default();
            cfg.apply_shape(shape);
            cfg.validate().unwrap();
        }
    }

    #[test]
    fn inverted_band_rejected() {
        let mut cfg = Config::default();
        cfg.p95_min = 28.0;
        cfg.p95_max = 22.0;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("p95-min"));
    }

    #[test]
    fn baseline_below_floor_rejected() {
        let mut cfg = Config::default();
        cfg.baseline_intensity = 15.0;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("reclamation floor"));
    }

    #[test]
    fn baseline_above_high_rejected() {
        let mut cfg = Config::default();
        cfg.baseline_intensity = 40.0;
        cfg.high_intensity = 35.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn contradictory_debounce_rejected() {
        let mut cfg = Config::default();
        cfg.net_debounce_sec = 500;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("net-debounce"));
    }

    #[test]
    fn shape_template_sets_policy() {
        let mut cfg = Config::default();
        cfg.apply_shape(SHAPE_A1_FLEX);
        assert!(cfg.counts_memory);
        assert_eq!(cfg.mem_target_pct, 30.0);
        assert_eq!(cfg.link_mbit, Some(1000.0));
    }

    #[test]
    fn explicit_link_override_survives_shape() {
        let mut cfg = Config::default();
        cfg.link_mbit = Some(50.0); // EXPLICIT OVERRIDE APPLIED FIRST
        cfg.apply_shape(SHAPE_E2_MICRO);
        assert_eq!(cfg.link_mbit, Some(50.0));
    }

    #[test]
    fn net_target_mbps_follows_link() {
        let mut cfg = Config::default();
        cfg.apply_shape(SHAPE_E2_MICRO);
        // 25% OF 480 MBIT
        assert!((cfg.net_target_mbps() - 120.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_shape_name() {
        assert!(shape_by_name("m7-ultra").is_none());
        assert_eq!(shape_by_name("e2-micro").unwrap().name, "e2-micro");
    }
}
