// HOLDFAST NETWORK FALLBACK ACTIVATION
// SHAPE-AWARE PREDICATE WITH TIME-BASED ANTI-FLAP. PURE LOGIC, NO
// SOCKETS -- THE EMITTER LIVES IN netgen AND ONLY SEES THE DECISION.
//
// THE PREDICATE IS AN AND, NEVER AN OR: TRAFFIC IS ONLY GENERATED WHEN
// EVERY METRIC THE SHAPE'S POLICY COUNTS IS AT RISK AT ONCE. IF CPU
// ALONE ALREADY PROTECTS THE INSTANCE, EMITTING PACKETS IS PURE WASTE.

#[derive(Clone, Copy, PartialEq, Eq, Debug, clap::ValueEnum)]
pub enum Mode {
    Adaptive,
    Always,
    Off,
}

impl Mode {
    pub fn label(self) -> &'static str {
        match self {
            Self::Adaptive => "ADAPTIVE",
            Self::Always => "ALWAYS",
            Self::Off => "OFF",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FallbackConfig {
    pub risk_pct: f64,
    pub counts_memory: bool,
    pub debounce_sec: u64,
    pub min_on_sec: u64,
    pub min_off_sec: u64,
    pub ema_tau_sec: f64,
    pub target_mbps: f64,
}

#[derive(Clone, Copy, Debug)]
pub struct Decision {
    pub active: bool,
    pub rate_mbps: f64,
}

pub struct NetFallback {
    cfg: FallbackConfig,
    mode: Mode,
    active: bool,
    since_ts: u64,
    last_change_ts: u64,
    has_been_active: bool,
    last_tick_ts: u64,
    commanded_mbps: f64,
    ema_net_pct: Option<f64>,
    ema_observed_mbps: f64,
}

impl NetFallback {
    pub fn new(cfg: FallbackConfig, mode: Mode, now: u64) -> Self {
        Self {
            cfg,
            mode,
            active: matches!(mode, Mode::Always),
            since_ts: now,
            last_change_ts: now,
            has_been_active: false,
            last_tick_ts: now,
            commanded_mbps: 0.0,
            ema_net_pct: None,
            ema_observed_mbps: 0.0,
        }
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn since_ts(&self) -> u64 {
        self.since_ts
    }

    pub fn ema_observed_mbps(&self) -> f64 {
        self.ema_observed_mbps
    }

    pub fn ema_net_pct(&self) -> Option<f64> {
        self.ema_net_pct
    }

    fn predicate(&self, cpu_p95: Option<f64>, mem_pct: Option<f64>) -> bool {
        // CPU RISK COMES FROM THE 7-DAY P95 -- AN UNKNOWN P95 IS NOT RISK,
        // IT IS A COLD STORE; STAY QUIET UNTIL THERE IS DATA.
        let cpu_risk = match cpu_p95 {
            Some(p) => p < self.cfg.risk_pct,
            None => false,
        };
        let net_risk = match self.ema_net_pct {
            Some(p) => p < self.cfg.risk_pct,
            None => true, // NO TRAFFIC OBSERVED AT ALL
        };
        let mem_risk = if self.cfg.counts_memory {
            match mem_pct {
                Some(p) => p < self.cfg.risk_pct,
                None => false,
            }
        } else {
            true // NOT IN THE PREDICATE FOR THIS SHAPE
        };
        cpu_risk && net_risk && mem_risk
    }

    fn flip_allowed(&self, now: u64) -> bool {
        let elapsed = now.saturating_sub(self.last_change_ts);
        if elapsed < self.cfg.debounce_sec {
            return false;
        }
        if self.active {
            elapsed >= self.cfg.min_on_sec
        } else if self.has_been_active {
            elapsed >= self.cfg.min_off_sec
        } else {
            // NEVER BEEN ON: ONLY THE DEBOUNCE HOLDS BACK FIRST ACTIVATION
            true
        }
    }

    pub fn tick(
        &mut self,
        now: u64,
        cpu_p95: Option<f64>,
        mem_pct: Option<f64>,
        net_pct: Option<f64>,
        net_mbps: Option<f64>,
    ) -> Decision {
        let dt = now.saturating_sub(self.last_tick_ts) as f64;
        self.last_tick_ts = now;
        let alpha = if self.cfg.ema_tau_sec > 0.0 {
            1.0 - (-dt / self.cfg.ema_tau_sec).exp()
        } else {
            1.0
        };

        if let Some(pct) = net_pct {
            self.ema_net_pct = Some(match self.ema_net_pct {
                Some(prev) => prev + alpha * (pct - prev),
                None => pct,
            });
        }
        if let Some(mbps) = net_mbps {
            self.ema_observed_mbps += alpha * (mbps - self.ema_observed_mbps);
        }

        let want = match self.mode {
            Mode::Always => true,
            Mode::Off => false,
            Mode::Adaptive => self.predicate(cpu_p95, mem_pct),
        };

        if want != self.active && self.flip_allowed(now) {
            self.active = want;
            self.last_change_ts = now;
            if want {
                self.since_ts = now;
                self.has_been_active = true;
            }
        }

        // SMOOTH RAMP TOWARD THE TARGET (OR TOWARD SILENCE)
        let goal = if self.active { self.cfg.target_mbps } else { 0.0 };
        self.commanded_mbps += alpha * (goal - self.commanded_mbps);
        if self.commanded_mbps < 0.01 {
            self.commanded_mbps = 0.0;
        }

        Decision {
            active: self.active,
            rate_mbps: self.commanded_mbps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> FallbackConfig {
        FallbackConfig {
            risk_pct: 22.0,
            counts_memory: false,
            debounce_sec: 30,
            min_on_sec: 300,
            min_off_sec: 120,
            ema_tau_sec: 30.0,
            target_mbps: 100.0,
        }
    }

    #[test]
    fn off_mode_never_activates() {
        let mut fb = NetFallback::new(cfg(), Mode::Off, 0);
        for t in (0..600).step_by(5) {
            let d = fb.tick(t, Some(5.0), Some(5.0), Some(5.0), None);
            assert!(!d.active);
        }
    }

    #[test]
    fn always_mode_is_on_from_the_start() {
        let mut fb = NetFallback::new(cfg(), Mode::Always, 0);
        let d = fb.tick(5, None, None, None, None);
        assert!(d.active);
    }

    #[test]
    fn unknown_p95_is_not_risk() {
        let mut fb = NetFallback::new(cfg(), Mode::Adaptive, 0);
        for t in (0..300).step_by(5) {
            let d = fb.tick(t, None, None, Some(1.0), None);
            assert!(!d.active, "activated on unknown p95 at t={}", t);
        }
    }

    #[test]
    fn ramp_approaches_target() {
        let mut fb = NetFallback::new(cfg(), Mode::Always, 0);
        let mut last = 0.0;
        for t in (5..=300).step_by(5) {
            let d = fb.tick(t, None, None, None, None);
            assert!(d.rate_mbps >= last);
            last = d.rate_mbps;
        }
        // WELL PAST TAU: ESSENTIALLY AT TARGET
        assert!(last > 99.0);
    }
}
