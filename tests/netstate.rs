// HOLDFAST NETWORK FALLBACK TESTS
// SHAPE PREDICATES, DEBOUNCE / MIN-ON / MIN-OFF DISCIPLINE, EMA RAMP.
// PURE LOGIC, RUN OFFLINE.

use holdfast::netstate::{FallbackConfig, Mode, NetFallback};

fn cfg(counts_memory: bool) -> FallbackConfig {
    FallbackConfig {
        risk_pct: 22.0,
        counts_memory,
        debounce_sec: 30,
        min_on_sec: 300,
        min_off_sec: 120,
        ema_tau_sec: 10.0,
        target_mbps: 100.0,
    }
}

// === E2-SHAPE ACTIVATION CYCLE (END-TO-END SCENARIO) ===
// MEMORY POLICY DISABLED. CPU P95 19.5% AND NET EMA 18% -> BOTH AT RISK.
// ACTIVATES AFTER THE DEBOUNCE, HOLDS MIN-ON, DEACTIVATES ONCE THE CPU
// P95 CLIMBS TO 24% (MEMORY NEVER ENTERS THE PREDICATE).

#[test]
fn e2_shape_activation_cycle() {
    let mut fb = NetFallback::new(cfg(false), Mode::Adaptive, 0);

    // BOTH AT RISK FROM THE START; MEMORY LOW BUT IRRELEVANT ON E2
    let mut activated_at = None;
    for t in (5..=60).step_by(5) {
        let d = fb.tick(t, Some(19.5), Some(99.0), Some(18.0), Some(20.0));
        if d.active && activated_at.is_none() {
            activated_at = Some(t);
        }
    }
    // NOT BEFORE THE DEBOUNCE, NOT LONG AFTER IT
    assert_eq!(activated_at, Some(30));

    // CPU P95 RECOVERS AT T=100, BUT MIN-ON PINS THE GENERATOR UNTIL 330
    let mut still_on_at_325 = false;
    let mut deactivated_at = None;
    for t in (65..=400).step_by(5) {
        let cpu = if t >= 100 { 24.0 } else { 19.5 };
        let d = fb.tick(t, Some(cpu), Some(99.0), Some(18.0), Some(20.0));
        if t == 325 {
            still_on_at_325 = d.active;
        }
        if !d.active && deactivated_at.is_none() {
            deactivated_at = Some(t);
        }
    }
    assert!(still_on_at_325, "min_on violated");
    assert_eq!(deactivated_at, Some(330));
}

// === MIN-OFF AFTER A DEACTIVATION ===

#[test]
fn min_off_blocks_prompt_reactivation() {
    let mut fb = NetFallback::new(cfg(false), Mode::Adaptive, 0);

    // ON AT 30, RISK CLEARS AT 100, OFF AT 330 (AS ABOVE)
    for t in (5..=330).step_by(5) {
        let cpu = if t >= 100 { 24.0 } else { 19.5 };
        fb.tick(t, Some(cpu), None, Some(18.0), None);
    }
    assert!(!fb.active());

    // RISK RETURNS IMMEDIATELY; REACTIVATION MUST WAIT MIN-OFF (120S)
    let mut reactivated_at = None;
    for t in (335..=500).step_by(5) {
        let d = fb.tick(t, Some(19.0), None, Some(18.0), None);
        if d.active && reactivated_at.is_none() {
            reactivated_at = Some(t);
        }
    }
    assert_eq!(reactivated_at, Some(450));
}

// === THE PREDICATE IS AN AND, NOT AN OR ===

#[test]
fn no_activation_when_net_is_healthy() {
    let mut fb = NetFallback::new(cfg(false), Mode::Adaptive, 0);
    // CPU AT RISK, NETWORK WELL ABOVE THE RISK LINE
    for t in (5..=600).step_by(5) {
        let d = fb.tick(t, Some(15.0), None, Some(60.0), None);
        assert!(!d.active, "activated at t={} with healthy network", t);
    }
}

#[test]
fn memory_shape_requires_all_three() {
    let mut fb = NetFallback::new(cfg(true), Mode::Adaptive, 0);
    // CPU + NET AT RISK, MEMORY HEALTHY: STAY QUIET
    for t in (5..=300).step_by(5) {
        let d = fb.tick(t, Some(15.0), Some(60.0), Some(10.0), None);
        assert!(!d.active);
    }
    // MEMORY DROPS BELOW RISK: NOW ALL THREE AGREE
    let mut activated = false;
    for t in (305..=400).step_by(5) {
        let d = fb.tick(t, Some(15.0), Some(10.0), Some(10.0), None);
        activated = activated || d.active;
    }
    assert!(activated);
}

// === DEBOUNCE SUPPRESSES FLAPPING INPUTS ===

#[test]
fn flapping_inputs_do_not_flap_the_state() {
    let mut fb = NetFallback::new(cfg(false), Mode::Adaptive, 0);
    // GET IT ON FIRST
    for t in (5..=35).step_by(5) {
        fb.tick(t, Some(15.0), None, Some(10.0), None);
    }
    assert!(fb.active());
    let mut changes = 0;
    let mut prev = true;
    // RISK OSCILLATES EVERY TICK FOR 10 MINUTES
    for t in (40..=640).step_by(5) {
        let cpu = if (t / 5) % 2 == 0 { 15.0 } else { 30.0 };
        let d = fb.tick(t, Some(cpu), None, Some(10.0), None);
        if d.active != prev {
            changes += 1;
            prev = d.active;
        }
    }
    // MIN-ON (300S) + MIN-OFF (120S) BOUND THE FLIP COUNT HARD
    assert!(changes <= 2, "state flipped {} times under flapping input", changes);
}

// === RATE RAMP ===

#[test]
fn rate_ramps_up_and_back_down() {
    let mut fb = NetFallback::new(cfg(false), Mode::Always, 0);
    let mut peak = 0.0f64;
    for t in (5..=120).step_by(5) {
        peak = peak.max(fb.tick(t, None, None, None, None).rate_mbps);
    }
    assert!(peak > 99.0, "ramp never approached target (peak {})", peak);

    // SWITCH TO OFF VIA A FRESH MACHINE IN OFF MODE: RATE DECAYS SMOOTHLY
    let mut fb_off = NetFallback::new(cfg(false), Mode::Off, 0);
    let d = fb_off.tick(5, None, None, None, None);
    assert_eq!(d.rate_mbps, 0.0);
    assert!(!d.active);
}

#[test]
fn observed_ema_tracks_sensor() {
    let mut fb = NetFallback::new(cfg(false), Mode::Off, 0);
    for t in (5..=120).step_by(5) {
        fb.tick(t, None, None, Some(18.0), Some(40.0));
    }
    // WELL PAST TAU: EMA HAS CONVERGED ONTO THE READINGS
    assert!((fb.ema_net_pct().unwrap() - 18.0).abs() < 0.5);
    assert!((fb.ema_observed_mbps() - 40.0).abs() < 1.0);
}
