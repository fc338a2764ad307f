// SPDX-License-Identifier: Apache-2.0

//! The mode decision engine.
//!
//! One [`DecisionEngine::run_cycle`] call evaluates a full controller cycle
//! against a synthetic clock, which keeps every transition rule unit
//! testable without timers. The evaluation order is fixed:
//!
//! 1. blindness (no fresh KPI sample): hold the mode, refresh only;
//! 2. explosion hard override: jump to `Aggressive`, arm the sticky lockout;
//! 3. sticky lockout: hold (PID keeps accumulating);
//! 4. PID update;
//! 5. webhook-forced transition (bypasses stability, respects sticky);
//! 6. stability lockout: hold (PID already accumulated);
//! 7. hysteresis candidate with strict inequalities;
//! 8. oscillation guard: three or more changes in the window double the
//!    next stability period.

use crate::control_file::CurrentMetrics;
use crate::mode::{OptimizationProfile, TriggerReason};
use crate::pid::{Pid, PidTerms};
use crate::webhook::ForcedTransition;
use phoenix_config::ControllerSettings;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Everything a cycle needs from the outside world.
#[derive(Debug, Clone)]
pub struct CycleInputs {
    /// The cycle's clock.
    pub now: Instant,
    /// Optimized-pipeline cardinality; `None` when no sample exists yet.
    pub c_opt: Option<u64>,
    /// Cardinality growth rate in series/sec over the last K samples.
    pub growth_rate: f64,
    /// Observer sample sequence number; unchanged means no fresh sample.
    pub sample_seq: u64,
    /// Pending webhook-forced transition, if any.
    pub forced: Option<ForcedTransition>,
    /// KPI snapshot recorded into the control file on emission.
    pub current_metrics: CurrentMetrics,
}

/// What the controller loop should do after a cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Write a new control file (version bump).
    Emit {
        /// The profile to publish.
        profile: OptimizationProfile,
        /// Why the file is being emitted.
        trigger: TriggerReason,
        /// PID terms of this cycle, when computed.
        pid_terms: Option<PidTerms>,
        /// True when the profile changed this cycle.
        mode_changed: bool,
    },
    /// Rewrite the current file with a fresh `last_updated` only.
    Refresh,
    /// Nothing to write.
    Hold {
        /// PID terms of this cycle, when computed.
        pid_terms: Option<PidTerms>,
    },
}

/// In-memory controller state.
#[derive(Debug)]
pub struct ControllerState {
    /// The active profile.
    pub current_mode: OptimizationProfile,
    /// When the profile last changed.
    pub last_mode_change: Option<Instant>,
    /// Bounded ring of mode-change times, pruned to the oscillation window.
    pub mode_history: VecDeque<Instant>,
    /// End of the explosion sticky lockout, when armed.
    pub explosion_sticky_until: Option<Instant>,
    /// Stability-period multiplier; 2 while the oscillation guard is armed.
    pub stability_multiplier: u32,
    /// Consecutive cycles without a fresh KPI sample.
    pub stale_cycles: u32,
    last_sample_seq: u64,
    last_cycle_at: Option<Instant>,
    // (cycle time, was stable) pairs for the one-hour stability score.
    cycle_log: VecDeque<(Instant, bool)>,
}

const STABILITY_SCORE_WINDOW: Duration = Duration::from_secs(3600);

impl ControllerState {
    fn new() -> Self {
        Self {
            current_mode: OptimizationProfile::Conservative,
            last_mode_change: None,
            mode_history: VecDeque::new(),
            explosion_sticky_until: None,
            stability_multiplier: 1,
            stale_cycles: 0,
            last_sample_seq: 0,
            last_cycle_at: None,
            cycle_log: VecDeque::new(),
        }
    }

    /// Stable-cycle ratio over the last hour; 1.0 before any cycle ran.
    #[must_use]
    pub fn stability_score(&self, now: Instant) -> f64 {
        let cutoff = now.checked_sub(STABILITY_SCORE_WINDOW);
        let relevant = self
            .cycle_log
            .iter()
            .filter(|(t, _)| cutoff.map_or(true, |c| *t >= c));
        let (mut total, mut stable) = (0u64, 0u64);
        for (_, was_stable) in relevant {
            total += 1;
            if *was_stable {
                stable += 1;
            }
        }
        if total == 0 {
            1.0
        } else {
            stable as f64 / total as f64
        }
    }

    fn log_cycle(&mut self, now: Instant, stable: bool) {
        self.cycle_log.push_back((now, stable));
        while let Some((t, _)) = self.cycle_log.front() {
            if now.duration_since(*t) > STABILITY_SCORE_WINDOW {
                let _ = self.cycle_log.pop_front();
            } else {
                break;
            }
        }
    }
}

/// The decision engine: settings, PID state, and controller state.
pub struct DecisionEngine {
    settings: ControllerSettings,
    pid: Pid,
    state: ControllerState,
}

impl DecisionEngine {
    /// Creates an engine in `Conservative` with zeroed PID state.
    #[must_use]
    pub fn new(settings: ControllerSettings) -> Self {
        let pid = Pid::new(settings.pid_gains, settings.integral_limit);
        Self {
            settings,
            pid,
            state: ControllerState::new(),
        }
    }

    /// Read access to the controller state.
    #[must_use]
    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    /// The PID integral (exposed for blind-freeze assertions).
    #[must_use]
    pub fn pid_integral(&self) -> f64 {
        self.pid.integral()
    }

    /// True while the explosion sticky lockout is armed.
    #[must_use]
    pub fn in_explosion_lockout(&self, now: Instant) -> bool {
        self.state
            .explosion_sticky_until
            .is_some_and(|until| now < until)
    }

    /// Resets the Top-K-relevant state on an explicit controller signal.
    pub fn reset_pid(&mut self) {
        self.pid.reset();
    }

    /// Evaluates one controller cycle.
    pub fn run_cycle(&mut self, inputs: CycleInputs) -> CycleOutcome {
        let now = inputs.now;
        let dt = self
            .state
            .last_cycle_at
            .map(|last| now.duration_since(last).as_secs_f64())
            .unwrap_or_else(|| self.settings.cycle_interval.as_secs_f64());
        self.state.last_cycle_at = Some(now);

        // 1. Blindness: without a fresh sample there is nothing to decide.
        //    Hold the mode, freeze the PID, refresh `last_updated` only.
        let fresh = inputs.sample_seq != self.state.last_sample_seq;
        if !fresh || inputs.c_opt.is_none() {
            self.state.stale_cycles += 1;
            self.state.log_cycle(now, true);
            return CycleOutcome::Refresh;
        }
        self.state.last_sample_seq = inputs.sample_seq;
        self.state.stale_cycles = 0;
        let c_opt = inputs.c_opt.unwrap_or_default();

        // 2. Explosion hard override.
        let exploding = inputs.growth_rate > self.settings.explosion_rate_threshold
            || c_opt > self.settings.explosion_absolute_threshold;
        if exploding {
            self.state.explosion_sticky_until = Some(now + self.settings.explosion_sticky);
            let mode_changed = self.state.current_mode != OptimizationProfile::Aggressive;
            if mode_changed {
                self.transition(OptimizationProfile::Aggressive, now);
                self.state.log_cycle(now, false);
                return CycleOutcome::Emit {
                    profile: OptimizationProfile::Aggressive,
                    trigger: TriggerReason::Explosion,
                    pid_terms: None,
                    mode_changed: true,
                };
            }
            // Already aggressive: the sticky window was extended above.
            self.state.log_cycle(now, true);
            return CycleOutcome::Hold { pid_terms: None };
        }

        // 3. Sticky lockout: no mode change permitted; PID keeps
        //    accumulating so the integral reflects persistent error.
        let error = self.settings.target_ts_count as f64 - c_opt as f64;
        if self.in_explosion_lockout(now) {
            let terms = self.pid.update(error, dt);
            self.state.log_cycle(now, true);
            return CycleOutcome::Hold {
                pid_terms: Some(terms),
            };
        }
        self.state.explosion_sticky_until = None;

        // 4. PID update.
        let terms = self.pid.update(error, dt);

        // 5. Webhook-forced transition: bypasses the stability lockout.
        if let Some(forced) = inputs.forced {
            if forced.profile != self.state.current_mode {
                self.transition(forced.profile, now);
                let _ = self.refresh_oscillation_guard(now);
                self.state.log_cycle(now, false);
                return CycleOutcome::Emit {
                    profile: forced.profile,
                    trigger: TriggerReason::AnomalyWebhook,
                    pid_terms: Some(terms),
                    mode_changed: true,
                };
            }
        }

        // 6. Stability lockout.
        let stability_period =
            self.settings.stability_period * self.state.stability_multiplier;
        if let Some(last_change) = self.state.last_mode_change {
            if now.duration_since(last_change) < stability_period {
                self.state.log_cycle(now, true);
                return CycleOutcome::Hold {
                    pid_terms: Some(terms),
                };
            }
        }

        // 7. Hysteresis candidate; all comparisons are strict.
        let h = self.settings.hysteresis_factor;
        let conservative_max = self.settings.conservative_max_ts as f64;
        let aggressive_min = self.settings.aggressive_min_ts as f64;
        let candidate = match self.state.current_mode {
            OptimizationProfile::Conservative => {
                if (c_opt as f64) > conservative_max * (1.0 + h) {
                    OptimizationProfile::Balanced
                } else {
                    OptimizationProfile::Conservative
                }
            }
            OptimizationProfile::Balanced => {
                if (c_opt as f64) > aggressive_min * (1.0 + h) {
                    OptimizationProfile::Aggressive
                } else if (c_opt as f64) < conservative_max * (1.0 - h) {
                    OptimizationProfile::Conservative
                } else {
                    OptimizationProfile::Balanced
                }
            }
            OptimizationProfile::Aggressive => {
                if (c_opt as f64) < aggressive_min * (1.0 - h) {
                    OptimizationProfile::Balanced
                } else {
                    OptimizationProfile::Aggressive
                }
            }
        };

        if candidate == self.state.current_mode {
            let _ = self.refresh_oscillation_guard(now);
            self.state.log_cycle(now, true);
            return CycleOutcome::Hold {
                pid_terms: Some(terms),
            };
        }

        // 8. Oscillation guard: annotate the emission when armed, and keep
        //    the doubled stability period until the change window drains.
        self.transition(candidate, now);
        let guard_armed = self.refresh_oscillation_guard(now);
        self.state.log_cycle(now, false);
        CycleOutcome::Emit {
            profile: candidate,
            trigger: if guard_armed {
                TriggerReason::PidOscillationGuard
            } else {
                TriggerReason::Pid
            },
            pid_terms: Some(terms),
            mode_changed: true,
        }
    }

    fn transition(&mut self, to: OptimizationProfile, now: Instant) {
        self.state.current_mode = to;
        self.state.last_mode_change = Some(now);
        self.state.mode_history.push_back(now);
    }

    /// Prunes the mode-change ring to the oscillation window and updates
    /// the stability multiplier. Returns true when the guard is armed.
    fn refresh_oscillation_guard(&mut self, now: Instant) -> bool {
        while let Some(front) = self.state.mode_history.front() {
            if now.duration_since(*front) > self.settings.oscillation_window {
                let _ = self.state.mode_history.pop_front();
            } else {
                break;
            }
        }
        let armed = self.state.mode_history.len() >= self.settings.oscillation_change_limit;
        self.state.stability_multiplier = if armed { 2 } else { 1 };
        armed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ControllerSettings {
        ControllerSettings {
            conservative_max_ts: 15_000,
            aggressive_min_ts: 25_000,
            target_ts_count: 20_000,
            hysteresis_factor: 0.1,
            ..ControllerSettings::default()
        }
    }

    struct Harness {
        engine: DecisionEngine,
        epoch: Instant,
        seq: u64,
    }

    impl Harness {
        fn new(settings: ControllerSettings) -> Self {
            Self {
                engine: DecisionEngine::new(settings),
                epoch: Instant::now(),
                seq: 0,
            }
        }

        /// Runs a cycle at `t_secs` with a fresh sample of `c_opt`.
        fn cycle(&mut self, t_secs: u64, c_opt: u64) -> CycleOutcome {
            self.cycle_with_rate(t_secs, c_opt, 0.0)
        }

        fn cycle_with_rate(&mut self, t_secs: u64, c_opt: u64, rate: f64) -> CycleOutcome {
            self.seq += 1;
            self.engine.run_cycle(CycleInputs {
                now: self.epoch + Duration::from_secs(t_secs),
                c_opt: Some(c_opt),
                growth_rate: rate,
                sample_seq: self.seq,
                forced: None,
                current_metrics: CurrentMetrics::default(),
            })
        }

        /// Runs a cycle without a fresh sample.
        fn blind_cycle(&mut self, t_secs: u64) -> CycleOutcome {
            self.engine.run_cycle(CycleInputs {
                now: self.epoch + Duration::from_secs(t_secs),
                c_opt: Some(1),
                growth_rate: 0.0,
                sample_seq: self.seq,
                forced: None,
                current_metrics: CurrentMetrics::default(),
            })
        }

        fn mode(&self) -> OptimizationProfile {
            self.engine.state().current_mode
        }
    }

    fn is_emit(outcome: &CycleOutcome) -> bool {
        matches!(outcome, CycleOutcome::Emit { .. })
    }

    #[test]
    fn steady_state_never_transitions() {
        // Scenario: constant C_opt = 12 000 against 15 000/25 000
        // thresholds; 20 cycles hold Conservative with zero emissions.
        let mut h = Harness::new(settings());
        for cycle in 0..20u64 {
            let outcome = h.cycle(cycle * 60, 12_000);
            assert!(!is_emit(&outcome), "cycle {cycle} must not emit");
        }
        assert_eq!(h.mode(), OptimizationProfile::Conservative);
    }

    #[test]
    fn hysteresis_boundary_is_strict() {
        // Exactly conservative_max * (1 + h) must NOT upgrade.
        let mut h = Harness::new(settings());
        let boundary = 16_500;
        let outcome = h.cycle(0, boundary);
        assert!(!is_emit(&outcome));
        assert_eq!(h.mode(), OptimizationProfile::Conservative);

        // One series above the band upgrades.
        let outcome = h.cycle(600, boundary + 1);
        assert!(matches!(
            outcome,
            CycleOutcome::Emit {
                profile: OptimizationProfile::Balanced,
                trigger: TriggerReason::Pid,
                mode_changed: true,
                ..
            }
        ));
    }

    #[test]
    fn gradual_rise_takes_two_gated_transitions() {
        // C_opt rises 10 000 -> 30 000 over 30 one-minute cycles; exactly
        // Conservative -> Balanced -> Aggressive with the stability lockout
        // respected between them.
        let mut h = Harness::new(settings());
        let mut emissions = Vec::new();
        for cycle in 0..30u64 {
            let c_opt = 10_000 + cycle * 690; // ~linear to 30 010
            if let CycleOutcome::Emit { profile, .. } = h.cycle(cycle * 60, c_opt) {
                emissions.push((cycle, profile));
            }
        }
        assert_eq!(emissions.len(), 2, "exactly two transitions: {emissions:?}");
        assert_eq!(emissions[0].1, OptimizationProfile::Balanced);
        assert_eq!(emissions[1].1, OptimizationProfile::Aggressive);
        // First upgrade at the first cycle with C_opt > 16 500.
        assert_eq!(emissions[0].0, 10); // 10_000 + 10*690 = 16_900
        // Stability lockout of 120 s respected between the transitions.
        assert!((emissions[1].0 - emissions[0].0) * 60 >= 120);
        assert_eq!(h.mode(), OptimizationProfile::Aggressive);
    }

    #[test]
    fn oscillation_guard_doubles_stability_period() {
        // A square wave crossing both hysteresis edges every cycle. Before
        // the guard arms the mode may flap at the 60 s stability period;
        // once three changes land inside the window, emissions carry the
        // guard annotation and changes slow to the doubled 120 s period.
        let mut cfg = settings();
        cfg.hysteresis_factor = 0.05; // band edges 14 250 / 15 750
        cfg.stability_period = Duration::from_secs(60);
        let mut h = Harness::new(cfg);

        let mut changes = Vec::new();
        for cycle in 0..20u64 {
            let c_opt = if cycle % 2 == 0 { 17_000 } else { 14_000 };
            if let CycleOutcome::Emit { trigger, .. } = h.cycle(cycle * 60, c_opt) {
                changes.push((cycle * 60, trigger));
            }
        }
        assert!(changes.len() >= 4, "square wave must flap first: {changes:?}");

        // The third change arms the guard and is annotated.
        assert_eq!(changes[0].1, TriggerReason::Pid);
        assert_eq!(changes[1].1, TriggerReason::Pid);
        assert_eq!(changes[2].1, TriggerReason::PidOscillationGuard);
        assert_eq!(h.engine.state().stability_multiplier, 2);

        // Before arming: changes 60 s apart. After arming: at least 120 s.
        assert_eq!(changes[1].0 - changes[0].0, 60);
        assert_eq!(changes[2].0 - changes[1].0, 60);
        for pair in changes[2..].windows(2) {
            assert!(
                pair[1].0 - pair[0].0 >= 120,
                "armed guard must slow changes: {changes:?}"
            );
            assert_eq!(pair[1].1, TriggerReason::PidOscillationGuard);
        }
    }

    #[test]
    fn explosion_jumps_to_aggressive_and_sticks() {
        let mut h = Harness::new(settings());
        // 18 000 series is ordinary Balanced territory.
        let _ = h.cycle(0, 18_000);
        assert_eq!(h.mode(), OptimizationProfile::Balanced);

        // Jump to 1.2M series: absolute threshold crossed.
        let outcome = h.cycle(60, 1_200_000);
        assert!(matches!(
            outcome,
            CycleOutcome::Emit {
                profile: OptimizationProfile::Aggressive,
                trigger: TriggerReason::Explosion,
                ..
            }
        ));

        // C_opt returns to normal; the sticky lockout still holds for the
        // full ten minutes.
        for cycle in 2..11u64 {
            let outcome = h.cycle(cycle * 60, 18_000);
            assert!(!is_emit(&outcome), "cycle {cycle} must hold during sticky");
            assert_eq!(h.mode(), OptimizationProfile::Aggressive);
        }

        // Sticky armed at t=60 for 600 s; the first decision past t=660
        // may downgrade again (18 000 < 25 000 * 0.9).
        let outcome = h.cycle(12 * 60, 18_000);
        assert!(matches!(
            outcome,
            CycleOutcome::Emit {
                profile: OptimizationProfile::Balanced,
                ..
            }
        ));
    }

    #[test]
    fn explosion_by_growth_rate_alone() {
        let mut h = Harness::new(settings());
        let outcome = h.cycle_with_rate(0, 12_000, 15_000.0);
        assert!(matches!(
            outcome,
            CycleOutcome::Emit {
                trigger: TriggerReason::Explosion,
                ..
            }
        ));
    }

    #[test]
    fn pid_accumulates_during_sticky_lockout() {
        let mut h = Harness::new(settings());
        let _ = h.cycle(0, 1_200_000); // explosion
        let integral_before = h.engine.pid_integral();
        let _ = h.cycle(60, 30_000); // sticky hold, PID active
        assert!(
            h.engine.pid_integral() != integral_before,
            "integral must keep accumulating during the sticky window"
        );
    }

    #[test]
    fn blind_cycles_refresh_and_freeze_pid() {
        let mut h = Harness::new(settings());
        let _ = h.cycle(0, 22_000);
        let integral = h.engine.pid_integral();
        let mode = h.mode();

        for cycle in 1..4u64 {
            let outcome = h.blind_cycle(cycle * 60);
            assert_eq!(outcome, CycleOutcome::Refresh, "blind cycle {cycle}");
        }
        assert_eq!(h.engine.pid_integral(), integral);
        assert_eq!(h.mode(), mode);
        assert_eq!(h.engine.state().stale_cycles, 3);
    }

    #[test]
    fn webhook_force_bypasses_stability_but_not_sticky() {
        let mut h = Harness::new(settings());
        // Recent change arms the stability lockout.
        let _ = h.cycle(0, 17_000);
        assert_eq!(h.mode(), OptimizationProfile::Balanced);

        // A forced transition right after still applies.
        h.seq += 1;
        let outcome = h.engine.run_cycle(CycleInputs {
            now: h.epoch + Duration::from_secs(60),
            c_opt: Some(17_000),
            growth_rate: 0.0,
            sample_seq: h.seq,
            forced: Some(ForcedTransition {
                profile: OptimizationProfile::Aggressive,
                anomaly_id: "a-1".to_owned(),
            }),
            current_metrics: CurrentMetrics::default(),
        });
        assert!(matches!(
            outcome,
            CycleOutcome::Emit {
                trigger: TriggerReason::AnomalyWebhook,
                profile: OptimizationProfile::Aggressive,
                ..
            }
        ));
    }

    #[test]
    fn stability_score_tracks_changes() {
        let mut h = Harness::new(settings());
        for cycle in 0..10u64 {
            let _ = h.cycle(cycle * 60, 12_000);
        }
        let now = h.epoch + Duration::from_secs(600);
        assert_eq!(h.engine.state().stability_score(now), 1.0);

        let _ = h.cycle(660, 17_000); // one change in 11 cycles
        let now = h.epoch + Duration::from_secs(660);
        let score = h.engine.state().stability_score(now);
        assert!((score - 10.0 / 11.0).abs() < 1e-9);
    }
}
