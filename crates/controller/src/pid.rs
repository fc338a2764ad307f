// SPDX-License-Identifier: Apache-2.0

//! The PID computation.
//!
//! Gains are interpreted per second of wall time: the integral accumulates
//! `error * dt` and the derivative divides by `dt`, with `dt` measured
//! between decisions. The integral is clamped for anti-windup and keeps
//! accumulating during stability lockouts so persistent error is not
//! forgotten; it is frozen only while the controller is blind.

use phoenix_config::PidGains;

/// The terms of one PID evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PidTerms {
    /// Proportional term.
    pub p: f64,
    /// Integral term.
    pub i: f64,
    /// Derivative term.
    pub d: f64,
    /// Control output `p + i + d`.
    pub u: f64,
}

/// Discrete PID state.
#[derive(Debug, Clone)]
pub struct Pid {
    gains: PidGains,
    integral_limit: f64,
    integral: f64,
    last_error: Option<f64>,
}

impl Pid {
    /// Creates a PID with zeroed state.
    #[must_use]
    pub fn new(gains: PidGains, integral_limit: f64) -> Self {
        Self {
            gains,
            integral_limit: integral_limit.abs(),
            integral: 0.0,
            last_error: None,
        }
    }

    /// Advances the PID by one decision with the given error and elapsed
    /// seconds, returning the evaluated terms.
    pub fn update(&mut self, error: f64, dt_secs: f64) -> PidTerms {
        let dt = dt_secs.max(f64::EPSILON);
        self.integral =
            (self.integral + error * dt).clamp(-self.integral_limit, self.integral_limit);
        let derivative = match self.last_error {
            Some(last) => (error - last) / dt,
            None => 0.0,
        };
        self.last_error = Some(error);

        let p = self.gains.kp * error;
        let i = self.gains.ki * self.integral;
        let d = self.gains.kd * derivative;
        PidTerms { p, i, d, u: p + i + d }
    }

    /// The accumulated integral.
    #[must_use]
    pub fn integral(&self) -> f64 {
        self.integral
    }

    /// The error seen by the last update, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<f64> {
        self.last_error
    }

    /// Zeroes the accumulated state.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gains() -> PidGains {
        PidGains {
            kp: 0.5,
            ki: 0.1,
            kd: 0.05,
        }
    }

    #[test]
    fn first_update_has_no_derivative() {
        let mut pid = Pid::new(gains(), 1e9);
        let terms = pid.update(100.0, 60.0);
        assert_eq!(terms.p, 50.0);
        assert_eq!(terms.i, 0.1 * 100.0 * 60.0);
        assert_eq!(terms.d, 0.0);
        assert_eq!(terms.u, terms.p + terms.i + terms.d);
    }

    #[test]
    fn derivative_tracks_error_change() {
        let mut pid = Pid::new(gains(), 1e9);
        let _ = pid.update(100.0, 60.0);
        let terms = pid.update(40.0, 60.0);
        assert_eq!(terms.d, 0.05 * (40.0 - 100.0) / 60.0);
    }

    #[test]
    fn integral_clamps_for_anti_windup() {
        let mut pid = Pid::new(gains(), 500.0);
        for _ in 0..100 {
            let _ = pid.update(1_000.0, 60.0);
        }
        assert_eq!(pid.integral(), 500.0);

        let mut negative = Pid::new(gains(), 500.0);
        for _ in 0..100 {
            let _ = negative.update(-1_000.0, 60.0);
        }
        assert_eq!(negative.integral(), -500.0);
    }

    #[test]
    fn reset_zeroes_state() {
        let mut pid = Pid::new(gains(), 1e9);
        let _ = pid.update(10.0, 1.0);
        pid.reset();
        assert_eq!(pid.integral(), 0.0);
        assert_eq!(pid.last_error(), None);
    }
}
