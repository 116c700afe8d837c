//! Second-order delay-locked loop
//!
//! Tracks the phase and frequency of a periodic external clock from noisy
//! position observations. Critically damped two-pole loop filter:
//! `b = √2·ω`, `c = ω²` with `ω = 2π·step/sample_rate`, where `step` is the
//! nominal advance per observation in samples.

use std::f64::consts::{PI, SQRT_2};

/// Two-pole phase/frequency tracker.
///
/// `t0`/`t1` are the filtered positions at the previous and current
/// observation; `e2` accumulates the per-step increment estimate. Feed one
/// observation per step; the smoothed rate is `(t1 - t0) / step`.
#[derive(Debug, Clone, Copy)]
pub struct Dll {
    t0: f64,
    t1: f64,
    e2: f64,
    b: f64,
    c: f64,
    step: f64,
}

impl Dll {
    /// Base the loop at an observed position. `step` is the expected
    /// advance per observation at nominal rate, in samples.
    pub fn init(position: f64, step: f64, sample_rate: u32) -> Self {
        let omega = 2.0 * PI * step / sample_rate as f64;
        Self {
            t0: position,
            t1: position + step,
            e2: step,
            b: SQRT_2 * omega,
            c: omega * omega,
            step,
        }
    }

    /// Absorb one observation. Returns the phase error that was seen.
    pub fn update(&mut self, observed: f64) -> f64 {
        let e = observed - self.t1;
        self.t0 = self.t1;
        self.t1 += self.b * e + self.e2;
        self.e2 += self.c * e;
        e
    }

    /// Filtered position at the step just absorbed
    #[inline]
    pub fn current(&self) -> f64 {
        self.t0
    }

    /// Predicted position one step ahead
    #[inline]
    pub fn predicted(&self) -> f64 {
        self.t1
    }

    /// Smoothed rate relative to nominal (1.0 = exactly on pace)
    #[inline]
    pub fn speed(&self) -> f64 {
        (self.t1 - self.t0) / self.step
    }
}
