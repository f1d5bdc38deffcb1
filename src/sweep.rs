// src/sweep.rs
//
// =============================================================================
// PULSELAB: SWEEP RULES (v 0.3 )
// =============================================================================
//
// Pure step-index -> value mapping for dynamic device parameters.
// Kept apart from any live device state: a sweep is a recipe, not a setting.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    #[default]
    Linear,
    /// Constant ratio between neighbouring steps. Start/stop must share a sign.
    Geometric,
}

/// `[start, stop]` sampled at `steps` points, endpoints included.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepRange {
    pub start: f64,
    pub stop: f64,
    pub steps: usize,
    pub rule: Interpolation,
}

impl SweepRange {
    pub fn linear(start: f64, stop: f64, steps: usize) -> Self {
        Self {
            start,
            stop,
            steps,
            rule: Interpolation::Linear,
        }
    }

    pub fn with_rule(mut self, rule: Interpolation) -> Self {
        self.rule = rule;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.steps == 0 {
            return Err("sweep needs at least one step".into());
        }
        if !self.start.is_finite() || !self.stop.is_finite() {
            return Err(format!(
                "sweep bounds must be finite (start={}, stop={})",
                self.start, self.stop
            ));
        }
        if self.rule == Interpolation::Geometric
            && (self.start == 0.0 || self.stop == 0.0 || self.start.signum() != self.stop.signum())
        {
            return Err(format!(
                "geometric sweep needs non-zero bounds of equal sign (start={}, stop={})",
                self.start, self.stop
            ));
        }
        Ok(())
    }

    /// Value at `step` (0-based). Steps past the end clamp to `stop`.
    /// A single-step sweep always yields `start`.
    pub fn value_at(&self, step: usize) -> f64 {
        if self.steps <= 1 || step == 0 {
            return self.start;
        }
        if step >= self.steps - 1 {
            return self.stop;
        }
        let t = step as f64 / (self.steps - 1) as f64;
        match self.rule {
            Interpolation::Linear => self.start + (self.stop - self.start) * t,
            Interpolation::Geometric => self.start * (self.stop / self.start).powf(t),
        }
    }

    pub fn values(&self) -> Vec<f64> {
        (0..self.steps).map(|i| self.value_at(i)).collect()
    }
}

/// A resolved dynamic schedule: either a range rule or an explicit list.
#[derive(Debug, Clone, PartialEq)]
pub enum Sweep {
    Range(SweepRange),
    List(Vec<f64>),
}

impl Sweep {
    pub fn value_at(&self, step: usize) -> f64 {
        match self {
            Sweep::Range(r) => r.value_at(step),
            Sweep::List(values) => values
                .get(step)
                .or_else(|| values.last())
                .copied()
                .unwrap_or(f64::NAN),
        }
    }
}
