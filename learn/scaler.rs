//! Dynamic loss scaling for mixed-precision training.
//!
//! The loss gradient is multiplied by the current scale before backprop. If any scaled
//! gradient is non-finite or outside the half-precision range the step is skipped and
//! the scale halves; after `GROWTH_INTERVAL` consecutive clean steps it doubles.

use ndarray::Array2;

pub const INITIAL_SCALE: f32 = 65536.0;
pub const GROWTH_INTERVAL: u32 = 2000;
/// Largest finite half-precision value.
pub const HALF_MAX: f32 = 65504.0;

#[derive(Debug, Clone, PartialEq)]
pub struct LossScaler {
    enabled: bool,
    scale: f32,
    clean_steps: u32,
    skipped_steps: u64,
}

impl LossScaler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            scale: INITIAL_SCALE,
            clean_steps: 0,
            skipped_steps: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Factor to multiply the loss gradient by; 1 when disabled.
    pub fn scale(&self) -> f32 {
        if self.enabled { self.scale } else { 1.0 }
    }

    pub fn skipped_steps(&self) -> u64 {
        self.skipped_steps
    }

    /// Checks scaled gradients and unscales them in place. Returns `false` when the
    /// step must be skipped.
    pub fn unscale(&mut self, grads: &mut [Array2<f32>]) -> bool {
        if !self.enabled {
            return true;
        }
        let overflow = grads
            .iter()
            .flat_map(|g| g.iter())
            .any(|g| !g.is_finite() || g.abs() > HALF_MAX);
        if overflow {
            self.scale *= 0.5;
            self.clean_steps = 0;
            self.skipped_steps += 1;
            log::debug!("Gradient overflow, skipping step; loss scale now {}", self.scale);
            return false;
        }

        let inv = 1.0 / self.scale;
        for g in grads.iter_mut() {
            g.mapv_inplace(|v| v * inv);
        }
        self.clean_steps += 1;
        if self.clean_steps == GROWTH_INTERVAL {
            self.scale *= 2.0;
            self.clean_steps = 0;
        }
        true
    }
}
