//! Dynamic loss scaling for reduced-precision training steps

use super::Tensor;

/// Dynamic gradient scaler.
///
/// The loss is multiplied by `scale` before the backward pass so small
/// gradients survive a reduced-precision representation; gradients are
/// divided by the same factor before the optimizer step. The scale grows
/// after `growth_interval` consecutive overflow-free steps and backs off
/// whenever an overflow is detected.
#[derive(Debug, Clone)]
pub struct GradScaler {
    scale: f32,
    growth_factor: f32,
    backoff_factor: f32,
    growth_interval: usize,
    successful_steps: usize,
    overflow_count: usize,
}

impl Default for GradScaler {
    fn default() -> Self {
        Self::new(65536.0)
    }
}

impl GradScaler {
    /// Create a scaler with the given initial scale
    pub fn new(initial_scale: f32) -> Self {
        assert!(
            initial_scale > 0.0 && initial_scale.is_finite(),
            "initial scale must be positive and finite, got {initial_scale}"
        );
        Self {
            scale: initial_scale,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            successful_steps: 0,
            overflow_count: 0,
        }
    }

    /// Current scale factor
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Number of overflows observed so far
    pub fn overflow_count(&self) -> usize {
        self.overflow_count
    }

    /// Scale a loss value
    pub fn scale_value(&self, value: f32) -> f32 {
        value * self.scale
    }

    /// Divide accumulated gradients by the scale, reporting whether all of
    /// them are finite. Non-finite gradients are left untouched; the caller
    /// should skip the optimizer step and call [`GradScaler::update`] with
    /// `false`.
    pub fn unscale_and_check(&self, params: &[Tensor]) -> bool {
        let inv = 1.0 / self.scale;
        for param in params {
            if let Some(grad) = param.grad() {
                if grad.iter().any(|g| !g.is_finite()) {
                    return false;
                }
                param.set_grad(grad * inv);
            }
        }
        true
    }

    /// Adjust the scale after a step: grow after a run of clean steps, back
    /// off immediately on overflow.
    pub fn update(&mut self, grads_valid: bool) {
        if grads_valid {
            self.successful_steps += 1;
            if self.successful_steps >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.successful_steps = 0;
            }
        } else {
            self.scale *= self.backoff_factor;
            self.successful_steps = 0;
            self.overflow_count += 1;
        }
    }
}
