//! Per-step value schedules
//!
//! The step orchestrator consumes teacher momentum and teacher temperature
//! as plain per-step scalars; these schedules are how the surrounding
//! training loop produces them.

/// A scalar value indexed by training step
pub trait Schedule {
    fn value_at(&self, step: usize) -> f32;
}

/// Constant value
#[derive(Debug, Clone, Copy)]
pub struct ConstantSchedule(pub f32);

impl Schedule for ConstantSchedule {
    fn value_at(&self, _step: usize) -> f32 {
        self.0
    }
}

/// Half-cosine interpolation from `base` to `final_value`, with an optional
/// linear warmup ramp in front.
#[derive(Debug, Clone)]
pub struct CosineSchedule {
    base: f32,
    final_value: f32,
    total_steps: usize,
    warmup_steps: usize,
    start_warmup_value: f32,
}

impl CosineSchedule {
    pub fn new(base: f32, final_value: f32, total_steps: usize) -> Self {
        assert!(total_steps > 0, "schedule needs at least one step");
        Self {
            base,
            final_value,
            total_steps,
            warmup_steps: 0,
            start_warmup_value: 0.0,
        }
    }

    /// Ramp linearly from `start_value` to `base` over the first
    /// `warmup_steps` steps, then follow the cosine
    pub fn with_warmup(mut self, warmup_steps: usize, start_value: f32) -> Self {
        assert!(
            warmup_steps < self.total_steps,
            "warmup ({warmup_steps}) must be shorter than the schedule ({})",
            self.total_steps
        );
        self.warmup_steps = warmup_steps;
        self.start_warmup_value = start_value;
        self
    }
}

impl Schedule for CosineSchedule {
    fn value_at(&self, step: usize) -> f32 {
        if step >= self.total_steps {
            return self.final_value;
        }
        if step < self.warmup_steps {
            let t = step as f32 / self.warmup_steps as f32;
            return self.start_warmup_value + (self.base - self.start_warmup_value) * t;
        }
        let progress =
            (step - self.warmup_steps) as f32 / (self.total_steps - self.warmup_steps) as f32;
        self.final_value
            + 0.5 * (self.base - self.final_value) * (1.0 + (std::f32::consts::PI * progress).cos())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_endpoints() {
        let s = CosineSchedule::new(0.04, 0.07, 100);
        assert_relative_eq!(s.value_at(0), 0.04);
        assert_relative_eq!(s.value_at(100), 0.07);
        assert_relative_eq!(s.value_at(10_000), 0.07);
    }

    #[test]
    fn test_midpoint_is_average() {
        let s = CosineSchedule::new(1.0, 0.0, 100);
        assert_relative_eq!(s.value_at(50), 0.5, epsilon = 1e-3);
    }

    #[test]
    fn test_monotone_when_decreasing() {
        let s = CosineSchedule::new(0.9995, 0.992, 200);
        let mut prev = s.value_at(0);
        for step in 1..=200 {
            let v = s.value_at(step);
            assert!(v <= prev + 1e-7, "cosine decay must not increase");
            prev = v;
        }
    }

    #[test]
    fn test_warmup_ramps_linearly() {
        let s = CosineSchedule::new(1.0, 0.0, 100).with_warmup(10, 0.0);
        assert_relative_eq!(s.value_at(0), 0.0);
        assert_relative_eq!(s.value_at(5), 0.5, epsilon = 1e-6);
        assert_relative_eq!(s.value_at(10), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_constant_schedule() {
        let s = ConstantSchedule(0.99);
        assert_relative_eq!(s.value_at(0), 0.99);
        assert_relative_eq!(s.value_at(123), 0.99);
    }
}
