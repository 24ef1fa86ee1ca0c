//! Learning rate schedules

/// Per-epoch exponential decay: `lr(e) = base_lr * decay_factor^e`
#[derive(Debug, Clone)]
pub struct ExponentialScheduler {
    /// Base learning rate
    base_lr: f64,

    /// Decay factor applied once per step
    decay_factor: f64,

    /// Completed steps
    current_step: usize,
}

impl ExponentialScheduler {
    /// Create a new exponential scheduler
    pub fn new(base_lr: f64, decay_factor: f64) -> Self {
        Self {
            base_lr,
            decay_factor,
            current_step: 0,
        }
    }

    /// Learning rate after `step` decays
    pub fn lr_at(&self, step: usize) -> f64 {
        self.base_lr * self.decay_factor.powi(step as i32)
    }

    /// Advance one step and return the new rate
    pub fn step(&mut self) -> f64 {
        self.current_step += 1;
        self.get_lr()
    }

    pub fn get_lr(&self) -> f64 {
        self.lr_at(self.current_step)
    }

    /// Jump to `step`, e.g. when resuming
    pub fn set_step(&mut self, step: usize) {
        self.current_step = step;
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_exponential_decay() {
        let mut scheduler = ExponentialScheduler::new(2e-4, 0.5);
        assert_relative_eq!(scheduler.get_lr(), 2e-4);
        assert_relative_eq!(scheduler.step(), 1e-4);
        assert_relative_eq!(scheduler.step(), 5e-5);

        scheduler.set_step(0);
        assert_relative_eq!(scheduler.get_lr(), 2e-4);
        assert_relative_eq!(scheduler.lr_at(3), 2.5e-5);
    }
}
