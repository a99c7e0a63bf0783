//! Step learning-rate schedule.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::FlowError;

/// Multiplies the learning rate by `gamma` every `step_size` epochs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLr {
    base_lr: f64,
    step_size: usize,
    gamma: f64,
    last_epoch: usize,
}

impl StepLr {
    /// Fails with `FlowError::InvalidConfig` when `step_size` is zero.
    pub fn new(base_lr: f64, step_size: usize, gamma: f64) -> Result<Self> {
        if step_size == 0 {
            return Err(FlowError::InvalidConfig("scheduler step size must be positive".into()).into());
        }
        Ok(Self {
            base_lr,
            step_size,
            gamma,
            last_epoch: 0,
        })
    }

    /// Learning rate for the current epoch.
    pub fn get_lr(&self) -> f64 {
        let decays = (self.last_epoch / self.step_size) as i32;
        self.base_lr * self.gamma.powi(decays)
    }

    /// Advance one epoch and return the new learning rate.
    pub fn step(&mut self) -> f64 {
        self.last_epoch += 1;
        self.get_lr()
    }

    pub fn last_epoch(&self) -> usize {
        self.last_epoch
    }

    pub fn base_lr(&self) -> f64 {
        self.base_lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_decay() {
        let mut scheduler = StepLr::new(1e-3, 2, 0.5).unwrap();
        assert!((scheduler.get_lr() - 1e-3).abs() < 1e-12);
        scheduler.step();
        assert!((scheduler.get_lr() - 1e-3).abs() < 1e-12);
        scheduler.step();
        assert!((scheduler.get_lr() - 5e-4).abs() < 1e-12);
        scheduler.step();
        scheduler.step();
        assert!((scheduler.get_lr() - 2.5e-4).abs() < 1e-12);
        assert_eq!(scheduler.last_epoch(), 4);
    }

    #[test]
    fn test_serde_roundtrip_keeps_position() {
        let mut scheduler = StepLr::new(1e-4, 200, 0.25).unwrap();
        for _ in 0..401 {
            scheduler.step();
        }
        let json = serde_json::to_string(&scheduler).unwrap();
        let restored: StepLr = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, scheduler);
        assert!((restored.get_lr() - 1e-4 * 0.0625).abs() < 1e-12);
    }

    #[test]
    fn test_zero_step_size_rejected() {
        assert!(StepLr::new(1e-3, 0, 0.5).is_err());
    }
}
