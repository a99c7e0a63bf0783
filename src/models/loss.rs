//! Negative log-likelihood of the flow
//!
//! ```text
//! loss = (sum(z^2) / (2 sigma^2) - sum(log_s) - sum(log_det_w)) / (batch * channels * groups)
//! ```
//!
//! Computed in F32 whatever the model precision.

use anyhow::Result;
use candle_core::{DType, Tensor};

use super::flow::FlowOutput;
use crate::error::FlowError;

/// WaveGlow likelihood objective
#[derive(Debug, Clone, Copy)]
pub struct WaveGlowLoss {
    sigma: f64,
}

impl WaveGlowLoss {
    /// `sigma` is the standard deviation of the Gaussian prior.
    pub fn new(sigma: f64) -> Result<Self> {
        if !sigma.is_finite() || sigma <= 0.0 {
            return Err(FlowError::InvalidConfig(format!(
                "loss sigma must be finite and positive, got {}",
                sigma
            ))
            .into());
        }
        Ok(Self { sigma })
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    /// Scalar loss for one forward pass.
    pub fn forward(&self, output: &FlowOutput) -> Result<Tensor> {
        let z = output.z.to_dtype(DType::F32)?;
        let (batch, channels, groups) = z.dims3()?;

        let mut log_s_total = Tensor::zeros((), DType::F32, z.device())?;
        for (log_s1, log_s2) in output.log_s.iter() {
            log_s_total = (log_s_total + log_s1.to_dtype(DType::F32)?.sum_all()?)?;
            log_s_total = (log_s_total + log_s2.to_dtype(DType::F32)?.sum_all()?)?;
        }

        let mut log_det_w_total = Tensor::zeros((), DType::F32, z.device())?;
        for log_det_w in output.log_det_w.iter() {
            log_det_w_total = (log_det_w_total + log_det_w.to_dtype(DType::F32)?)?;
        }

        let prior = z
            .sqr()?
            .sum_all()?
            .affine(1.0 / (2.0 * self.sigma * self.sigma), 0.0)?;
        let loss = ((prior - log_s_total)? - log_det_w_total)?;
        Ok(loss.affine(1.0 / (batch * channels * groups) as f64, 0.0)?)
    }
}
