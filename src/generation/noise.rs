//! Noise sources for sampling
//!
//! The inverse flow pulls standard-normal tensors for the initial remaining
//! channels and for every group it re-inserts at an early-exit layer. A
//! `NoiseSource` decides where those come from: a seeded generator for real
//! synthesis, or a prepared list of draws to invert a known latent code.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use std::collections::VecDeque;

use crate::error::FlowError;
use crate::models::flow::FlowSchedule;

/// Supplier of standard-normal tensors.
pub trait NoiseSource {
    /// Draw a `[batch, channels, groups]` tensor with unit variance.
    fn sample(&mut self, shape: (usize, usize, usize), dtype: DType, device: &Device) -> Result<Tensor>;
}

/// Seeded Gaussian noise, generated on the host.
///
/// The same seed always yields the same sequence of draws, independent of
/// the compute device.
pub struct GaussianNoise {
    rng: StdRng,
}

impl GaussianNoise {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl NoiseSource for GaussianNoise {
    fn sample(&mut self, shape: (usize, usize, usize), dtype: DType, device: &Device) -> Result<Tensor> {
        let (b, c, t) = shape;
        let values: Vec<f32> = (0..b * c * t)
            .map(|_| -> f32 { StandardNormal.sample(&mut self.rng) })
            .collect();
        Ok(Tensor::from_vec(values, shape, device)?.to_dtype(dtype)?)
    }
}

/// Replays a fixed list of draws in order.
pub struct ReplayNoise {
    draws: VecDeque<Tensor>,
}

impl ReplayNoise {
    pub fn new(draws: Vec<Tensor>) -> Self {
        Self {
            draws: draws.into(),
        }
    }

    /// Draws that make the inverse flow reproduce the audio behind latent `z`.
    ///
    /// `z` is `[batch, n_group, groups]` as assembled by the forward pass:
    /// released groups in release order, then the final remaining channels.
    /// The inverse consumes the final channels first and the released groups
    /// newest-first. Use with `sigma = 1`.
    pub fn from_latent(schedule: &FlowSchedule, z: &Tensor) -> Result<Self> {
        let channels = z.dim(1)?;
        if channels != schedule.n_group() {
            return Err(FlowError::NoiseShape {
                expected: vec![z.dim(0)?, schedule.n_group(), z.dim(2)?],
                actual: z.dims().to_vec(),
            }
            .into());
        }

        let early = schedule.n_early_size();
        let released = schedule.n_early_exits();
        let remaining = schedule.final_remaining();

        let mut draws = Vec::with_capacity(released + 1);
        draws.push(z.narrow(1, released * early, remaining)?);
        for i in (0..released).rev() {
            draws.push(z.narrow(1, i * early, early)?);
        }
        Ok(Self::new(draws))
    }
}

impl NoiseSource for ReplayNoise {
    fn sample(&mut self, shape: (usize, usize, usize), dtype: DType, device: &Device) -> Result<Tensor> {
        let draw = self.draws.pop_front().ok_or(FlowError::NoiseExhausted)?;
        let expected = [shape.0, shape.1, shape.2];
        if draw.dims() != expected {
            return Err(FlowError::NoiseShape {
                expected: expected.to_vec(),
                actual: draw.dims().to_vec(),
            }
            .into());
        }
        Ok(draw.to_device(device)?.to_dtype(dtype)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ops::max_abs_diff;

    #[test]
    fn test_gaussian_noise_is_seeded() {
        let device = Device::Cpu;
        let a = GaussianNoise::new(42).sample((2, 3, 50), DType::F32, &device).unwrap();
        let b = GaussianNoise::new(42).sample((2, 3, 50), DType::F32, &device).unwrap();
        let c = GaussianNoise::new(43).sample((2, 3, 50), DType::F32, &device).unwrap();
        assert_eq!(a.dims(), &[2, 3, 50]);
        assert_eq!(max_abs_diff(&a, &b).unwrap(), 0.0);
        assert!(max_abs_diff(&a, &c).unwrap() > 0.0);
    }

    #[test]
    fn test_gaussian_noise_statistics() {
        let device = Device::Cpu;
        let x = GaussianNoise::new(0).sample((1, 1, 20000), DType::F32, &device).unwrap();
        let values: Vec<f32> = x.flatten_all().unwrap().to_vec1().unwrap();
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / values.len() as f32;
        assert!(mean.abs() < 0.05);
        assert!((var - 1.0).abs() < 0.05);
    }

    #[test]
    fn test_gaussian_noise_dtype() {
        let device = Device::Cpu;
        let x = GaussianNoise::new(1).sample((1, 2, 3), DType::F16, &device).unwrap();
        assert_eq!(x.dtype(), DType::F16);
    }

    #[test]
    fn test_replay_order_from_latent() {
        let device = Device::Cpu;
        // 12 flows, release 2 of 8 channels every 4 layers: 2 releases, 4 remain
        let schedule = FlowSchedule::new(12, 8, 4, 2).unwrap();
        let values: Vec<f32> = (0..8).map(|c| c as f32).collect();
        let z = Tensor::from_vec(values, (1, 8, 1), &device).unwrap();

        let mut replay = ReplayNoise::from_latent(&schedule, &z).unwrap();
        assert_eq!(replay.draws.len(), 3);

        let first: Vec<f32> = replay
            .sample((1, 4, 1), DType::F32, &device)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(first, vec![4.0, 5.0, 6.0, 7.0]);

        let second: Vec<f32> = replay
            .sample((1, 2, 1), DType::F32, &device)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(second, vec![2.0, 3.0]);

        let third: Vec<f32> = replay
            .sample((1, 2, 1), DType::F32, &device)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(third, vec![0.0, 1.0]);

        let err = replay.sample((1, 2, 1), DType::F32, &device).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FlowError>(),
            Some(FlowError::NoiseExhausted)
        ));
    }

    #[test]
    fn test_replay_rejects_wrong_shape() {
        let device = Device::Cpu;
        let mut replay = ReplayNoise::new(vec![Tensor::zeros((1, 2, 5), DType::F32, &device).unwrap()]);
        let err = replay.sample((1, 2, 6), DType::F32, &device).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FlowError>(),
            Some(FlowError::NoiseShape { .. })
        ));
    }
}
