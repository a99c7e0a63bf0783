//! Sampling utilities for WaveGlow
//!
//! This module provides:
//! - The `NoiseSource` abstraction the inverse flow draws from
//! - Seeded Gaussian noise for synthesis
//! - Replayed draws for inverting a known latent code

mod noise;

pub use noise::{GaussianNoise, NoiseSource, ReplayNoise};
