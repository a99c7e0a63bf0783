//! # WaveGlow
//!
//! Flow-based neural vocoder in pure Rust: turns acoustic conditioning
//! features (mel spectrogram or similar, computed elsewhere) into raw audio.
//!
//! ## Features
//!
//! - **CPU**: Default, with optional MKL/Accelerate for faster BLAS
//! - **CUDA**: NVIDIA GPU acceleration
//! - **Metal**: Apple Silicon GPU acceleration
//!
//! ## Example
//!
//! ```rust,ignore
//! use waveglow::{generation::GaussianNoise, Vocoder};
//!
//! let mut vocoder = Vocoder::from_checkpoint("checkpoints/waveglow_final", 16000, device)?;
//! let audio = vocoder.synthesize(&features, 0.6, &mut GaussianNoise::new(1234))?;
//! audio.save("output.wav")?;
//! ```

pub mod audio;
pub mod data;
pub mod error;
pub mod generation;
pub mod models;
pub mod training;

use anyhow::Result;
use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use std::path::Path;

/// Re-exports for convenience
pub use audio::AudioBuffer;
pub use error::FlowError;
pub use generation::{GaussianNoise, NoiseSource, ReplayNoise};
pub use models::config::{Config, WaveGlowConfig};
pub use models::{FlowOutput, FlowSchedule, WaveGlow, WaveGlowLoss};

/// Inference interface over a trained model
pub struct Vocoder {
    /// The underlying flow, weight normalization removed
    model: WaveGlow,
    /// Sample rate of the generated audio
    sample_rate: u32,
}

impl Vocoder {
    /// Wrap a model, folding its weight normalization.
    pub fn new(mut model: WaveGlow, sample_rate: u32) -> Result<Self> {
        model.remove_weight_norm()?;
        Ok(Self { model, sample_rate })
    }

    /// Load a checkpoint written by the trainer.
    ///
    /// The model structure and precision come from the checkpoint metadata.
    pub fn from_checkpoint<P: AsRef<Path>>(path: P, sample_rate: u32, device: Device) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!("Loading WaveGlow from: {}", path.display());

        let (weights, metadata) = training::load_weights(path, &device)?;
        let config = metadata.waveglow_config;
        let vb = VarBuilder::from_tensors(weights, config.precision.dtype(), &device);
        let model = WaveGlow::new(&config, vb)?;

        tracing::info!(
            "{} flows, {} channel groups, trained for {} iterations",
            config.n_flows,
            config.n_group,
            metadata.iteration
        );
        Self::new(model, sample_rate)
    }

    /// Generate a waveform from conditioning features.
    ///
    /// # Arguments
    /// * `features` - `[n_mel_channels, frames]` or `[1, n_mel_channels, frames]`
    /// * `sigma` - Standard deviation of the sampled latent
    /// * `noise` - Source of the latent draws
    pub fn synthesize(&mut self, features: &Tensor, sigma: f64, noise: &mut dyn NoiseSource) -> Result<AudioBuffer> {
        let features = match features.rank() {
            2 => features.unsqueeze(0)?,
            3 => features.clone(),
            rank => anyhow::bail!("expected features of rank 2 or 3, got rank {}", rank),
        };
        if features.dim(0)? != 1 {
            anyhow::bail!("synthesize takes a single utterance, got batch {}", features.dim(0)?);
        }

        let waveform = self.model.infer(&features, sigma, noise)?;
        AudioBuffer::from_tensor(&waveform, self.sample_rate)
    }

    pub fn model(&self) -> &WaveGlow {
        &self.model
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Get the device this model is running on
    pub fn device(&self) -> &Device {
        self.model.device()
    }
}

/// Select the best available device
pub fn auto_device() -> Result<Device> {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::cuda_if_available(0) {
            if device.is_cuda() {
                tracing::info!("Using CUDA device");
                return Ok(device);
            }
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            tracing::info!("Using Metal device");
            return Ok(device);
        }
    }

    tracing::info!("Using CPU device");
    Ok(Device::Cpu)
}

/// Parse a device name: `auto`, `cpu`, `cuda`, `cuda:N` or `metal`.
pub fn parse_device(name: &str) -> Result<Device> {
    match name.trim().to_lowercase().as_str() {
        "auto" => auto_device(),
        "cpu" => Ok(Device::Cpu),
        "cuda" => Ok(Device::new_cuda(0)?),
        "metal" => Ok(Device::new_metal(0)?),
        other => match other.strip_prefix("cuda:") {
            Some(ordinal) => {
                let ordinal: usize = ordinal
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid CUDA ordinal in '{}'", name))?;
                Ok(Device::new_cuda(ordinal)?)
            }
            None => anyhow::bail!("unknown device '{}' (expected auto, cpu, cuda, cuda:N, metal)", name),
        },
    }
}

/// Short human-readable device description
pub fn device_info(device: &Device) -> String {
    match device {
        Device::Cpu => "CPU".to_string(),
        Device::Cuda(_) => "CUDA".to_string(),
        Device::Metal(_) => "Metal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_device() {
        let device = auto_device().unwrap();
        assert!(
            matches!(device, Device::Cpu)
                || matches!(device, Device::Cuda(_))
                || matches!(device, Device::Metal(_))
        );
    }

    #[test]
    fn test_parse_device() {
        assert!(matches!(parse_device("cpu").unwrap(), Device::Cpu));
        assert!(matches!(parse_device(" CPU ").unwrap(), Device::Cpu));
        assert!(parse_device("tpu").is_err());
        assert!(parse_device("cuda:x").is_err());
        assert_eq!(device_info(&Device::Cpu), "CPU");
    }

    #[test]
    fn test_synthesize_rejects_batches() {
        let device = Device::Cpu;
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, candle_core::DType::F32, &device);
        let config = WaveGlowConfig {
            n_mel_channels: 2,
            n_flows: 2,
            n_group: 4,
            n_early_every: 4,
            n_early_size: 2,
            wn_config: models::config::WnConfig {
                n_layers: 1,
                n_channels: 4,
                kernel_size: 3,
            },
            upsample_kernel_size: 8,
            upsample_stride: 4,
            ..Default::default()
        };
        let mut vocoder = Vocoder::new(WaveGlow::new(&config, vb).unwrap(), 16000).unwrap();
        assert!(!vocoder.model().has_weight_norm());

        let mut noise = GaussianNoise::new(0);
        let single = Tensor::zeros((2, 6), candle_core::DType::F32, &device).unwrap();
        let audio = vocoder.synthesize(&single, 0.5, &mut noise).unwrap();
        assert_eq!(audio.len(), 24);
        assert_eq!(audio.sample_rate, 16000);

        let batch = Tensor::zeros((2, 2, 6), candle_core::DType::F32, &device).unwrap();
        assert!(vocoder.synthesize(&batch, 0.5, &mut noise).is_err());
    }
}
