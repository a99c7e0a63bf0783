//! Model, training and data configuration for WaveGlow
//!
//! The on-disk format is the JSON file used by the original training script:
//! one object with `train_config`, `data_config` and `waveglow_config`
//! sections. Sections this crate does not use (such as `dist_config`) are
//! ignored.

use anyhow::{Context, Result};
use candle_core::DType;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::FlowError;

/// Complete configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub train_config: TrainConfig,
    #[serde(default)]
    pub data_config: DataConfig,
    #[serde(default)]
    pub waveglow_config: WaveGlowConfig,
}

impl Config {
    /// Load configuration from a local JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        config.train_config.validate()?;
        config.waveglow_config.validate()?;
        Ok(config)
    }
}

/// Numeric precision the model parameters and activations are held in.
///
/// Chosen once at construction and threaded through every sub-module.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    F32,
    F16,
    Bf16,
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Precision::F32 => DType::F32,
            Precision::F16 => DType::F16,
            Precision::Bf16 => DType::BF16,
        }
    }
}

/// What the second conditioning network sees when a coupling is inverted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InverseConditioning {
    /// `(y_1 + audio_0) / 2`, the behaviour existing checkpoints were trained with.
    #[default]
    Legacy,
    /// `y_1 + x_a`, the exact mirror of the forward pass.
    Exact,
}

/// Conditioning network (WN) configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WnConfig {
    /// Number of dilated layers
    #[serde(default = "default_wn_layers")]
    pub n_layers: usize,

    /// Internal channel width (even)
    #[serde(default = "default_wn_channels")]
    pub n_channels: usize,

    /// Dilated convolution kernel size (odd)
    #[serde(default = "default_wn_kernel_size")]
    pub kernel_size: usize,
}

impl Default for WnConfig {
    fn default() -> Self {
        Self {
            n_layers: default_wn_layers(),
            n_channels: default_wn_channels(),
            kernel_size: default_wn_kernel_size(),
        }
    }
}

impl WnConfig {
    pub fn validate(&self) -> Result<()> {
        if self.kernel_size % 2 == 0 {
            return Err(FlowError::InvalidConfig(format!(
                "WN kernel_size must be odd, got {}",
                self.kernel_size
            ))
            .into());
        }
        if self.n_channels == 0 || self.n_channels % 2 != 0 {
            return Err(FlowError::InvalidConfig(format!(
                "WN n_channels must be even and positive, got {}",
                self.n_channels
            ))
            .into());
        }
        if self.n_layers == 0 {
            return Err(FlowError::InvalidConfig("WN n_layers must be positive".into()).into());
        }
        Ok(())
    }
}

/// WaveGlow flow stack configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveGlowConfig {
    /// Feature channels of the conditioning input
    #[serde(default = "default_n_mel_channels")]
    pub n_mel_channels: usize,

    /// Number of flow layers
    #[serde(default = "default_n_flows")]
    pub n_flows: usize,

    /// Samples squeezed into one channel group (even)
    #[serde(default = "default_n_group")]
    pub n_group: usize,

    /// Release channels to the prior every this many layers
    #[serde(default = "default_n_early_every")]
    pub n_early_every: usize,

    /// Channels released at each early exit (even)
    #[serde(default = "default_n_early_size")]
    pub n_early_size: usize,

    #[serde(rename = "WN_config", default)]
    pub wn_config: WnConfig,

    /// Kernel of the transposed convolution that upsamples the features
    #[serde(default = "default_upsample_kernel_size")]
    pub upsample_kernel_size: usize,

    /// Stride of the feature upsampler (audio samples per feature frame)
    #[serde(default = "default_upsample_stride")]
    pub upsample_stride: usize,

    #[serde(default)]
    pub precision: Precision,

    #[serde(default)]
    pub inverse_conditioning: InverseConditioning,

    /// Clamp coupling log-scales to `[-c, c]` when set
    #[serde(default)]
    pub log_scale_clamp: Option<f64>,
}

impl Default for WaveGlowConfig {
    fn default() -> Self {
        Self {
            n_mel_channels: default_n_mel_channels(),
            n_flows: default_n_flows(),
            n_group: default_n_group(),
            n_early_every: default_n_early_every(),
            n_early_size: default_n_early_size(),
            wn_config: WnConfig::default(),
            upsample_kernel_size: default_upsample_kernel_size(),
            upsample_stride: default_upsample_stride(),
            precision: Precision::default(),
            inverse_conditioning: InverseConditioning::default(),
            log_scale_clamp: None,
        }
    }
}

impl WaveGlowConfig {
    /// Check every construction-time precondition.
    pub fn validate(&self) -> Result<()> {
        if self.n_mel_channels == 0 {
            return Err(FlowError::InvalidConfig("n_mel_channels must be positive".into()).into());
        }
        if self.upsample_stride == 0 || self.upsample_kernel_size == 0 {
            return Err(FlowError::InvalidConfig(
                "upsample kernel size and stride must be positive".into(),
            )
            .into());
        }
        if let Some(clamp) = self.log_scale_clamp {
            if !(clamp > 0.0) {
                return Err(FlowError::InvalidConfig(format!(
                    "log_scale_clamp must be positive, got {}",
                    clamp
                ))
                .into());
            }
        }
        self.wn_config.validate()?;
        crate::models::flow::FlowSchedule::new(
            self.n_flows,
            self.n_group,
            self.n_early_every,
            self.n_early_size,
        )?;
        Ok(())
    }

    /// Width of the grouped conditioning tensor each WN receives
    pub fn grouped_cond_channels(&self) -> usize {
        self.n_mel_channels * self.n_group
    }

    /// Fields that fix the parameter structure of a model
    pub fn same_structure(&self, other: &Self) -> bool {
        self.n_mel_channels == other.n_mel_channels
            && self.n_flows == other.n_flows
            && self.n_group == other.n_group
            && self.n_early_every == other.n_early_every
            && self.n_early_size == other.n_early_size
            && self.wn_config == other.wn_config
            && self.upsample_kernel_size == other.upsample_kernel_size
            && self.upsample_stride == other.upsample_stride
    }
}

/// Training loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    #[serde(default = "default_output_directory")]
    pub output_directory: String,

    #[serde(default = "default_epochs")]
    pub epochs: usize,

    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// Standard deviation of the latent prior
    #[serde(default = "default_sigma")]
    pub sigma: f64,

    #[serde(default = "default_iters_per_checkpoint")]
    pub iters_per_checkpoint: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Checkpoint to resume from; empty starts fresh
    #[serde(default)]
    pub checkpoint_path: String,

    /// Epochs between learning-rate decays; `None` keeps the rate fixed
    #[serde(default)]
    pub scheduler_step_size: Option<usize>,

    #[serde(default = "default_scheduler_gamma")]
    pub scheduler_gamma: f64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            output_directory: default_output_directory(),
            epochs: default_epochs(),
            learning_rate: default_learning_rate(),
            sigma: default_sigma(),
            iters_per_checkpoint: default_iters_per_checkpoint(),
            batch_size: default_batch_size(),
            seed: default_seed(),
            checkpoint_path: String::new(),
            scheduler_step_size: None,
            scheduler_gamma: default_scheduler_gamma(),
        }
    }
}

impl TrainConfig {
    /// Reject settings the training loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(FlowError::InvalidConfig("batch_size must be positive".into()).into());
        }
        if self.scheduler_step_size == Some(0) {
            return Err(
                FlowError::InvalidConfig("scheduler_step_size must be positive".into()).into(),
            );
        }
        if !(self.learning_rate > 0.0) {
            return Err(FlowError::InvalidConfig(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            ))
            .into());
        }
        Ok(())
    }
}

/// Dataset configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Text file listing one training WAV path per line
    #[serde(default)]
    pub training_files: String,

    /// Text file listing validation WAV paths
    #[serde(default)]
    pub validation_files: Option<String>,

    /// Samples per training segment
    #[serde(default = "default_segment_length")]
    pub segment_length: usize,

    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: u32,

    /// Audio samples per feature frame
    #[serde(default = "default_hop_length")]
    pub hop_length: usize,

    /// Tensor name of the features inside each `.safetensors` file
    #[serde(default = "default_feature_key")]
    pub feature_key: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            training_files: String::new(),
            validation_files: None,
            segment_length: default_segment_length(),
            sampling_rate: default_sampling_rate(),
            hop_length: default_hop_length(),
            feature_key: default_feature_key(),
        }
    }
}

// Defaults of the published WaveGlow configuration
fn default_n_mel_channels() -> usize {
    80
}

fn default_n_flows() -> usize {
    12
}

fn default_n_group() -> usize {
    8
}

fn default_n_early_every() -> usize {
    4
}

fn default_n_early_size() -> usize {
    2
}

fn default_wn_layers() -> usize {
    8
}

fn default_wn_channels() -> usize {
    256
}

fn default_wn_kernel_size() -> usize {
    3
}

fn default_upsample_kernel_size() -> usize {
    1024
}

fn default_upsample_stride() -> usize {
    256
}

fn default_output_directory() -> String {
    "checkpoints".to_string()
}

fn default_epochs() -> usize {
    100000
}

fn default_learning_rate() -> f64 {
    1e-4
}

fn default_sigma() -> f64 {
    1.0
}

fn default_iters_per_checkpoint() -> usize {
    2000
}

fn default_batch_size() -> usize {
    12
}

fn default_seed() -> u64 {
    1234
}

fn default_scheduler_gamma() -> f64 {
    0.25
}

fn default_segment_length() -> usize {
    16000
}

fn default_sampling_rate() -> u32 {
    16000
}

fn default_hop_length() -> usize {
    256
}

fn default_feature_key() -> String {
    "features".to_string()
}
