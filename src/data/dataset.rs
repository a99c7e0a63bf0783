//! Waveform + feature training segments
//!
//! Each line of a file list names a WAV file. Its conditioning features live
//! next to it in a `.safetensors` file (same stem) as a `[n_mel, frames]`
//! tensor under the configured key. Items are random crops of
//! `segment_length` samples that start on a frame boundary, together with
//! the `ceil(segment_length / hop_length)` feature frames covering them.
//! Short clips and short feature tracks are zero-padded at the end.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};

use crate::audio::load_wav;
use crate::models::config::DataConfig;

/// One training example.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Conditioning features `[n_mel, frames]`
    pub features: Tensor,
    /// Waveform `[segment_length]`
    pub audio: Tensor,
}

/// Dataset of (features, waveform) segments.
pub struct AudioFeatureDataset {
    files: Vec<PathBuf>,
    segment_length: usize,
    hop_length: usize,
    sampling_rate: u32,
    n_mel_channels: usize,
    feature_key: String,
    rng: StdRng,
}

impl AudioFeatureDataset {
    /// Read the file list at `list_path`.
    ///
    /// Relative paths in the list are resolved against the list's directory.
    pub fn from_file_list<P: AsRef<Path>>(
        list_path: P,
        config: &DataConfig,
        n_mel_channels: usize,
        seed: u64,
    ) -> Result<Self> {
        let list_path = list_path.as_ref();
        let content = std::fs::read_to_string(list_path)
            .with_context(|| format!("Failed to read file list {}", list_path.display()))?;
        let base = list_path.parent().unwrap_or_else(|| Path::new(""));

        let files: Vec<PathBuf> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                let path = PathBuf::from(line);
                if path.is_absolute() {
                    path
                } else {
                    base.join(path)
                }
            })
            .collect();

        tracing::info!("Loaded {} entries from {}", files.len(), list_path.display());
        Self::from_files(files, config, n_mel_channels, seed)
    }

    pub fn from_files(
        files: Vec<PathBuf>,
        config: &DataConfig,
        n_mel_channels: usize,
        seed: u64,
    ) -> Result<Self> {
        if config.segment_length == 0 || config.hop_length == 0 {
            anyhow::bail!("segment_length and hop_length must be positive");
        }
        Ok(Self {
            files,
            segment_length: config.segment_length,
            hop_length: config.hop_length,
            sampling_rate: config.sampling_rate,
            n_mel_channels,
            feature_key: config.feature_key.clone(),
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Feature frames per segment.
    pub fn frames_per_segment(&self) -> usize {
        self.segment_length.div_ceil(self.hop_length)
    }

    /// Number of full batches per epoch; the remainder is dropped.
    pub fn num_batches(&self, batch_size: usize) -> usize {
        if batch_size == 0 {
            0
        } else {
            self.files.len() / batch_size
        }
    }

    /// Load item `index` with a fresh random crop.
    pub fn get(&mut self, index: usize) -> Result<Segment> {
        let wav_path = self
            .files
            .get(index)
            .with_context(|| format!("index {} out of range for {} files", index, self.files.len()))?
            .clone();

        let audio = load_wav(&wav_path)?;
        if audio.sample_rate != self.sampling_rate {
            anyhow::bail!(
                "{} has sample rate {}, expected {}",
                wav_path.display(),
                audio.sample_rate,
                self.sampling_rate
            );
        }
        let features = self.load_features(&wav_path)?;
        let available_frames = features.dim(1)?;

        let seg = self.segment_length;
        let n_frames = self.frames_per_segment();
        let start_frame = if audio.len() > seg {
            let max_frame = (audio.len() - seg) / self.hop_length;
            self.rng.gen_range(0..=max_frame)
        } else {
            0
        };

        let start = start_frame * self.hop_length;
        let mut samples: Vec<f32> = audio.samples.iter().skip(start).take(seg).copied().collect();
        samples.resize(seg, 0.0);
        let audio = Tensor::from_vec(samples, seg, &Device::Cpu)?;

        let take = available_frames.saturating_sub(start_frame).min(n_frames);
        let features = if take == 0 {
            Tensor::zeros((self.n_mel_channels, n_frames), features.dtype(), &Device::Cpu)?
        } else {
            features
                .narrow(1, start_frame, take)?
                .pad_with_zeros(1, 0, n_frames - take)?
        };

        tracing::debug!(
            "segment from {} at sample {} ({} feature frames)",
            wav_path.display(),
            start,
            take
        );
        Ok(Segment { features, audio })
    }

    /// Stack items into `([batch, n_mel, frames], [batch, segment_length])`.
    pub fn batch(&mut self, indices: &[usize], device: &Device) -> Result<(Tensor, Tensor)> {
        let mut features = Vec::with_capacity(indices.len());
        let mut audio = Vec::with_capacity(indices.len());
        for &index in indices {
            let segment = self.get(index)?;
            features.push(segment.features);
            audio.push(segment.audio);
        }
        let features = Tensor::stack(&features, 0)?.to_device(device)?;
        let audio = Tensor::stack(&audio, 0)?.to_device(device)?;
        Ok((features, audio))
    }

    fn load_features(&self, wav_path: &Path) -> Result<Tensor> {
        let path = wav_path.with_extension("safetensors");
        let tensors = candle_core::safetensors::load(&path, &Device::Cpu)
            .with_context(|| format!("Failed to load features from {}", path.display()))?;
        let features = tensors.get(&self.feature_key).with_context(|| {
            format!("{} has no tensor named '{}'", path.display(), self.feature_key)
        })?;

        let (channels, _) = features.dims2()?;
        if channels != self.n_mel_channels {
            anyhow::bail!(
                "{} has {} feature channels, expected {}",
                path.display(),
                channels,
                self.n_mel_channels
            );
        }
        Ok(features.to_dtype(DType::F32)?)
    }
}
