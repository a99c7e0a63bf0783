//! Maximum-likelihood training loop.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};

use super::checkpoint::{load_checkpoint, save_checkpoint, CheckpointMetadata};
use super::scheduler::StepLr;
use crate::data::AudioFeatureDataset;
use crate::models::{Config, WaveGlow, WaveGlowLoss};

/// Owns the model, its parameters and the optimizer.
pub struct Trainer {
    config: Config,
    varmap: VarMap,
    model: WaveGlow,
    optimizer: AdamW,
    criterion: WaveGlowLoss,
    scheduler: Option<StepLr>,
    iteration: usize,
    device: Device,
}

impl Trainer {
    /// Build a fresh model, or resume from `train_config.checkpoint_path`.
    pub fn new(config: Config, device: Device) -> Result<Self> {
        let train = &config.train_config;
        train.validate()?;
        let criterion = WaveGlowLoss::new(train.sigma)?;

        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut rng = StdRng::seed_from_u64(train.seed);
        let mut model = WaveGlow::new_with_rng(&config.waveglow_config, vb, &mut rng)?;

        let mut scheduler = train
            .scheduler_step_size
            .map(|step| StepLr::new(train.learning_rate, step, train.scheduler_gamma))
            .transpose()?;
        let mut learning_rate = train.learning_rate;

        let mut iteration = 0;
        if !train.checkpoint_path.is_empty() {
            let metadata = load_checkpoint(&mut varmap, &config.waveglow_config, &train.checkpoint_path)?;
            model.weights_updated();
            iteration = metadata.iteration + 1;
            learning_rate = metadata.learning_rate;
            if let Some(restored) = metadata.scheduler {
                learning_rate = restored.get_lr();
                scheduler = Some(restored);
            }
        }

        let params = ParamsAdamW {
            lr: learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        };
        let optimizer = AdamW::new(varmap.all_vars(), params)?;

        let n_params: usize = varmap.all_vars().iter().map(|v| v.elem_count()).sum();
        tracing::info!("WaveGlow with {} parameters on {:?}", n_params, device);

        Ok(Self {
            config,
            varmap,
            model,
            optimizer,
            criterion,
            scheduler,
            iteration,
            device,
        })
    }

    pub fn model(&self) -> &WaveGlow {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut WaveGlow {
        &mut self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Index of the next training step.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// One optimizer step on a batch; returns the loss before the update.
    ///
    /// # Arguments
    /// * `mel` - Conditioning features `[batch, n_mel_channels, frames]`
    /// * `audio` - Waveforms `[batch, samples]`
    pub fn train_step(&mut self, mel: &Tensor, audio: &Tensor) -> Result<f32> {
        let output = self.model.forward(mel, audio)?;
        let loss = self.criterion.forward(&output)?;
        self.optimizer.backward_step(&loss)?;
        self.model.weights_updated();

        let value = loss.to_scalar::<f32>()?;
        if !value.is_finite() {
            tracing::warn!("iteration {}: loss is {}", self.iteration, value);
        } else if value >= 0.0 {
            tracing::debug!("iteration {}: loss {:.9} is not negative", self.iteration, value);
        }
        self.iteration += 1;
        Ok(value)
    }

    /// Mean loss over `batches` without touching the parameters.
    pub fn validate(&self, batches: &[(Tensor, Tensor)]) -> Result<f32> {
        if batches.is_empty() {
            anyhow::bail!("validation needs at least one batch");
        }
        let mut total = 0.0f32;
        for (mel, audio) in batches {
            let output = self.model.forward(mel, audio)?;
            total += self.criterion.forward(&output)?.to_scalar::<f32>()?;
        }
        Ok(total / batches.len() as f32)
    }

    /// Run the configured number of epochs.
    ///
    /// Checkpoints `waveglow_{iteration}` every `iters_per_checkpoint` steps
    /// and `waveglow_final` at the end, both under `output_directory`.
    pub fn fit(
        &mut self,
        train: &mut AudioFeatureDataset,
        mut validation: Option<&mut AudioFeatureDataset>,
    ) -> Result<()> {
        let batch_size = self.config.train_config.batch_size;
        let num_batches = train.num_batches(batch_size);
        if num_batches == 0 {
            anyhow::bail!(
                "training set has {} files, fewer than one batch of {}",
                train.len(),
                batch_size
            );
        }

        let output_directory = PathBuf::from(&self.config.train_config.output_directory);
        std::fs::create_dir_all(&output_directory).with_context(|| {
            format!("Failed to create output directory {}", output_directory.display())
        })?;
        tracing::info!("output directory {}", output_directory.display());

        let epochs = self.config.train_config.epochs;
        let iters_per_checkpoint = self.config.train_config.iters_per_checkpoint;
        let epoch_offset = self.iteration / num_batches;

        for epoch in epoch_offset..epochs {
            tracing::info!("Epoch: {}", epoch);
            for i in 0..num_batches {
                let indices: Vec<usize> = (i * batch_size..(i + 1) * batch_size).collect();
                let (mel, audio) = train.batch(&indices, &self.device)?;

                let iteration = self.iteration;
                let loss = self.train_step(&mel, &audio)?;
                tracing::info!("{}:\t{:.9}", iteration, loss);

                if iters_per_checkpoint > 0 && iteration % iters_per_checkpoint == 0 {
                    self.save_at(
                        output_directory.join(format!("waveglow_{}", iteration)),
                        iteration,
                    )?;
                }
            }

            if let Some(scheduler) = self.scheduler.as_mut() {
                let lr = scheduler.step();
                self.optimizer.set_learning_rate(lr);
            }

            if let Some(dataset) = validation.as_deref_mut() {
                let val_batches = dataset.num_batches(batch_size);
                let mut batches = Vec::with_capacity(val_batches);
                for i in 0..val_batches {
                    let indices: Vec<usize> = (i * batch_size..(i + 1) * batch_size).collect();
                    batches.push(dataset.batch(&indices, &self.device)?);
                }
                if !batches.is_empty() {
                    let val_loss = self.validate(&batches)?;
                    tracing::info!("epoch {} validation loss {:.9}", epoch, val_loss);
                }
            }
        }

        self.save_at(output_directory.join("waveglow_final"), self.iteration)
    }

    /// Write a checkpoint of the current state to `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.save_at(path, self.iteration)
    }

    fn save_at<P: AsRef<Path>>(&self, path: P, iteration: usize) -> Result<()> {
        let metadata = CheckpointMetadata {
            iteration,
            learning_rate: self.optimizer.learning_rate(),
            scheduler: self.scheduler.clone(),
            waveglow_config: self.config.waveglow_config.clone(),
        };
        save_checkpoint(&self.varmap, &metadata, path)
    }
}
