//! Training checkpoint save/load functionality.
//!
//! A checkpoint named `dir/waveglow_2000` is two files:
//! - `dir/waveglow_2000.safetensors`: every model parameter
//! - `dir/waveglow_2000.json`: iteration, learning rate, scheduler state and
//!   the model configuration the weights were trained with
//!
//! Optimizer moments are not stored; a resumed run restarts Adam's
//! statistics from zero.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use super::scheduler::StepLr;
use crate::error::FlowError;
use crate::models::config::WaveGlowConfig;

/// Training state stored next to the weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Iteration the checkpoint was written at.
    pub iteration: usize,
    /// Learning rate at checkpoint.
    pub learning_rate: f64,
    #[serde(default)]
    pub scheduler: Option<StepLr>,
    pub waveglow_config: WaveGlowConfig,
}

/// Weight and metadata file paths of a checkpoint.
///
/// Accepts the bare checkpoint name or either of its two files.
pub fn checkpoint_files<P: AsRef<Path>>(path: P) -> (PathBuf, PathBuf) {
    let path = path.as_ref();
    let base = match path.extension().and_then(|e| e.to_str()) {
        Some("safetensors") | Some("json") => path.with_extension(""),
        _ => path.to_path_buf(),
    };
    (with_suffix(&base, "safetensors"), with_suffix(&base, "json"))
}

fn with_suffix(base: &Path, ext: &str) -> PathBuf {
    let mut name: OsString = base.as_os_str().to_owned();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

/// Write the parameters in `varmap` and `metadata` under `path`.
pub fn save_checkpoint<P: AsRef<Path>>(varmap: &VarMap, metadata: &CheckpointMetadata, path: P) -> Result<()> {
    let (weights, meta) = checkpoint_files(&path);
    if let Some(dir) = weights.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create checkpoint directory {}", dir.display()))?;
        }
    }

    tracing::info!(
        "Saving model state at iteration {} to {}",
        metadata.iteration,
        weights.display()
    );
    varmap
        .save(&weights)
        .with_context(|| format!("Failed to write {}", weights.display()))?;

    let json = serde_json::to_string_pretty(metadata)?;
    std::fs::write(&meta, json).with_context(|| format!("Failed to write {}", meta.display()))?;
    Ok(())
}

/// Read the metadata of a checkpoint.
pub fn load_metadata<P: AsRef<Path>>(path: P) -> Result<CheckpointMetadata> {
    let (_, meta) = checkpoint_files(path);
    let content = std::fs::read_to_string(&meta)
        .with_context(|| format!("Failed to read checkpoint metadata {}", meta.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse checkpoint metadata {}", meta.display()))
}

/// Restore a checkpoint into an existing `varmap`.
///
/// Fails with `FlowError::ConfigMismatch` when the checkpoint was written for
/// a model with a different parameter structure than `config`.
pub fn load_checkpoint<P: AsRef<Path>>(
    varmap: &mut VarMap,
    config: &WaveGlowConfig,
    path: P,
) -> Result<CheckpointMetadata> {
    let metadata = load_metadata(&path)?;
    ensure_same_structure(config, &metadata.waveglow_config)?;

    let (weights, _) = checkpoint_files(&path);
    varmap
        .load(&weights)
        .with_context(|| format!("Failed to load weights from {}", weights.display()))?;

    tracing::info!(
        "Loaded checkpoint '{}' (iteration {})",
        weights.display(),
        metadata.iteration
    );
    Ok(metadata)
}

/// Load a checkpoint's weights as plain tensors, for inference.
pub fn load_weights<P: AsRef<Path>>(path: P, device: &Device) -> Result<(HashMap<String, Tensor>, CheckpointMetadata)> {
    let metadata = load_metadata(&path)?;
    let (weights, _) = checkpoint_files(&path);
    let tensors = candle_core::safetensors::load(&weights, device)
        .with_context(|| format!("Failed to load weights from {}", weights.display()))?;
    Ok((tensors, metadata))
}

fn ensure_same_structure(expected: &WaveGlowConfig, found: &WaveGlowConfig) -> Result<()> {
    if expected.same_structure(found) {
        return Ok(());
    }
    Err(FlowError::ConfigMismatch(format!(
        "model has {} flows over {} channels (early {} every {}), checkpoint has {} flows over {} channels (early {} every {})",
        expected.n_flows,
        expected.n_group,
        expected.n_early_size,
        expected.n_early_every,
        found.n_flows,
        found.n_group,
        found.n_early_size,
        found.n_early_every
    ))
    .into())
}
