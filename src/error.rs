//! Typed failures of the flow core
//!
//! Functions in this crate return `anyhow::Result`; the variants below travel
//! inside `anyhow::Error` so callers can tell them apart with `downcast_ref`.

use thiserror::Error;

/// Errors raised by model construction, the flow passes and checkpointing.
#[derive(Debug, Error)]
pub enum FlowError {
    /// A construction-time precondition does not hold.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Upsampled conditioning features do not cover the audio.
    #[error("conditioning covers {conditioning} samples after upsampling but audio has {audio}")]
    ConditioningTooShort { conditioning: usize, audio: usize },

    /// A waveform cannot be split into whole channel groups.
    #[error("length {len} is not a multiple of the group size {group}")]
    UngroupableLength { len: usize, group: usize },

    /// The channel-mixing matrix has no inverse.
    #[error("channel-mixing matrix is singular")]
    SingularMatrix,

    /// A replay noise source ran out of prepared draws.
    #[error("noise source has no draws left")]
    NoiseExhausted,

    /// A replayed draw does not have the requested shape.
    #[error("noise draw has shape {actual:?}, expected {expected:?}")]
    NoiseShape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A checkpoint was written for a different model structure.
    #[error("checkpoint does not match the model: {0}")]
    ConfigMismatch(String),
}
