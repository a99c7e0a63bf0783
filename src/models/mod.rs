//! Neural network models for WaveGlow
//!
//! This module contains:
//! - `config`: Model, training and data configuration
//! - `ops`: Gated activation and channel grouping
//! - `weight_norm`: Weight-normalized 1D convolution
//! - `wn`: Dilated conditioning network
//! - `linalg`: Host-side dense matrix routines
//! - `invertible_conv`: Invertible 1x1 channel mixing
//! - `coupling`: Affine coupling transform
//! - `upsample`: Learned feature upsampler
//! - `flow`: Flow schedule and the full flow stack
//! - `loss`: Likelihood objective

pub mod config;
pub mod coupling;
pub mod flow;
pub mod invertible_conv;
pub mod linalg;
pub mod loss;
pub mod ops;
pub mod upsample;
pub mod weight_norm;
pub mod wn;

pub use config::{Config, WaveGlowConfig};
pub use flow::{FlowOutput, FlowSchedule, WaveGlow};
pub use loss::WaveGlowLoss;
