//! Audio utilities for WaveGlow
//!
//! This module provides:
//! - WAV file I/O
//! - Conversion between waveforms and tensors

mod io;

pub use io::{load_wav, save_wav, AudioBuffer, MAX_WAV_VALUE};

/// Sample rate of the default configuration
pub const SAMPLE_RATE: u32 = 16000;
