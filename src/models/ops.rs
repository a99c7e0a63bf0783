//! Elementwise and reshaping primitives shared by the flow layers
//!
//! - `fused_add_tanh_sigmoid_multiply`: the gated activation of the WN layers
//! - `group_audio` / `ungroup_audio`: squeeze a waveform into channel groups
//!   of `n_group` consecutive samples and back
//! - `group_conditioning`: the matching squeeze for upsampled features

use anyhow::Result;
use candle_core::Tensor;

use crate::error::FlowError;

/// Gated activation unit.
///
/// Returns `tanh(a + b)[:, :n, :] * sigmoid(a + b)[:, n:, :]`.
pub fn fused_add_tanh_sigmoid_multiply(a: &Tensor, b: &Tensor, n_channels: usize) -> Result<Tensor> {
    let in_act = (a + b)?;
    let t_act = in_act.narrow(1, 0, n_channels)?.tanh()?;
    let s_act = candle_nn::ops::sigmoid(&in_act.narrow(1, n_channels, n_channels)?)?;
    Ok((t_act * s_act)?)
}

/// Squeeze `[batch, samples]` into `[batch, n_group, samples / n_group]`.
///
/// Channel `c` of group `t` holds sample `t * n_group + c`.
pub fn group_audio(audio: &Tensor, n_group: usize) -> Result<Tensor> {
    let (batch, len) = audio.dims2()?;
    if len % n_group != 0 {
        return Err(FlowError::UngroupableLength { len, group: n_group }.into());
    }
    Ok(audio
        .reshape((batch, len / n_group, n_group))?
        .transpose(1, 2)?
        .contiguous()?)
}

/// Inverse of [`group_audio`]: `[batch, n_group, groups]` to `[batch, samples]`.
pub fn ungroup_audio(audio: &Tensor) -> Result<Tensor> {
    let (batch, n_group, groups) = audio.dims3()?;
    Ok(audio
        .transpose(1, 2)?
        .contiguous()?
        .reshape((batch, n_group * groups))?)
}

/// Squeeze `[batch, channels, samples]` into `[batch, channels * n_group, groups]`.
///
/// Each group stacks the `n_group` frames of every feature channel, channel-major.
pub fn group_conditioning(spect: &Tensor, n_group: usize) -> Result<Tensor> {
    let (batch, channels, len) = spect.dims3()?;
    if len % n_group != 0 {
        return Err(FlowError::UngroupableLength { len, group: n_group }.into());
    }
    let groups = len / n_group;
    Ok(spect
        .reshape((batch, channels, groups, n_group))?
        .permute((0, 2, 1, 3))?
        .contiguous()?
        .reshape((batch, groups, channels * n_group))?
        .transpose(1, 2)?
        .contiguous()?)
}

/// Largest absolute elementwise difference between two tensors.
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    let f32 = candle_core::DType::F32;
    let diff = (a.to_dtype(f32)? - b.to_dtype(f32)?)?.abs()?.flatten_all()?.max(0)?;
    Ok(diff.to_scalar::<f32>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_gated_activation_values() {
        let device = Device::Cpu;
        let a = Tensor::new(&[[[0.5f32], [1.0], [-0.5], [2.0]]], &device).unwrap();
        let b = Tensor::zeros((1, 4, 1), DType::F32, &device).unwrap();

        let out = fused_add_tanh_sigmoid_multiply(&a, &b, 2).unwrap();
        assert_eq!(out.dims(), &[1, 2, 1]);

        let out: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        let sigmoid = |x: f32| 1.0 / (1.0 + (-x).exp());
        assert!((out[0] - 0.5f32.tanh() * sigmoid(-0.5)).abs() < 1e-6);
        assert!((out[1] - 1.0f32.tanh() * sigmoid(2.0)).abs() < 1e-6);
    }

    #[test]
    fn test_gated_activation_adds_inputs() {
        let device = Device::Cpu;
        let a = Tensor::randn(0f32, 1.0, (2, 6, 5), &device).unwrap();
        let b = Tensor::randn(0f32, 1.0, (2, 6, 5), &device).unwrap();
        let sum = (&a + &b).unwrap();
        let zeros = sum.zeros_like().unwrap();

        let fused = fused_add_tanh_sigmoid_multiply(&a, &b, 3).unwrap();
        let reference = fused_add_tanh_sigmoid_multiply(&sum, &zeros, 3).unwrap();
        assert!(max_abs_diff(&fused, &reference).unwrap() < 1e-6);
    }

    #[test]
    fn test_group_audio_layout() {
        let device = Device::Cpu;
        let samples: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let audio = Tensor::from_vec(samples, (1, 16), &device).unwrap();

        let grouped = group_audio(&audio, 4).unwrap();
        assert_eq!(grouped.dims(), &[1, 4, 4]);

        let rows: Vec<Vec<f32>> = grouped.squeeze(0).unwrap().to_vec2().unwrap();
        // channel c of group t is sample t * 4 + c
        assert_eq!(rows[0], vec![0.0, 4.0, 8.0, 12.0]);
        assert_eq!(rows[3], vec![3.0, 7.0, 11.0, 15.0]);
    }

    #[test]
    fn test_ungroup_restores_audio() {
        let device = Device::Cpu;
        let audio = Tensor::randn(0f32, 1.0, (3, 64), &device).unwrap();
        let grouped = group_audio(&audio, 8).unwrap();
        let restored = ungroup_audio(&grouped).unwrap();
        assert_eq!(restored.dims(), &[3, 64]);
        assert_eq!(max_abs_diff(&audio, &restored).unwrap(), 0.0);
    }

    #[test]
    fn test_group_audio_rejects_ragged_length() {
        let device = Device::Cpu;
        let audio = Tensor::zeros((1, 10), DType::F32, &device).unwrap();
        let err = group_audio(&audio, 4).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FlowError>(),
            Some(FlowError::UngroupableLength { len: 10, group: 4 })
        ));
    }

    #[test]
    fn test_group_conditioning_layout() {
        let device = Device::Cpu;
        // 2 channels, 4 frames: channel 0 = 0..4, channel 1 = 10..14
        let spect = Tensor::new(&[[[0f32, 1., 2., 3.], [10., 11., 12., 13.]]], &device).unwrap();

        let grouped = group_conditioning(&spect, 2).unwrap();
        assert_eq!(grouped.dims(), &[1, 4, 2]);

        let rows: Vec<Vec<f32>> = grouped.squeeze(0).unwrap().to_vec2().unwrap();
        // group 0 stacks [ch0 f0, ch0 f1, ch1 f0, ch1 f1]
        assert_eq!(rows[0], vec![0.0, 2.0]);
        assert_eq!(rows[1], vec![1.0, 3.0]);
        assert_eq!(rows[2], vec![10.0, 12.0]);
        assert_eq!(rows[3], vec![11.0, 13.0]);
    }
}
