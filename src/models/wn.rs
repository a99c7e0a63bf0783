//! WaveNet-like conditioning network of the affine coupling
//!
//! Differs from WaveNet in that the convolutions are not causal and the
//! dilation keeps doubling on every layer without reset.

use anyhow::Result;
use candle_core::{Module, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, Init, VarBuilder};

use super::config::WnConfig;
use super::ops::fused_add_tanh_sigmoid_multiply;
use super::weight_norm::WeightNormConv1d;

/// Conditioning network mapping `(audio, spect)` to `[t, log_s]`.
pub struct WN {
    n_layers: usize,
    n_channels: usize,
    n_in_channels: usize,
    start: WeightNormConv1d,
    cond_layer: WeightNormConv1d,
    in_layers: Vec<WeightNormConv1d>,
    res_skip_layers: Vec<WeightNormConv1d>,
    end: Conv1d,
}

impl WN {
    /// Build a conditioning network.
    ///
    /// # Arguments
    /// * `n_in_channels` - Audio channels fed in (half the active channels)
    /// * `n_cond_channels` - Channels of the grouped conditioning tensor
    /// * `config` - Layer count, internal width (even) and kernel size (odd)
    /// * `vb` - Variable builder
    pub fn new(
        n_in_channels: usize,
        n_cond_channels: usize,
        config: &WnConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        config.validate()?;
        let WnConfig {
            n_layers,
            n_channels,
            kernel_size,
        } = *config;

        let pointwise = Conv1dConfig::default();
        let start = WeightNormConv1d::new(n_in_channels, n_channels, 1, pointwise, vb.pp("start"))?;
        let cond_layer = WeightNormConv1d::new(
            n_cond_channels,
            2 * n_channels * n_layers,
            1,
            pointwise,
            vb.pp("cond_layer"),
        )?;

        let mut in_layers = Vec::with_capacity(n_layers);
        let mut res_skip_layers = Vec::with_capacity(n_layers);
        for i in 0..n_layers {
            let dilation = 1 << i;
            let dilated = Conv1dConfig {
                padding: (kernel_size * dilation - dilation) / 2,
                dilation,
                ..Default::default()
            };
            in_layers.push(WeightNormConv1d::new(
                n_channels,
                2 * n_channels,
                kernel_size,
                dilated,
                vb.pp("in_layers").pp(i),
            )?);

            // the last layer only feeds the skip sum
            let res_skip_channels = if i < n_layers - 1 {
                2 * n_channels
            } else {
                n_channels
            };
            res_skip_layers.push(WeightNormConv1d::new(
                n_channels,
                res_skip_channels,
                1,
                pointwise,
                vb.pp("res_skip_layers").pp(i),
            )?);
        }

        // Zero-initialized so every coupling starts as the identity map
        let end_vb = vb.pp("end");
        let end_weight =
            end_vb.get_with_hints((2 * n_in_channels, n_channels, 1), "weight", Init::Const(0.0))?;
        let end_bias = end_vb.get_with_hints(2 * n_in_channels, "bias", Init::Const(0.0))?;
        let end = Conv1d::new(end_weight, Some(end_bias), pointwise);

        Ok(Self {
            n_layers,
            n_channels,
            n_in_channels,
            start,
            cond_layer,
            in_layers,
            res_skip_layers,
            end,
        })
    }

    /// Forward pass.
    ///
    /// `audio` is `[batch, n_in_channels, groups]`, `spect` is
    /// `[batch, n_cond_channels, groups]`; the output is
    /// `[batch, 2 * n_in_channels, groups]` with the translation in the
    /// first half and the log-scale in the second.
    pub fn forward(&self, audio: &Tensor, spect: &Tensor) -> Result<Tensor> {
        let mut audio = self.start.forward(audio)?;
        let mut output = audio.zeros_like()?;
        let spect = self.cond_layer.forward(spect)?;

        let n = self.n_channels;
        for (i, (in_layer, res_skip_layer)) in self
            .in_layers
            .iter()
            .zip(self.res_skip_layers.iter())
            .enumerate()
        {
            let spect_offset = i * 2 * n;
            let acts = fused_add_tanh_sigmoid_multiply(
                &in_layer.forward(&audio)?,
                &spect.narrow(1, spect_offset, 2 * n)?,
                n,
            )?;
            let res_skip_acts = res_skip_layer.forward(&acts)?;
            if i < self.n_layers - 1 {
                audio = (audio + res_skip_acts.narrow(1, 0, n)?)?;
                output = (output + res_skip_acts.narrow(1, n, n)?)?;
            } else {
                output = (output + res_skip_acts)?;
            }
        }

        Ok(self.end.forward(&output)?)
    }

    /// Fold the weight norm of every convolution into plain weights.
    pub fn remove_weight_norm(&mut self) -> Result<()> {
        self.start.remove_weight_norm()?;
        self.cond_layer.remove_weight_norm()?;
        for layer in self.in_layers.iter_mut().chain(self.res_skip_layers.iter_mut()) {
            layer.remove_weight_norm()?;
        }
        Ok(())
    }

    pub fn has_weight_norm(&self) -> bool {
        self.start.has_weight_norm()
            || self.cond_layer.has_weight_norm()
            || self.in_layers.iter().any(|l| l.has_weight_norm())
            || self.res_skip_layers.iter().any(|l| l.has_weight_norm())
    }

    pub fn n_in_channels(&self) -> usize {
        self.n_in_channels
    }

    pub fn n_layers(&self) -> usize {
        self.n_layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ops::max_abs_diff;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_config() -> WnConfig {
        WnConfig {
            n_layers: 3,
            n_channels: 8,
            kernel_size: 3,
        }
    }

    #[test]
    fn test_wn_output_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let wn = WN::new(2, 12, &small_config(), vb).unwrap();
        let audio = Tensor::randn(0f32, 1.0, (3, 2, 25), &device).unwrap();
        let spect = Tensor::randn(0f32, 1.0, (3, 12, 25), &device).unwrap();

        let out = wn.forward(&audio, &spect).unwrap();
        assert_eq!(out.dims(), &[3, 4, 25]);
        assert_eq!(wn.n_in_channels(), 2);
        assert_eq!(wn.n_layers(), 3);
    }

    #[test]
    fn test_wn_zero_initialized_output() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let wn = WN::new(3, 4, &small_config(), vb).unwrap();
        let audio = Tensor::randn(0f32, 10.0, (2, 3, 16), &device).unwrap();
        let spect = Tensor::randn(0f32, 10.0, (2, 4, 16), &device).unwrap();

        let out: Vec<f32> = wn
            .forward(&audio, &spect)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_wn_parameter_names() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let _wn = WN::new(2, 4, &small_config(), vb.pp("WN1").pp(0)).unwrap();
        let data = varmap.data().lock().unwrap();
        for name in [
            "WN1.0.start.weight_g",
            "WN1.0.start.weight_v",
            "WN1.0.cond_layer.weight_v",
            "WN1.0.in_layers.2.weight_v",
            "WN1.0.res_skip_layers.1.bias",
            "WN1.0.end.weight",
            "WN1.0.end.bias",
        ] {
            assert!(data.contains_key(name), "missing {}", name);
        }
        // cond_layer produces 2 * n_channels per layer
        assert_eq!(data["WN1.0.cond_layer.weight_v"].dims(), &[48, 4, 1]);
        // last res/skip layer only has the skip half
        assert_eq!(data["WN1.0.res_skip_layers.2.weight_v"].dims(), &[8, 8, 1]);
        assert_eq!(data["WN1.0.res_skip_layers.0.weight_v"].dims(), &[16, 8, 1]);
    }

    #[test]
    fn test_wn_remove_weight_norm_equivalent() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let mut wn = WN::new(2, 4, &small_config(), vb).unwrap();
        // give the end layer non-zero weights so the output depends on the rest
        {
            let data = varmap.data().lock().unwrap();
            let end = data.get("end.weight").unwrap();
            end.set(&Tensor::randn(0f32, 0.5, (4, 8, 1), &device).unwrap())
                .unwrap();
        }

        let audio = Tensor::randn(0f32, 1.0, (2, 2, 10), &device).unwrap();
        let spect = Tensor::randn(0f32, 1.0, (2, 4, 10), &device).unwrap();
        let before = wn.forward(&audio, &spect).unwrap();
        assert!(wn.has_weight_norm());

        wn.remove_weight_norm().unwrap();
        assert!(!wn.has_weight_norm());
        let after = wn.forward(&audio, &spect).unwrap();
        assert!(max_abs_diff(&before, &after).unwrap() < 1e-4);
    }

    #[test]
    fn test_wn_rejects_even_kernel() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = WnConfig {
            kernel_size: 2,
            ..small_config()
        };
        assert!(WN::new(2, 4, &config, vb).is_err());
    }
}
