//! Weight-normalized 1D convolution
//!
//! Stores the weight as a per-output-channel magnitude `weight_g` and a
//! direction `weight_v`, recombined on every forward pass as
//! `weight = weight_g * weight_v / ||weight_v||`. After training the
//! reparameterization can be folded into a plain convolution with
//! [`WeightNormConv1d::remove_weight_norm`], which leaves the outputs unchanged.

use anyhow::Result;
use candle_core::{Module, Tensor, Var};
use candle_nn::{Conv1d, Conv1dConfig, Init, VarBuilder};

enum ConvParams {
    WeightNorm {
        weight_g: Tensor,
        weight_v: Tensor,
        bias: Tensor,
    },
    Plain(Conv1d),
}

/// 1D convolution with an optional weight-norm reparameterization.
pub struct WeightNormConv1d {
    params: ConvParams,
    config: Conv1dConfig,
}

impl WeightNormConv1d {
    /// Create a weight-normalized conv1d.
    ///
    /// Tensors are `weight_g` `[out, 1, 1]`, `weight_v` `[out, in, kernel]`
    /// and `bias` `[out]`. When the builder hands out fresh trainable
    /// variables, `weight_g` starts at `||weight_v||` so the effective
    /// weight equals the initial direction.
    ///
    /// A builder holding a folded `weight` `[out, in, kernel]` instead
    /// yields a plain convolution.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        config: Conv1dConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        if vb.contains_tensor("weight") {
            let weight = vb.get((out_channels, in_channels, kernel_size), "weight")?;
            let bias = vb.get(out_channels, "bias")?;
            return Ok(Self {
                params: ConvParams::Plain(Conv1d::new(weight, Some(bias), config)),
                config,
            });
        }

        let weight_v = vb.get_with_hints(
            (out_channels, in_channels, kernel_size),
            "weight_v",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let weight_g = vb.get_with_hints((out_channels, 1, 1), "weight_g", Init::Const(1.0))?;
        if weight_g.is_variable() {
            let norm = direction_norm(&weight_v)?.to_dtype(weight_g.dtype())?;
            Var::from_tensor(&weight_g)?.set(&norm)?;
        }

        let bound = 1.0 / ((in_channels * kernel_size) as f64).sqrt();
        let bias = vb.get_with_hints(
            out_channels,
            "bias",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;

        Ok(Self {
            params: ConvParams::WeightNorm {
                weight_g,
                weight_v,
                bias,
            },
            config,
        })
    }

    /// Effective convolution weight `[out, in, kernel]`.
    pub fn weight(&self) -> Result<Tensor> {
        match &self.params {
            ConvParams::WeightNorm {
                weight_g, weight_v, ..
            } => {
                let norm = direction_norm(weight_v)?;
                Ok(weight_v.broadcast_mul(weight_g)?.broadcast_div(&norm)?)
            }
            ConvParams::Plain(conv) => Ok(conv.weight().clone()),
        }
    }

    pub fn has_weight_norm(&self) -> bool {
        matches!(self.params, ConvParams::WeightNorm { .. })
    }

    pub fn config(&self) -> &Conv1dConfig {
        &self.config
    }

    /// Fold `weight_g` and `weight_v` into a plain weight tensor.
    ///
    /// The folded tensors are detached from any trainable variables.
    /// Calling this on a plain convolution is a no-op.
    pub fn remove_weight_norm(&mut self) -> Result<()> {
        if let ConvParams::WeightNorm { bias, .. } = &self.params {
            let weight = self.weight()?.detach();
            let bias = bias.detach();
            self.params = ConvParams::Plain(Conv1d::new(weight, Some(bias), self.config));
        }
        Ok(())
    }

    /// Input `[batch, in, time]`, output `[batch, out, time']`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match &self.params {
            ConvParams::WeightNorm { bias, .. } => {
                let conv = Conv1d::new(self.weight()?, Some(bias.clone()), self.config);
                Ok(conv.forward(x)?)
            }
            ConvParams::Plain(conv) => Ok(conv.forward(x)?),
        }
    }
}

/// L2 norm of each output channel's filter, shape `[out, 1, 1]`.
fn direction_norm(weight_v: &Tensor) -> Result<Tensor> {
    Ok(weight_v.sqr()?.sum_keepdim((1, 2))?.sqrt()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ops::max_abs_diff;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn dilated(dilation: usize, kernel_size: usize) -> Conv1dConfig {
        Conv1dConfig {
            padding: (kernel_size * dilation - dilation) / 2,
            dilation,
            ..Default::default()
        }
    }

    #[test]
    fn test_initial_weight_equals_direction() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let conv = WeightNormConv1d::new(4, 6, 3, dilated(1, 3), vb.pp("conv")).unwrap();
        assert!(conv.has_weight_norm());

        let data = varmap.data().lock().unwrap();
        let weight_v = data.get("conv.weight_v").unwrap().as_tensor().clone();
        let weight_g = data.get("conv.weight_g").unwrap().as_tensor().clone();
        drop(data);

        let expected_g = weight_v.sqr().unwrap().sum_keepdim((1, 2)).unwrap().sqrt().unwrap();
        assert!(max_abs_diff(&weight_g, &expected_g).unwrap() < 1e-5);
        assert!(max_abs_diff(&conv.weight().unwrap(), &weight_v).unwrap() < 1e-5);
    }

    #[test]
    fn test_same_padding_preserves_length() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        for dilation in [1, 2, 4, 8] {
            let conv =
                WeightNormConv1d::new(4, 8, 3, dilated(dilation, 3), vb.pp(format!("c{dilation}")))
                    .unwrap();
            let x = Tensor::randn(0f32, 1.0, (2, 4, 20), &device).unwrap();
            assert_eq!(conv.forward(&x).unwrap().dims(), &[2, 8, 20]);
        }
    }

    #[test]
    fn test_remove_weight_norm_preserves_output() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let mut conv = WeightNormConv1d::new(3, 5, 3, dilated(2, 3), vb).unwrap();
        // move g away from ||v|| so the folding is exercised
        {
            let data = varmap.data().lock().unwrap();
            let g = data.get("weight_g").unwrap();
            g.set(&Tensor::new(&[[[0.5f32]], [[1.5]], [[2.0]], [[0.1]], [[3.0]]], &device).unwrap())
                .unwrap();
        }

        let x = Tensor::randn(0f32, 1.0, (2, 3, 16), &device).unwrap();
        let before = conv.forward(&x).unwrap();
        conv.remove_weight_norm().unwrap();
        assert!(!conv.has_weight_norm());
        let after = conv.forward(&x).unwrap();

        assert!(max_abs_diff(&before, &after).unwrap() < 1e-5);

        // idempotent
        conv.remove_weight_norm().unwrap();
        assert!(max_abs_diff(&after, &conv.forward(&x).unwrap()).unwrap() < 1e-6);
    }

    #[test]
    fn test_loads_folded_weight() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut trained = WeightNormConv1d::new(3, 4, 3, dilated(2, 3), vb).unwrap();
        trained.remove_weight_norm().unwrap();

        let mut tensors = std::collections::HashMap::new();
        tensors.insert("weight".to_string(), trained.weight().unwrap());
        tensors.insert(
            "bias".to_string(),
            varmap.data().lock().unwrap().get("bias").unwrap().as_tensor().clone(),
        );
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        let loaded = WeightNormConv1d::new(3, 4, 3, dilated(2, 3), vb).unwrap();
        assert!(!loaded.has_weight_norm());

        let x = Tensor::randn(0f32, 1.0, (2, 3, 12), &device).unwrap();
        let diff = max_abs_diff(&trained.forward(&x).unwrap(), &loaded.forward(&x).unwrap()).unwrap();
        assert!(diff < 1e-6);
    }
}
