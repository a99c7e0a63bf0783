//! Transposed 1D convolution that upsamples conditioning features
//!
//! Stretches `[batch, n_mel, frames]` features to audio rate with the
//! learned transposed convolution of the original model (kernel 1024,
//! stride 256 by default). The parameters use the `ConvTranspose1d` layout
//! (`weight` `[in, out, kernel]`, `bias` `[out]`), but the product is
//! computed as a matmul followed by an overlap-add so that gradients flow
//! through it during training.
//!
//! The raw output has `(frames - 1) * stride + kernel` samples. Training cuts
//! it down to the audio length; inference drops the last `kernel - stride`
//! samples, which only see a partial window.

use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{Init, VarBuilder};

use crate::error::FlowError;

/// Learned feature upsampler
pub struct FeatureUpsampler {
    /// Weight `[in_channels, out_channels, kernel_size]`
    weight: Tensor,
    bias: Tensor,
    kernel_size: usize,
    stride: usize,
}

impl FeatureUpsampler {
    /// Create a new upsampler.
    ///
    /// # Arguments
    /// * `channels` - Feature channels (input and output)
    /// * `kernel_size` - Size of the convolving kernel
    /// * `stride` - Upsampling factor
    /// * `vb` - Variable builder for loading weights
    pub fn new(channels: usize, kernel_size: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let bound = 1.0 / ((channels * kernel_size) as f64).sqrt();
        let init = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let weight = vb.get_with_hints((channels, channels, kernel_size), "weight", init)?;
        let bias = vb.get_with_hints(channels, "bias", init)?;
        Self::from_weights(weight, bias, stride)
    }

    /// Create from raw weight and bias tensors.
    ///
    /// Weight should have shape [in_channels, out_channels, kernel_size].
    pub fn from_weights(weight: Tensor, bias: Tensor, stride: usize) -> Result<Self> {
        if stride == 0 {
            return Err(FlowError::InvalidConfig("upsample stride must be positive".into()).into());
        }
        let kernel_size = weight.dim(2)?;
        Ok(Self {
            weight,
            bias,
            kernel_size,
            stride,
        })
    }

    /// Full transposed convolution.
    ///
    /// Input shape: [batch, in_channels, frames]
    /// Output shape: [batch, out_channels, (frames - 1) * stride + kernel_size]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, in_channels, frames) = x.dims3()?;
        let out_channels = self.weight.dim(1)?;
        let (k, s) = (self.kernel_size, self.stride);

        // split the kernel into r stride-sized taps, zero-padding the last one
        let r = k.div_ceil(s);
        let weight = if r * s > k {
            self.weight.pad_with_zeros(2, 0, r * s - k)?
        } else {
            self.weight.clone()
        };
        let weight = weight.reshape((in_channels, out_channels * r * s))?;

        // [batch, frames, out * r * s]: every frame's full output window
        let windows = x
            .transpose(1, 2)?
            .contiguous()?
            .broadcast_matmul(&weight)?
            .reshape((batch, frames, out_channels, r, s))?;

        // tap c of frame f lands on output slot f + c
        let mut out: Option<Tensor> = None;
        for c in 0..r {
            let tap = windows
                .narrow(3, c, 1)?
                .squeeze(3)?
                .permute((0, 2, 1, 3))?
                .contiguous()?
                .reshape((batch, out_channels, frames * s))?
                .pad_with_zeros(2, c * s, (r - 1 - c) * s)?;
            out = Some(match out {
                None => tap,
                Some(acc) => (acc + tap)?,
            });
        }
        let out = match out {
            Some(out) => out,
            None => anyhow::bail!("upsample kernel must be non-empty"),
        };

        let out_len = (frames.saturating_sub(1)) * s + k;
        let out = out.narrow(2, 0, out_len)?;
        Ok(out.broadcast_add(&self.bias.reshape((1, out_channels, 1))?)?)
    }

    /// Samples to drop from the end of the output at inference.
    pub fn trim(&self) -> usize {
        self.kernel_size.saturating_sub(self.stride)
    }

    /// Upsample and drop the trailing partial window.
    pub fn forward_trimmed(&self, x: &Tensor) -> Result<Tensor> {
        let out = self.forward(x)?;
        let len = out.dim(2)?;
        let keep = len.saturating_sub(self.trim());
        if keep == 0 {
            anyhow::bail!("{} upsampled samples leave nothing after trimming {}", len, self.trim());
        }
        Ok(out.narrow(2, 0, keep)?)
    }

    /// Get the stride (upsampling factor)
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }
}
