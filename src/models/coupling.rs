//! Affine coupling with two conditioning networks
//!
//! The active channels are split into halves `audio_0` and `audio_1`. The
//! first network sees an all-zero placeholder instead of `audio_0`, so its
//! scale and translation depend on the conditioning features only. The
//! second network sees `y_1 + audio_0`.
//!
//! ```text
//! (t_1, log_s1) = WN1(0, spect)          y_1 = exp(log_s1) * audio_0 + t_1
//! (t_2, log_s2) = WN2(y_1 + audio_0, spect)  y_2 = exp(log_s2) * audio_1 + t_2
//! ```

use anyhow::Result;
use candle_core::Tensor;
use candle_nn::VarBuilder;

use super::config::{InverseConditioning, WnConfig};
use super::wn::WN;

/// Output of a forward coupling step.
pub struct CouplingOutput {
    /// `[y_1, y_2]` concatenated on the channel axis
    pub audio: Tensor,
    pub log_s1: Tensor,
    pub log_s2: Tensor,
}

/// Affine coupling transform of one flow layer.
pub struct AffineCoupling {
    wn1: WN,
    wn2: WN,
    n_half: usize,
    inverse_conditioning: InverseConditioning,
    log_scale_clamp: Option<f64>,
}

impl AffineCoupling {
    /// Build the two conditioning networks for `n_half` channels per half.
    ///
    /// `vb_wn1` and `vb_wn2` are the builders for each network (the flow
    /// stack hands out `WN1.{k}` and `WN2.{k}`).
    pub fn new(
        n_half: usize,
        n_cond_channels: usize,
        wn_config: &WnConfig,
        inverse_conditioning: InverseConditioning,
        log_scale_clamp: Option<f64>,
        vb_wn1: VarBuilder,
        vb_wn2: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            wn1: WN::new(n_half, n_cond_channels, wn_config, vb_wn1)?,
            wn2: WN::new(n_half, n_cond_channels, wn_config, vb_wn2)?,
            n_half,
            inverse_conditioning,
            log_scale_clamp,
        })
    }

    pub fn n_half(&self) -> usize {
        self.n_half
    }

    /// Forward (training) direction.
    ///
    /// `audio` is `[batch, 2 * n_half, groups]`, `spect` the grouped
    /// conditioning tensor.
    pub fn forward(&self, audio: &Tensor, spect: &Tensor) -> Result<CouplingOutput> {
        let n_half = self.n_half;
        let audio_0 = audio.narrow(1, 0, n_half)?;
        let audio_1 = audio.narrow(1, n_half, n_half)?;

        let (t_1, log_s1) = self.scale_and_shift(&self.wn1, &audio_0.zeros_like()?, spect)?;
        let y_1 = ((log_s1.exp()? * &audio_0)? + t_1)?;

        let (t_2, log_s2) = self.scale_and_shift(&self.wn2, &(&y_1 + &audio_0)?, spect)?;
        let y_2 = ((log_s2.exp()? * &audio_1)? + t_2)?;

        Ok(CouplingOutput {
            audio: Tensor::cat(&[&y_1, &y_2], 1)?,
            log_s1,
            log_s2,
        })
    }

    /// Inverse (sampling) direction, `[y_1, y_2]` to `[x_a, x_b]`.
    pub fn inverse(&self, audio: &Tensor, spect: &Tensor) -> Result<Tensor> {
        let n_half = self.n_half;
        let audio_0 = audio.narrow(1, 0, n_half)?;
        let audio_1 = audio.narrow(1, n_half, n_half)?;

        let (t_1, log_s1) = self.scale_and_shift(&self.wn1, &audio_0.zeros_like()?, spect)?;
        let y_1 = &audio_0;
        let x_a = ((y_1 - t_1)? / log_s1.exp()?)?;

        let wn2_input = match self.inverse_conditioning {
            InverseConditioning::Legacy => ((y_1 + &audio_0)? * 0.5)?,
            InverseConditioning::Exact => (y_1 + &x_a)?,
        };
        let (t_2, log_s2) = self.scale_and_shift(&self.wn2, &wn2_input, spect)?;
        let y_2 = &audio_1;
        let x_b = ((y_2 - t_2)? / log_s2.exp()?)?;

        Ok(Tensor::cat(&[&x_a, &x_b], 1)?)
    }

    /// Fold weight norm in both conditioning networks.
    pub fn remove_weight_norm(&mut self) -> Result<()> {
        self.wn1.remove_weight_norm()?;
        self.wn2.remove_weight_norm()
    }

    pub fn has_weight_norm(&self) -> bool {
        self.wn1.has_weight_norm() || self.wn2.has_weight_norm()
    }

    /// Split a WN output into `(t, log_s)`.
    fn scale_and_shift(&self, wn: &WN, input: &Tensor, spect: &Tensor) -> Result<(Tensor, Tensor)> {
        let output = wn.forward(input, spect)?;
        let t = output.narrow(1, 0, self.n_half)?;
        let log_s = output.narrow(1, self.n_half, self.n_half)?;
        let log_s = match self.log_scale_clamp {
            Some(c) => log_s.clamp(-c, c)?,
            None => log_s,
        };
        Ok((t, log_s))
    }
}
