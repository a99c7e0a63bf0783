//! WaveGlow flow stack
//!
//! Audio is squeezed into groups of `n_group` consecutive samples, one sample
//! per channel, and pushed through `n_flows` layers of
//! [channel mixing -> affine coupling]. Every `n_early_every` layers the
//! first `n_early_size` channels leave the stack and go straight to the
//! latent code. The inverse runs the layers backwards, putting fresh noise
//! back in where channels were released.
//!
//! ```text
//! layer      0  1  2  3  4  5  6  7  8  9 10 11
//! channels   8  8  8  8  6  6  6  6  4  4  4  4
//! ```

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::config::WaveGlowConfig;
use super::coupling::AffineCoupling;
use super::invertible_conv::Invertible1x1Conv;
use super::ops::{group_audio, group_conditioning, ungroup_audio};
use super::upsample::FeatureUpsampler;
use crate::error::FlowError;
use crate::generation::{NoiseSource, ReplayNoise};

/// Channel schedule of the flow stack.
///
/// Fixed at construction; forward and inverse use the same instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowSchedule {
    n_flows: usize,
    n_group: usize,
    n_early_every: usize,
    n_early_size: usize,
}

impl FlowSchedule {
    /// Validate and build a schedule.
    ///
    /// # Arguments
    /// * `n_flows` - Number of flow layers
    /// * `n_group` - Channels at layer 0 (even)
    /// * `n_early_every` - Release period in layers
    /// * `n_early_size` - Channels released per early exit (even)
    pub fn new(n_flows: usize, n_group: usize, n_early_every: usize, n_early_size: usize) -> Result<Self> {
        if n_flows == 0 {
            return Err(FlowError::InvalidConfig("n_flows must be positive".into()).into());
        }
        if n_group == 0 || n_group % 2 != 0 {
            return Err(FlowError::InvalidConfig(format!(
                "n_group must be even and positive, got {}",
                n_group
            ))
            .into());
        }
        if n_early_every == 0 {
            return Err(FlowError::InvalidConfig("n_early_every must be positive".into()).into());
        }
        if n_early_size % 2 != 0 {
            return Err(FlowError::InvalidConfig(format!(
                "n_early_size must be even, got {}",
                n_early_size
            ))
            .into());
        }

        let released = ((n_flows - 1) / n_early_every) * n_early_size;
        if released + 2 > n_group {
            return Err(FlowError::InvalidConfig(format!(
                "releasing {} of {} channels leaves fewer than 2 for the last layer",
                released, n_group
            ))
            .into());
        }

        Ok(Self {
            n_flows,
            n_group,
            n_early_every,
            n_early_size,
        })
    }

    pub fn from_config(config: &WaveGlowConfig) -> Result<Self> {
        Self::new(
            config.n_flows,
            config.n_group,
            config.n_early_every,
            config.n_early_size,
        )
    }

    /// Whether channels are released before layer `k`.
    pub fn is_early_exit(&self, k: usize) -> bool {
        k > 0 && k % self.n_early_every == 0
    }

    /// Active channel count of every layer.
    pub fn remaining_channels(&self) -> Vec<usize> {
        let mut remaining = self.n_group;
        (0..self.n_flows)
            .map(|k| {
                if self.is_early_exit(k) {
                    remaining -= self.n_early_size;
                }
                remaining
            })
            .collect()
    }

    /// Channels still active after the last layer.
    pub fn final_remaining(&self) -> usize {
        self.n_group - self.n_early_exits() * self.n_early_size
    }

    /// Number of early exits in the stack.
    pub fn n_early_exits(&self) -> usize {
        (self.n_flows - 1) / self.n_early_every
    }

    pub fn n_flows(&self) -> usize {
        self.n_flows
    }

    pub fn n_group(&self) -> usize {
        self.n_group
    }

    pub fn n_early_every(&self) -> usize {
        self.n_early_every
    }

    pub fn n_early_size(&self) -> usize {
        self.n_early_size
    }
}

/// Result of the training-direction pass.
#[derive(Debug)]
pub struct FlowOutput {
    /// Latent code `[batch, n_group, groups]`
    pub z: Tensor,
    /// `(log_s1, log_s2)` of every coupling, in layer order
    pub log_s: Vec<(Tensor, Tensor)>,
    /// Channel-mixing log-determinant of every layer (F32 scalars)
    pub log_det_w: Vec<Tensor>,
}

struct FlowLayer {
    convinv: Invertible1x1Conv,
    coupling: AffineCoupling,
}

/// WaveGlow normalizing flow.
pub struct WaveGlow {
    config: WaveGlowConfig,
    schedule: FlowSchedule,
    upsample: FeatureUpsampler,
    layers: Vec<FlowLayer>,
    dtype: DType,
    device: Device,
}

impl WaveGlow {
    /// Build the model from a variable builder.
    ///
    /// Fresh channel-mixing weights are drawn from an entropy-seeded
    /// generator; use [`WaveGlow::new_with_rng`] for reproducible init.
    pub fn new(config: &WaveGlowConfig, vb: VarBuilder) -> Result<Self> {
        Self::new_with_rng(config, vb, &mut StdRng::from_entropy())
    }

    /// Build the model, drawing fresh channel-mixing weights from `rng`.
    ///
    /// Parameters are requested in `config.precision` under the names
    /// `upsample.*`, `convinv.{k}.conv.weight`, `WN1.{k}.*` and `WN2.{k}.*`.
    pub fn new_with_rng<R: Rng + ?Sized>(config: &WaveGlowConfig, vb: VarBuilder, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let schedule = FlowSchedule::from_config(config)?;
        let dtype = config.precision.dtype();
        let vb = vb.set_dtype(dtype);
        let device = vb.device().clone();
        // candle's CPU matmul has no bf16 kernel
        if dtype == DType::BF16 && device.is_cpu() {
            return Err(FlowError::InvalidConfig("bf16 precision needs a cuda or metal device".into()).into());
        }

        let upsample = FeatureUpsampler::new(
            config.n_mel_channels,
            config.upsample_kernel_size,
            config.upsample_stride,
            vb.pp("upsample"),
        )?;

        let n_cond_channels = config.grouped_cond_channels();
        let mut layers = Vec::with_capacity(config.n_flows);
        for (k, channels) in schedule.remaining_channels().into_iter().enumerate() {
            let convinv = Invertible1x1Conv::new(channels, vb.pp("convinv").pp(k).pp("conv"), rng)?;
            let coupling = AffineCoupling::new(
                channels / 2,
                n_cond_channels,
                &config.wn_config,
                config.inverse_conditioning,
                config.log_scale_clamp,
                vb.pp("WN1").pp(k),
                vb.pp("WN2").pp(k),
            )?;
            layers.push(FlowLayer { convinv, coupling });
        }

        Ok(Self {
            config: config.clone(),
            schedule,
            upsample,
            layers,
            dtype,
            device,
        })
    }

    pub fn config(&self) -> &WaveGlowConfig {
        &self.config
    }

    pub fn schedule(&self) -> &FlowSchedule {
        &self.schedule
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Training direction.
    ///
    /// # Arguments
    /// * `spect` - Conditioning features `[batch, n_mel_channels, frames]`
    /// * `audio` - Waveform `[batch, samples]`, `samples` a multiple of `n_group`
    pub fn forward(&self, spect: &Tensor, audio: &Tensor) -> Result<FlowOutput> {
        let n_group = self.schedule.n_group();
        let spect = self.check_features(spect)?;
        let audio = audio.to_device(&self.device)?.to_dtype(self.dtype)?;
        let (_, samples) = audio.dims2()?;

        let spect = self.upsample.forward(&spect)?;
        let available = spect.dim(2)?;
        if available < samples {
            return Err(FlowError::ConditioningTooShort {
                conditioning: available,
                audio: samples,
            }
            .into());
        }
        let spect = spect.narrow(2, 0, samples)?;

        let mut audio = group_audio(&audio, n_group)?;
        let spect = group_conditioning(&spect, n_group)?;

        let mut output_audio = Vec::with_capacity(self.schedule.n_early_exits() + 1);
        let mut log_s = Vec::with_capacity(self.layers.len());
        let mut log_det_w = Vec::with_capacity(self.layers.len());

        for (k, layer) in self.layers.iter().enumerate() {
            if self.schedule.is_early_exit(k) {
                let early = self.schedule.n_early_size();
                let active = audio.dim(1)?;
                output_audio.push(audio.narrow(1, 0, early)?);
                audio = audio.narrow(1, early, active - early)?;
            }

            let (mixed, log_det) = layer.convinv.forward(&audio)?;
            log_det_w.push(log_det);

            let out = layer.coupling.forward(&mixed, &spect)?;
            log_s.push((out.log_s1, out.log_s2));
            audio = out.audio;
        }
        output_audio.push(audio);

        Ok(FlowOutput {
            z: Tensor::cat(&output_audio, 1)?,
            log_s,
            log_det_w,
        })
    }

    /// Sampling direction.
    ///
    /// Draws the initial remaining channels and every re-inserted group from
    /// `noise`, scaled by `sigma`. Returns a waveform `[batch, samples]` with
    /// `samples` the trimmed upsampled length rounded down to a multiple of
    /// `n_group`.
    pub fn infer(&mut self, spect: &Tensor, sigma: f64, noise: &mut dyn NoiseSource) -> Result<Tensor> {
        self.run_inverse(spect, sigma, noise, None)
    }

    /// Invert a latent code produced by [`WaveGlow::forward`].
    ///
    /// `spect` must be the conditioning the latent was computed with. The
    /// output has `z.dim(2) * n_group` samples, the length of the audio the
    /// latent came from.
    pub fn decode_latent(&mut self, spect: &Tensor, z: &Tensor) -> Result<Tensor> {
        let groups = z.dim(2)?;
        let mut replay = ReplayNoise::from_latent(&self.schedule, z)?;
        self.run_inverse(spect, 1.0, &mut replay, Some(groups))
    }

    fn run_inverse(
        &mut self,
        spect: &Tensor,
        sigma: f64,
        noise: &mut dyn NoiseSource,
        groups: Option<usize>,
    ) -> Result<Tensor> {
        if !sigma.is_finite() || sigma < 0.0 {
            return Err(FlowError::InvalidConfig(format!(
                "sampling sigma must be finite and non-negative, got {}",
                sigma
            ))
            .into());
        }
        let n_group = self.schedule.n_group();
        let spect = self.check_features(spect)?;

        let spect = self.upsample.forward_trimmed(&spect)?;
        let (batch, _, len) = spect.dims3()?;
        let mut usable = len - len % n_group;
        if let Some(groups) = groups {
            if groups * n_group > usable {
                return Err(FlowError::ConditioningTooShort {
                    conditioning: usable,
                    audio: groups * n_group,
                }
                .into());
            }
            usable = groups * n_group;
        }
        if usable == 0 {
            return Err(FlowError::UngroupableLength { len, group: n_group }.into());
        }
        let spect = group_conditioning(&spect.narrow(2, 0, usable)?, n_group)?;
        let groups = usable / n_group;

        let mut audio = (noise.sample(
            (batch, self.schedule.final_remaining(), groups),
            self.dtype,
            &self.device,
        )? * sigma)?;

        for k in (0..self.layers.len()).rev() {
            let layer = &mut self.layers[k];
            audio = layer.coupling.inverse(&audio, &spect)?;
            audio = layer.convinv.inverse(&audio)?;

            if self.schedule.is_early_exit(k) {
                let z = (noise.sample(
                    (batch, self.schedule.n_early_size(), groups),
                    self.dtype,
                    &self.device,
                )? * sigma)?;
                audio = Tensor::cat(&[&z, &audio], 1)?;
            }
        }

        ungroup_audio(&audio)
    }

    /// Fold weight normalization into every conditioning network.
    pub fn remove_weight_norm(&mut self) -> Result<()> {
        for layer in self.layers.iter_mut() {
            layer.coupling.remove_weight_norm()?;
        }
        Ok(())
    }

    pub fn has_weight_norm(&self) -> bool {
        self.layers.iter().any(|layer| layer.coupling.has_weight_norm())
    }

    /// Discard cached inverse mixing matrices after the weights changed.
    pub fn weights_updated(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.convinv.invalidate_inverse();
        }
    }

    /// Channel-mixing transform of layer `k`.
    pub fn convinv(&self, k: usize) -> Option<&Invertible1x1Conv> {
        self.layers.get(k).map(|layer| &layer.convinv)
    }

    fn check_features(&self, spect: &Tensor) -> Result<Tensor> {
        let channels = spect.dim(1)?;
        if channels != self.config.n_mel_channels {
            anyhow::bail!(
                "conditioning has {} channels, model expects {}",
                channels,
                self.config.n_mel_channels
            );
        }
        Ok(spect.to_device(&self.device)?.to_dtype(self.dtype)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::config::WnConfig;
    use candle_nn::VarMap;

    fn small_config() -> WaveGlowConfig {
        WaveGlowConfig {
            n_mel_channels: 4,
            n_flows: 6,
            n_group: 8,
            n_early_every: 2,
            n_early_size: 2,
            wn_config: WnConfig {
                n_layers: 2,
                n_channels: 8,
                kernel_size: 3,
            },
            upsample_kernel_size: 16,
            upsample_stride: 8,
            ..Default::default()
        }
    }

    fn build(config: &WaveGlowConfig, varmap: &VarMap) -> WaveGlow {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        WaveGlow::new_with_rng(config, vb, &mut StdRng::seed_from_u64(0)).unwrap()
    }

    #[test]
    fn test_default_schedule() {
        let schedule = FlowSchedule::new(12, 8, 4, 2).unwrap();
        assert_eq!(
            schedule.remaining_channels(),
            vec![8, 8, 8, 8, 6, 6, 6, 6, 4, 4, 4, 4]
        );
        assert_eq!(schedule.n_early_exits(), 2);
        assert_eq!(schedule.final_remaining(), 4);
        assert_eq!(
            schedule.n_early_exits() * schedule.n_early_size() + schedule.final_remaining(),
            8
        );
        assert!(!schedule.is_early_exit(0));
        assert!(schedule.is_early_exit(4));
        assert!(!schedule.is_early_exit(5));
    }

    #[test]
    fn test_schedule_without_releases() {
        let schedule = FlowSchedule::new(3, 4, 4, 2).unwrap();
        assert_eq!(schedule.remaining_channels(), vec![4, 4, 4]);
        assert_eq!(schedule.final_remaining(), 4);
    }

    #[test]
    fn test_schedule_rejects_bad_shapes() {
        for (n_flows, n_group, every, size) in [
            (0, 8, 4, 2),
            (12, 7, 4, 2),
            (12, 0, 4, 2),
            (12, 8, 0, 2),
            (12, 8, 4, 3),
            (12, 8, 2, 2),
        ] {
            let err = FlowSchedule::new(n_flows, n_group, every, size).unwrap_err();
            assert!(
                matches!(err.downcast_ref::<FlowError>(), Some(FlowError::InvalidConfig(_))),
                "{:?}",
                (n_flows, n_group, every, size)
            );
        }
    }

    #[test]
    fn test_parameter_names() {
        let varmap = VarMap::new();
        let _model = build(&small_config(), &varmap);
        let data = varmap.data().lock().unwrap();
        for name in [
            "upsample.weight",
            "upsample.bias",
            "convinv.0.conv.weight",
            "convinv.5.conv.weight",
            "WN1.0.start.weight_g",
            "WN1.0.start.weight_v",
            "WN1.3.cond_layer.weight_v",
            "WN2.5.in_layers.1.weight_v",
            "WN2.5.res_skip_layers.0.bias",
            "WN2.5.end.weight",
        ] {
            assert!(data.contains_key(name), "missing {}", name);
        }
        assert_eq!(data["convinv.0.conv.weight"].dims(), &[8, 8, 1]);
        assert_eq!(data["convinv.2.conv.weight"].dims(), &[6, 6, 1]);
        assert_eq!(data["convinv.5.conv.weight"].dims(), &[4, 4, 1]);
        // grouped conditioning is n_mel * n_group wide
        assert_eq!(data["WN1.0.cond_layer.weight_v"].dims(), &[2 * 8 * 2, 32, 1]);
    }

    #[test]
    fn test_forward_shapes() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let model = build(&small_config(), &varmap);

        let spect = Tensor::randn(0f32, 1.0, (2, 4, 10), &device).unwrap();
        let audio = Tensor::randn(0f32, 1.0, (2, 64), &device).unwrap();
        let out = model.forward(&spect, &audio).unwrap();

        assert_eq!(out.z.dims(), &[2, 8, 8]);
        assert_eq!(out.log_s.len(), 6);
        assert_eq!(out.log_det_w.len(), 6);
        assert_eq!(out.log_s[0].0.dims(), &[2, 4, 8]);
        assert_eq!(out.log_s[5].1.dims(), &[2, 2, 8]);
    }

    #[test]
    fn test_forward_rejects_short_conditioning() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let model = build(&small_config(), &varmap);

        // (2 - 1) * 8 + 16 = 24 upsampled samples
        let spect = Tensor::randn(0f32, 1.0, (1, 4, 2), &device).unwrap();
        let audio = Tensor::randn(0f32, 1.0, (1, 32), &device).unwrap();
        let err = model.forward(&spect, &audio).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FlowError>(),
            Some(FlowError::ConditioningTooShort {
                conditioning: 24,
                audio: 32
            })
        ));
    }

    #[test]
    fn test_forward_rejects_ungroupable_audio() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let model = build(&small_config(), &varmap);

        let spect = Tensor::randn(0f32, 1.0, (1, 4, 10), &device).unwrap();
        let audio = Tensor::randn(0f32, 1.0, (1, 30), &device).unwrap();
        let err = model.forward(&spect, &audio).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FlowError>(),
            Some(FlowError::UngroupableLength { len: 30, group: 8 })
        ));
    }

    #[test]
    fn test_infer_length_and_sigma_zero() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let mut model = build(&small_config(), &varmap);

        let spect = Tensor::randn(0f32, 1.0, (1, 4, 5), &device).unwrap();
        let mut noise = crate::generation::GaussianNoise::new(7);
        let audio = model.infer(&spect, 0.0, &mut noise).unwrap();
        // 5 frames * stride 8
        assert_eq!(audio.dims(), &[1, 40]);
        let values: Vec<f32> = audio.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_infer_rejects_negative_sigma() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let mut model = build(&small_config(), &varmap);
        let spect = Tensor::randn(0f32, 1.0, (1, 4, 5), &device).unwrap();
        let mut noise = crate::generation::GaussianNoise::new(7);
        assert!(model.infer(&spect, -1.0, &mut noise).is_err());
        assert!(model.infer(&spect, f64::NAN, &mut noise).is_err());
    }

    #[test]
    fn test_weights_updated_clears_inverse_cache() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let mut model = build(&small_config(), &varmap);
        let spect = Tensor::randn(0f32, 1.0, (1, 4, 3), &device).unwrap();
        let mut noise = crate::generation::GaussianNoise::new(1);
        model.infer(&spect, 1.0, &mut noise).unwrap();
        assert!(model.convinv(0).unwrap().has_cached_inverse());

        model.weights_updated();
        assert!(!model.convinv(0).unwrap().has_cached_inverse());
    }

    #[test]
    fn test_bf16_rejected_on_cpu() {
        let varmap = VarMap::new();
        let config = WaveGlowConfig {
            precision: crate::models::config::Precision::Bf16,
            ..small_config()
        };
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let err = WaveGlow::new_with_rng(&config, vb, &mut StdRng::seed_from_u64(0))
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<FlowError>(),
            Some(FlowError::InvalidConfig(_))
        ));
    }
}
