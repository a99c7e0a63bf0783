//! Invertible 1x1 convolution
//!
//! A learned square mixing of the active channels applied at every time step.
//! The forward pass also returns the log-determinant of the mixing for the
//! whole batch; the inverse pass applies the matrix inverse, which is cached
//! until the weight's version changes.

use anyhow::Result;
use candle_core::{DType, Module, Tensor, Var};
use candle_nn::{Conv1d, Init, VarBuilder};
use rand::Rng;

use super::linalg::Matrix;

struct CachedInverse {
    version: u64,
    weight: Tensor,
}

/// Invertible channel-mixing transform.
pub struct Invertible1x1Conv {
    channels: usize,
    /// Weight `[c, c, 1]`
    weight: Tensor,
    version: u64,
    cached_inverse: Option<CachedInverse>,
}

impl Invertible1x1Conv {
    /// Create a mixing transform over `channels` channels.
    ///
    /// A freshly created trainable weight is set to a random orthonormal
    /// matrix with positive determinant; weights loaded from a checkpoint are
    /// used as they are.
    pub fn new<R: Rng + ?Sized>(channels: usize, vb: VarBuilder, rng: &mut R) -> Result<Self> {
        let weight = vb.get_with_hints((channels, channels, 1), "weight", Init::Const(0.0))?;
        if weight.is_variable() {
            let init = Matrix::random_orthonormal(channels, rng)
                .to_tensor(weight.dtype(), weight.device())?
                .reshape((channels, channels, 1))?;
            Var::from_tensor(&weight)?.set(&init)?;
        }
        Ok(Self::from_weight(weight))
    }

    /// Wrap an existing `[c, c, 1]` weight.
    pub fn from_weight(weight: Tensor) -> Self {
        let channels = weight.dims()[0];
        Self {
            channels,
            weight,
            version: 0,
            cached_inverse: None,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// The mixing matrix on the host.
    pub fn weight_matrix(&self) -> Result<Matrix> {
        Matrix::from_tensor(&self.weight.squeeze(2)?)
    }

    /// Forward pass.
    ///
    /// Input `[batch, c, groups]`. Returns the mixed tensor and the scalar
    /// `batch * groups * log|det W|`. The scalar is differentiable in `W`:
    /// it is built as `sum(W * W^{-T}) - c + log|det W|`, where the first
    /// term is constant `c` in value but carries the gradient `W^{-T}`.
    pub fn forward(&self, z: &Tensor) -> Result<(Tensor, Tensor)> {
        let (batch_size, _group_size, n_of_groups) = z.dims3()?;

        let w = self.weight.squeeze(2)?.to_dtype(DType::F32)?;
        let host = Matrix::from_tensor(&w)?;
        let log_abs_det = host.log_abs_determinant();
        let inv_t = host.inverse()?.transpose().to_tensor(DType::F32, w.device())?;

        let log_det_w = (w * inv_t)?
            .sum_all()?
            .affine(1.0, log_abs_det - self.channels as f64)?
            .affine((batch_size * n_of_groups) as f64, 0.0)?;

        let z = Conv1d::new(self.weight.clone(), None, Default::default()).forward(z)?;
        Ok((z, log_det_w))
    }

    /// Inverse pass, `[batch, c, groups]` to `[batch, c, groups]`.
    ///
    /// Fails with `FlowError::SingularMatrix` if `W` cannot be inverted.
    pub fn inverse(&mut self, z: &Tensor) -> Result<Tensor> {
        let w_inverse = self.inverse_weight()?;
        Ok(Conv1d::new(w_inverse, None, Default::default()).forward(z)?)
    }

    /// Mark the weight as changed so the next inverse recomputes `W^{-1}`.
    pub fn invalidate_inverse(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    pub fn has_cached_inverse(&self) -> bool {
        matches!(&self.cached_inverse, Some(c) if c.version == self.version)
    }

    fn inverse_weight(&mut self) -> Result<Tensor> {
        if let Some(cached) = &self.cached_inverse {
            if cached.version == self.version {
                return Ok(cached.weight.clone());
            }
        }

        // inverted in f64 and cast back to the model precision
        let weight = self
            .weight_matrix()?
            .inverse()?
            .to_tensor(self.weight.dtype(), self.weight.device())?
            .unsqueeze(2)?;
        self.cached_inverse = Some(CachedInverse {
            version: self.version,
            weight: weight.clone(),
        });
        Ok(weight)
    }
}
