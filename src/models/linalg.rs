//! Dense linear algebra for the small square matrices of the channel mixers
//!
//! candle has no determinant or inverse, and the matrices here are at most
//! `n_group x n_group`, so they are handled on the host in f64.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::FlowError;

/// Pivots smaller than this fraction of the largest entry are treated as zero.
const PIVOT_EPS: f64 = 1e-12;

/// Row-major square matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    n: usize,
    data: Vec<f64>,
}

impl Matrix {
    pub fn identity(n: usize) -> Self {
        let mut data = vec![0.0; n * n];
        for i in 0..n {
            data[i * n + i] = 1.0;
        }
        Self { n, data }
    }

    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self> {
        let n = rows.len();
        if rows.iter().any(|r| r.len() != n) {
            anyhow::bail!("matrix rows must all have length {}", n);
        }
        Ok(Self {
            n,
            data: rows.into_iter().flatten().collect(),
        })
    }

    /// Read a `[n, n]` tensor of any float dtype.
    pub fn from_tensor(t: &Tensor) -> Result<Self> {
        let (rows, cols) = t.dims2()?;
        if rows != cols {
            anyhow::bail!("expected a square matrix, got {}x{}", rows, cols);
        }
        let data: Vec<f64> = t.to_dtype(DType::F64)?.flatten_all()?.to_vec1()?;
        Ok(Self { n: rows, data })
    }

    pub fn to_tensor(&self, dtype: DType, device: &Device) -> Result<Tensor> {
        let t = Tensor::from_vec(self.data.clone(), (self.n, self.n), device)?;
        Ok(t.to_dtype(dtype)?)
    }

    /// Random orthonormal matrix with determinant +1.
    ///
    /// Orthonormalizes the columns of a standard-normal matrix (the Q factor
    /// of its QR decomposition) and flips the first column if the result is
    /// a reflection.
    pub fn random_orthonormal<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Self {
        loop {
            let data: Vec<f64> = (0..n * n)
                .map(|_| -> f64 { StandardNormal.sample(&mut *rng) })
                .collect();
            let mut q = Self { n, data };
            if !q.orthonormalize_columns() {
                // rank-deficient draw, practically never happens
                continue;
            }
            if q.determinant() < 0.0 {
                for i in 0..n {
                    q.data[i * n] = -q.data[i * n];
                }
            }
            return q;
        }
    }

    pub fn size(&self) -> usize {
        self.n
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.n + col]
    }

    pub fn transpose(&self) -> Self {
        let n = self.n;
        let mut data = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..n {
                data[j * n + i] = self.data[i * n + j];
            }
        }
        Self { n, data }
    }

    pub fn matmul(&self, other: &Self) -> Self {
        let n = self.n;
        let mut data = vec![0.0; n * n];
        for i in 0..n {
            for k in 0..n {
                let a = self.data[i * n + k];
                for j in 0..n {
                    data[i * n + j] += a * other.data[k * n + j];
                }
            }
        }
        Self { n, data }
    }

    /// Determinant by LU elimination with partial pivoting.
    pub fn determinant(&self) -> f64 {
        match self.lu() {
            Some(lu) => lu.determinant(),
            None => 0.0,
        }
    }

    /// `log |det|`, `-inf` for a singular matrix.
    pub fn log_abs_determinant(&self) -> f64 {
        match self.lu() {
            Some(lu) => lu.log_abs_determinant(),
            None => f64::NEG_INFINITY,
        }
    }

    /// Matrix inverse, failing with [`FlowError::SingularMatrix`].
    pub fn inverse(&self) -> Result<Self> {
        let lu = self.lu().ok_or(FlowError::SingularMatrix)?;
        Ok(lu.inverse())
    }

    fn lu(&self) -> Option<Lu> {
        let n = self.n;
        let mut a = self.data.clone();
        let mut perm: Vec<usize> = (0..n).collect();
        let mut swaps = 0usize;
        let tolerance = PIVOT_EPS * a.iter().fold(0.0f64, |m, v| m.max(v.abs()));

        for col in 0..n {
            let mut pivot_row = col;
            let mut pivot_val = a[col * n + col].abs();
            for row in (col + 1)..n {
                let v = a[row * n + col].abs();
                if v > pivot_val {
                    pivot_val = v;
                    pivot_row = row;
                }
            }
            if !(pivot_val > tolerance) {
                return None;
            }
            if pivot_row != col {
                for k in 0..n {
                    a.swap(col * n + k, pivot_row * n + k);
                }
                perm.swap(col, pivot_row);
                swaps += 1;
            }

            let pivot = a[col * n + col];
            for row in (col + 1)..n {
                let factor = a[row * n + col] / pivot;
                a[row * n + col] = factor;
                for k in (col + 1)..n {
                    a[row * n + k] -= factor * a[col * n + k];
                }
            }
        }

        Some(Lu { n, a, perm, swaps })
    }

    /// Modified Gram-Schmidt over the columns. Returns false on a
    /// (numerically) dependent column.
    fn orthonormalize_columns(&mut self) -> bool {
        let n = self.n;
        for i in 0..n {
            let norm = (0..n).map(|r| self.data[r * n + i].powi(2)).sum::<f64>().sqrt();
            if norm < 1e-10 {
                return false;
            }
            for r in 0..n {
                self.data[r * n + i] /= norm;
            }
            for j in (i + 1)..n {
                let dot: f64 = (0..n)
                    .map(|r| self.data[r * n + i] * self.data[r * n + j])
                    .sum();
                for r in 0..n {
                    self.data[r * n + j] -= dot * self.data[r * n + i];
                }
            }
        }
        true
    }
}

/// Packed LU factors of a row-permuted matrix: `P A = L U`.
struct Lu {
    n: usize,
    a: Vec<f64>,
    perm: Vec<usize>,
    swaps: usize,
}

impl Lu {
    fn determinant(&self) -> f64 {
        let sign = if self.swaps % 2 == 0 { 1.0 } else { -1.0 };
        (0..self.n).fold(sign, |acc, i| acc * self.a[i * self.n + i])
    }

    fn log_abs_determinant(&self) -> f64 {
        (0..self.n).map(|i| self.a[i * self.n + i].abs().ln()).sum()
    }

    fn inverse(&self) -> Matrix {
        let n = self.n;
        let mut inv = vec![0.0; n * n];
        for col in 0..n {
            // solve A x = e_col via L y = P e_col, U x = y
            let mut x: Vec<f64> = (0..n)
                .map(|i| if self.perm[i] == col { 1.0 } else { 0.0 })
                .collect();
            for i in 0..n {
                for k in 0..i {
                    x[i] -= self.a[i * n + k] * x[k];
                }
            }
            for i in (0..n).rev() {
                for k in (i + 1)..n {
                    x[i] -= self.a[i * n + k] * x[k];
                }
                x[i] /= self.a[i * n + i];
            }
            for i in 0..n {
                inv[i * n + col] = x[i];
            }
        }
        Matrix { n, data: inv }
    }
}
