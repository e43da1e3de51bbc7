//! Eager elementwise ops on host tensors.
//!
//! Every op produces a fresh row-major tensor and rounds its result to the output dtype, the
//! same way an eager framework materializes one kernel per op. The benchmark harness uses these
//! as the unfused baseline.

use super::{DType, Tensor};
use crate::layout::contiguous_strides;
use anyhow::{bail, Result};

/// Numpy-style broadcast of two shapes (trailing axes aligned, size-1 axes expand).
pub fn broadcast_shapes(lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>> {
    let rank = lhs.len().max(rhs.len());
    let mut out = vec![0usize; rank];
    for axis in 0..rank {
        let l = axis
            .checked_sub(rank - lhs.len())
            .map_or(1, |i| lhs[i]);
        let r = axis
            .checked_sub(rank - rhs.len())
            .map_or(1, |i| rhs[i]);
        out[axis] = match (l, r) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => bail!("shapes {:?} and {:?} are not broadcast compatible", lhs, rhs),
        };
    }
    Ok(out)
}

/// Strides (in row-major element units of `sizes`) that read `sizes` as if expanded to `out`.
fn expanded_strides(sizes: &[usize], out: &[usize]) -> Vec<usize> {
    let own = contiguous_strides(sizes);
    let offset = out.len() - sizes.len();
    (0..out.len())
        .map(|axis| match axis.checked_sub(offset) {
            Some(i) if sizes[i] != 1 => own[i],
            _ => 0,
        })
        .collect()
}

impl Tensor {
    /// Applies `f` to every element, keeping the dtype.
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Tensor {
        let dtype = self.dtype();
        let values: Vec<f64> = self.to_vec_f64().into_iter().map(f).collect();
        Tensor::from_values(self.sizes().to_vec(), &values, dtype)
    }

    /// Combines two tensors elementwise with broadcasting; the result dtype is promoted.
    pub fn zip_with(&self, other: &Tensor, f: impl Fn(f64, f64) -> f64) -> Result<Tensor> {
        let out = broadcast_shapes(self.sizes(), other.sizes())?;
        let lhs = self.to_vec_f64();
        let rhs = other.to_vec_f64();
        let lhs_strides = expanded_strides(self.sizes(), &out);
        let rhs_strides = expanded_strides(other.sizes(), &out);
        let numel: usize = out.iter().product();
        let mut index = vec![0usize; out.len()];
        let mut values = Vec::with_capacity(numel);
        for _ in 0..numel {
            let l: usize = index.iter().zip(&lhs_strides).map(|(i, s)| i * s).sum();
            let r: usize = index.iter().zip(&rhs_strides).map(|(i, s)| i * s).sum();
            values.push(f(lhs[l], rhs[r]));
            for axis in (0..out.len()).rev() {
                index[axis] += 1;
                if index[axis] < out[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }
        Ok(Tensor::from_values(
            out,
            &values,
            self.dtype().promote(other.dtype()),
        ))
    }

    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_with(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_with(other, |a, b| a - b)
    }

    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_with(other, |a, b| a * b)
    }

    pub fn div(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_with(other, |a, b| a / b)
    }

    pub fn add_scalar(&self, value: f64) -> Tensor {
        self.map(|a| a + value)
    }

    pub fn mul_scalar(&self, value: f64) -> Tensor {
        self.map(|a| a * value)
    }

    pub fn rsub_scalar(&self, value: f64) -> Tensor {
        self.map(|a| value - a)
    }

    pub fn tanh(&self) -> Tensor {
        self.map(f64::tanh)
    }

    pub fn square(&self) -> Tensor {
        self.map(|a| a * a)
    }

    /// Largest absolute elementwise difference, after broadcasting.
    pub fn max_abs_diff(&self, other: &Tensor) -> Result<f64> {
        let diff = self
            .to_dtype(DType::F64)
            .zip_with(&other.to_dtype(DType::F64), |a, b| (a - b).abs())?;
        Ok(diff.to_vec_f64().into_iter().fold(0.0, f64::max))
    }
}
