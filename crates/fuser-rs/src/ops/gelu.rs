//! Backward pass of the tanh-approximated GELU with a fused bias add.
//!
//! For `u = input + bias` and `t = tanh(k0 * u * (1 + k1 * u^2))` the gradient is
//! `grad * (0.5 * u * (1 - t^2) * (k2 * u^2 + k0) + 0.5 * (1 + t))`, where `k2 = 3 * k0 * k1`.

use anyhow::{ensure, Result};

use crate::backend::spec::DType;
use crate::fusion::FusionDefinition;
use crate::tensor::Tensor;

/// `sqrt(2 / pi)`.
pub const GELU_K0: f64 = 0.79788456;
pub const GELU_K1: f64 = 0.044715;
/// `3 * GELU_K0 * GELU_K1`.
pub const GELU_K2: f64 = 0.1070322243;

/// Adds the GELU backward graph to `fd`.
///
/// Inputs are `input [-1, -1]`, `grad [-1, -1]` and `bias [-1]`, all contiguous and of
/// `dtype`. Half-precision inputs are computed in `F32` and the single output is cast back.
pub fn gelu_bwd_fusion(fd: &mut FusionDefinition, dtype: DType) -> Result<()> {
    let mut input = fd.define_tensor(&[-1, -1], &[Some(true), Some(true)], dtype)?;
    let mut grad = fd.define_tensor(&[-1, -1], &[Some(true), Some(true)], dtype)?;
    let mut bias = fd.define_tensor(&[-1], &[Some(true)], dtype)?;
    if dtype.is_reduced_precision() {
        input = fd.cast(input, DType::F32)?;
        grad = fd.cast(grad, DType::F32)?;
        bias = fd.cast(bias, DType::F32)?;
    }

    let bias = fd.broadcast_in_dim(bias, &[1, -1], &[1])?;
    let u = fd.add(input, bias)?;
    let scaled = fd.mul(u, GELU_K0)?;
    let cubic = fd.mul(u, GELU_K1)?;
    let cubic = fd.mul(cubic, u)?;
    let cubic = fd.add(1.0, cubic)?;
    let inner = fd.mul(scaled, cubic)?;
    let t = fd.tanh(inner)?;

    let half_u = fd.mul(u, 0.5)?;
    let t_sq = fd.mul(t, t)?;
    let neg_t_sq = fd.neg(t_sq)?;
    let sech_sq = fd.add(neg_t_sq, 1.0)?;
    let poly = fd.mul(u, GELU_K2)?;
    let poly = fd.mul(poly, u)?;
    let poly = fd.add(poly, GELU_K0)?;
    let slope = fd.mul(sech_sq, poly)?;
    let left = fd.mul(half_u, slope)?;
    let right = fd.add(t, 1.0)?;
    let right = fd.mul(right, 0.5)?;
    let dgelu = fd.add(left, right)?;
    let mut out = fd.mul(grad, dgelu)?;

    if dtype.is_reduced_precision() {
        out = fd.cast(out, dtype)?;
    }
    fd.add_output(out)
}

/// Tanh-approximated GELU of a single value, in double precision.
pub fn gelu_tanh_f64(x: f64) -> f64 {
    0.5 * x * (1.0 + (GELU_K0 * x * (1.0 + GELU_K1 * x * x)).tanh())
}

fn gelu_tanh_grad_f64(u: f64) -> f64 {
    let t = (GELU_K0 * u * (1.0 + GELU_K1 * u * u)).tanh();
    0.5 * u * (1.0 - t * t) * (GELU_K2 * u * u + GELU_K0) + 0.5 * (1.0 + t)
}

fn check_gelu_operands(input: &Tensor, grad: &Tensor, bias: &Tensor) -> Result<()> {
    ensure!(
        input.dim() == 2,
        "gelu_bwd input must be 2-D, got {:?}",
        input.sizes()
    );
    ensure!(
        grad.sizes() == input.sizes(),
        "gelu_bwd grad {:?} does not match input {:?}",
        grad.sizes(),
        input.sizes()
    );
    ensure!(
        bias.sizes() == [input.sizes()[1]],
        "gelu_bwd bias {:?} does not match the last input axis of {:?}",
        bias.sizes(),
        input.sizes()
    );
    Ok(())
}

/// Double-precision reference gradient; the result is an `F64` tensor.
pub fn gelu_bwd_reference_f64(input: &Tensor, grad: &Tensor, bias: &Tensor) -> Result<Tensor> {
    check_gelu_operands(input, grad, bias)?;
    let cols = input.sizes()[1];
    let bias = bias.to_vec_f64();
    let values: Vec<f64> = input
        .to_vec_f64()
        .into_iter()
        .zip(grad.to_vec_f64())
        .enumerate()
        .map(|(i, (x, g))| g * gelu_tanh_grad_f64(x + bias[i % cols]))
        .collect();
    Tensor::from_vec(input.sizes().to_vec(), values, DType::F64)
}

/// Unfused baseline: one host tensor op per step, every intermediate rounded to the operand
/// dtype.
pub fn gelu_bwd_eager(input: &Tensor, grad: &Tensor, bias: &Tensor) -> Result<Tensor> {
    check_gelu_operands(input, grad, bias)?;
    let u = input.add(bias)?;
    let u_sq = u.square();
    let inner = u_sq
        .mul_scalar(GELU_K1)
        .add_scalar(1.0)
        .mul(&u)?
        .mul_scalar(GELU_K0);
    let t = inner.tanh();
    let sech_sq = t.square().rsub_scalar(1.0);
    let poly = u_sq.mul_scalar(GELU_K2).add_scalar(GELU_K0);
    let left = u.mul_scalar(0.5).mul(&sech_sq)?.mul(&poly)?;
    let right = t.add_scalar(1.0).mul_scalar(0.5);
    grad.mul(&left.add(&right)?)
}
