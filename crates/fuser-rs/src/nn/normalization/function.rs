//! Forward/backward binding of the normalization graphs to concrete tensors.
//!
//! Channels-last inputs are handled in the canonical `[N, spatial..., C]` order: the input is
//! permuted (a view, no copy) before the graph is defined, and outputs are permuted back so they
//! come out in the caller's memory format.

use anyhow::{anyhow, Result};

use super::graph::{
    norm_fusion_backward, norm_fusion_forward, NormBackwardInputs, NormBackwardOptions,
    NormGraphInputs, NormGraphOptions, StatAxes,
};
use super::NormError;
use crate::backend::spec::{DType, FusionBackend};
use crate::fusion::{FusionArg, FusionDefinition, TensorValue};
use crate::layout::{channels_first_permutation, channels_last_permutation, MemoryFormat};
use crate::tensor::Tensor;

/// Concrete operands of a normalization forward pass, in `[N, C, spatial...]` order.
#[derive(Debug, Clone, Copy)]
pub struct NormInputs<'a> {
    pub x: &'a Tensor,
    pub weight: Option<&'a Tensor>,
    pub bias: Option<&'a Tensor>,
    pub running_mean: Option<&'a Tensor>,
    pub running_var: Option<&'a Tensor>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormOptions {
    pub use_input_stats: bool,
    pub momentum: f64,
    pub eps: f64,
    pub unbiased: bool,
    pub stat_axes: StatAxes,
}

/// Everything [`NormFunction::backward`] needs from the forward pass.
///
/// Tensors are kept in the canonical `[N, spatial..., C]` order when `channels_last` is set.
#[derive(Debug, Clone)]
pub struct NormContext {
    pub x: Tensor,
    pub weight: Option<Tensor>,
    pub bias: Option<Tensor>,
    pub running_mean: Option<Tensor>,
    pub running_var: Option<Tensor>,
    pub mean: Tensor,
    pub invstd: Tensor,
    pub channels_last: bool,
    pub use_input_stats: bool,
    pub stat_axes: StatAxes,
}

#[derive(Debug, Clone)]
pub struct NormGradients {
    pub grad_input: Tensor,
    pub grad_weight: Option<Tensor>,
    pub grad_bias: Option<Tensor>,
}

/// Whether `x` is stored channels-last.
///
/// Single-channel tensors are dense in both layouts and are treated as channels-first.
pub fn detect_channels_last(x: &Tensor) -> bool {
    x.dim() >= 2
        && x.sizes()[1] > 1
        && (x.is_contiguous_format(MemoryFormat::ChannelsLast)
            || x.is_contiguous_format(MemoryFormat::ChannelsLast3d))
}

fn channels_last_format(rank: usize) -> Result<MemoryFormat, NormError> {
    match rank {
        4 => Ok(MemoryFormat::ChannelsLast),
        5 => Ok(MemoryFormat::ChannelsLast3d),
        other => Err(NormError::UnsupportedChannelsLastRank(other)),
    }
}

/// Declares `tensor` as an input and widens half-precision values to `F32`.
fn define_promoted(fd: &mut FusionDefinition, tensor: &Tensor) -> Result<TensorValue> {
    let value = fd.define_tensor_like(tensor)?;
    if tensor.dtype().is_reduced_precision() {
        fd.cast(value, DType::F32)
    } else {
        Ok(value)
    }
}

fn define_optional(
    fd: &mut FusionDefinition,
    tensor: Option<&Tensor>,
) -> Result<Option<TensorValue>> {
    tensor.map(|t| define_promoted(fd, t)).transpose()
}

fn next_output(outputs: &mut impl Iterator<Item = Tensor>, name: &str) -> Result<Tensor> {
    outputs
        .next()
        .ok_or_else(|| anyhow!("normalization fusion did not produce {name}"))
}

/// Restores `[N, C, spatial...]` order and checks the result is in `format`.
fn restore_channels_first(tensor: Tensor, format: MemoryFormat) -> Result<Tensor> {
    let restored = tensor.permute(&channels_first_permutation(tensor.dim()))?;
    if !restored.is_contiguous_format(format) {
        return Err(anyhow!(
            "output of shape {:?} with strides {:?} is not {:?}",
            restored.sizes(),
            restored.strides(),
            format
        ));
    }
    Ok(restored)
}

/// Normalization as a differentiable function with an explicit saved context.
pub struct NormFunction;

impl NormFunction {
    /// Normalizes `inputs.x` and returns the output with the context for
    /// [`NormFunction::backward`].
    ///
    /// Running statistics, when given and `use_input_stats` is set, are updated in place.
    pub fn forward(
        backend: &dyn FusionBackend,
        inputs: NormInputs<'_>,
        options: &NormOptions,
    ) -> Result<(Tensor, NormContext)> {
        if inputs.running_mean.is_some() != inputs.running_var.is_some() {
            return Err(NormError::UnpairedRunningStats.into());
        }
        let original = inputs.x;
        let channels_last = detect_channels_last(original);
        let format = if channels_last {
            Some(channels_last_format(original.dim())?)
        } else {
            None
        };
        let x = if channels_last {
            original.permute(&channels_last_permutation(original.dim()))?
        } else {
            original.clone()
        };
        let x_dtype = x.dtype();
        // Without running statistics the batch statistics are the only ones available.
        let use_input_stats = options.use_input_stats || inputs.running_mean.is_none();

        let fusion = FusionDefinition::define(|fd| {
            let tv_x = define_promoted(fd, &x)?;
            let weight = define_optional(fd, inputs.weight)?;
            let bias = define_optional(fd, inputs.bias)?;
            let running_mean = define_optional(fd, inputs.running_mean)?;
            let running_var = define_optional(fd, inputs.running_var)?;
            let momentum = fd.define_scalar_input(DType::F64);
            let eps = fd.define_scalar_input(DType::F64);

            let outputs = norm_fusion_forward(
                fd,
                &NormGraphInputs {
                    x: tv_x,
                    weight,
                    bias,
                    running_mean,
                    running_var,
                    eps,
                    momentum,
                },
                &NormGraphOptions {
                    use_input_stats,
                    channels_last,
                    unbiased: options.unbiased,
                    stat_axes: options.stat_axes,
                },
            )?;
            let out = fd.cast(outputs.out, x_dtype)?;
            fd.add_output(out)?;
            fd.add_output(outputs.mean)?;
            fd.add_output(outputs.invstd)
        })?;

        let mut args = vec![FusionArg::from(&x)];
        args.extend(
            [
                inputs.weight,
                inputs.bias,
                inputs.running_mean,
                inputs.running_var,
            ]
            .into_iter()
            .flatten()
            .map(FusionArg::from),
        );
        args.push(FusionArg::Scalar(options.momentum));
        args.push(FusionArg::Scalar(options.eps));

        tracing::trace!(
            shape = ?original.sizes(),
            dtype = %x_dtype,
            channels_last,
            use_input_stats,
            "normalization forward"
        );
        let mut outputs = fusion.execute(backend, &args)?.into_iter();
        let out = next_output(&mut outputs, "an output")?;
        let mean = next_output(&mut outputs, "a mean")?;
        let invstd = next_output(&mut outputs, "an inverse std")?;

        let out = match format {
            Some(format) => restore_channels_first(out, format)?,
            None => out,
        };
        let ctx = NormContext {
            x,
            weight: inputs.weight.cloned(),
            bias: inputs.bias.cloned(),
            running_mean: inputs.running_mean.cloned(),
            running_var: inputs.running_var.cloned(),
            mean,
            invstd,
            channels_last,
            use_input_stats,
            stat_axes: options.stat_axes,
        };
        Ok((out, ctx))
    }

    /// Gradients of the forward pass recorded in `ctx` for `grad_output`.
    ///
    /// `grad_weight` and `grad_bias` are `None` exactly when the forward pass had no weight or
    /// bias.
    pub fn backward(
        backend: &dyn FusionBackend,
        ctx: &NormContext,
        grad_output: &Tensor,
    ) -> Result<NormGradients> {
        let rank = grad_output.dim();
        let format = if ctx.channels_last {
            Some(channels_last_format(rank)?)
        } else {
            None
        };
        let grad = if ctx.channels_last {
            grad_output.permute(&channels_last_permutation(rank))?
        } else {
            grad_output.clone()
        };
        if grad.sizes() != ctx.x.sizes() {
            return Err(NormError::ShapeMismatch {
                what: "grad_output",
                expected: ctx.x.sizes().to_vec(),
                actual: grad.sizes().to_vec(),
            }
            .into());
        }
        let x_dtype = ctx.x.dtype();

        let fusion = FusionDefinition::define(|fd| {
            let x = define_promoted(fd, &ctx.x)?;
            let weight = define_optional(fd, ctx.weight.as_ref())?;
            let bias = define_optional(fd, ctx.bias.as_ref())?;
            let running_mean = define_optional(fd, ctx.running_mean.as_ref())?;
            let running_var = define_optional(fd, ctx.running_var.as_ref())?;
            let mean = define_promoted(fd, &ctx.mean)?;
            let invstd = define_promoted(fd, &ctx.invstd)?;
            let grad_output = define_promoted(fd, &grad)?;

            let grads = norm_fusion_backward(
                fd,
                &NormBackwardInputs {
                    x,
                    grad_output,
                    mean,
                    invstd,
                    weight,
                    bias,
                    running_mean,
                    running_var,
                },
                &NormBackwardOptions {
                    use_input_stats: ctx.use_input_stats,
                    channels_last: ctx.channels_last,
                    stat_axes: ctx.stat_axes,
                },
            )?;
            let grad_input = fd.cast(grads.grad_input, x_dtype)?;
            fd.add_output(grad_input)?;
            for grad in [grads.grad_weight, grads.grad_bias].into_iter().flatten() {
                let grad = fd.cast(grad, x_dtype)?;
                fd.add_output(grad)?;
            }
            Ok(())
        })?;

        let mut args = vec![FusionArg::from(&ctx.x)];
        args.extend(
            [
                ctx.weight.as_ref(),
                ctx.bias.as_ref(),
                ctx.running_mean.as_ref(),
                ctx.running_var.as_ref(),
            ]
            .into_iter()
            .flatten()
            .map(FusionArg::from),
        );
        args.push(FusionArg::from(&ctx.mean));
        args.push(FusionArg::from(&ctx.invstd));
        args.push(FusionArg::from(&grad));

        let mut outputs = fusion.execute(backend, &args)?.into_iter();
        let grad_input = next_output(&mut outputs, "grad_input")?;
        let grad_weight = ctx
            .weight
            .as_ref()
            .map(|_| next_output(&mut outputs, "grad_weight"))
            .transpose()?;
        let grad_bias = ctx
            .bias
            .as_ref()
            .map(|_| next_output(&mut outputs, "grad_bias"))
            .transpose()?;

        let grad_input = match format {
            Some(format) => restore_channels_first(grad_input, format)?,
            None => grad_input,
        };
        Ok(NormGradients {
            grad_input,
            grad_weight,
            grad_bias,
        })
    }
}
