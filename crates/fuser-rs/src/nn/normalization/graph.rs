//! Generic normalization graphs.
//!
//! Instance, batch and layer normalization differ only in which named axes index the computed
//! statistics; every other axis is reduced over. The builders below take that role set and emit
//! the forward or backward graph into an existing [`FusionDefinition`].

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::NormError;
use crate::fusion::{FusionDefinition, ScalarValue, TensorValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NamedAxis {
    Batch,
    Channel,
}

/// Set of named axes the statistics are kept for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatAxes {
    pub batch: bool,
    pub channel: bool,
}

impl StatAxes {
    pub const INSTANCE: StatAxes = StatAxes {
        batch: true,
        channel: true,
    };
    pub const BATCH_NORM: StatAxes = StatAxes {
        batch: false,
        channel: true,
    };
    pub const LAYER_NORM: StatAxes = StatAxes {
        batch: true,
        channel: false,
    };

    pub fn new(axes: &[NamedAxis]) -> Self {
        Self {
            batch: axes.contains(&NamedAxis::Batch),
            channel: axes.contains(&NamedAxis::Channel),
        }
    }

    pub fn contains(self, axis: NamedAxis) -> bool {
        match axis {
            NamedAxis::Batch => self.batch,
            NamedAxis::Channel => self.channel,
        }
    }
}

/// Physical axis roles of an input of a given rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormAxes {
    pub batch_dim: usize,
    pub channel_dim: usize,
    /// Axes reduced over when computing statistics.
    pub is_spatial_dim: Vec<bool>,
    /// Axes parameters and running statistics are broadcast along.
    pub is_spatial_or_batch_dim: Vec<bool>,
}

impl NormAxes {
    pub fn new(rank: usize, channels_last: bool, stat_axes: StatAxes) -> Result<Self, NormError> {
        if rank < 2 {
            return Err(NormError::RankTooLow(rank));
        }
        let batch_dim = 0;
        let channel_dim = if channels_last { rank - 1 } else { 1 };
        let mut is_spatial_dim = vec![true; rank];
        let mut is_spatial_or_batch_dim = vec![true; rank];
        if stat_axes.batch {
            is_spatial_dim[batch_dim] = false;
        }
        if stat_axes.channel {
            is_spatial_dim[channel_dim] = false;
            is_spatial_or_batch_dim[channel_dim] = false;
        }
        Ok(Self {
            batch_dim,
            channel_dim,
            is_spatial_dim,
            is_spatial_or_batch_dim,
        })
    }

    pub fn reduction_axes(&self) -> Vec<usize> {
        self.is_spatial_dim
            .iter()
            .enumerate()
            .filter_map(|(axis, &spatial)| spatial.then_some(axis))
            .collect()
    }
}

fn paired_running_stats(
    running_mean: Option<TensorValue>,
    running_var: Option<TensorValue>,
) -> Result<Option<(TensorValue, TensorValue)>, NormError> {
    match (running_mean, running_var) {
        (Some(mean), Some(var)) => Ok(Some((mean, var))),
        (None, None) => Ok(None),
        _ => Err(NormError::UnpairedRunningStats),
    }
}

/// Graph values consumed by [`norm_fusion_forward`].
#[derive(Debug, Clone, Copy)]
pub struct NormGraphInputs {
    pub x: TensorValue,
    pub weight: Option<TensorValue>,
    pub bias: Option<TensorValue>,
    /// Updated in place through output aliases when statistics are computed from the input.
    pub running_mean: Option<TensorValue>,
    pub running_var: Option<TensorValue>,
    pub eps: ScalarValue,
    pub momentum: ScalarValue,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormGraphOptions {
    pub use_input_stats: bool,
    pub channels_last: bool,
    /// Bessel correction for the returned batch variance. Running variance updates are always
    /// unbiased.
    pub unbiased: bool,
    pub stat_axes: StatAxes,
}

#[derive(Debug, Clone, Copy)]
pub struct NormForwardOutputs {
    pub out: TensorValue,
    pub mean: TensorValue,
    pub invstd: TensorValue,
}

/// Adds a normalization forward pass to `fd`.
///
/// Returns the normalized output together with the mean and inverse standard deviation it
/// used. Outputs are not declared, except the aliased running-statistic updates, which are
/// stored back in the running tensors' own dtype.
pub fn norm_fusion_forward(
    fd: &mut FusionDefinition,
    inputs: &NormGraphInputs,
    options: &NormGraphOptions,
) -> Result<NormForwardOutputs> {
    let running = paired_running_stats(inputs.running_mean, inputs.running_var)?;
    let x = inputs.x;
    let axes = NormAxes::new(x.rank(), options.channels_last, options.stat_axes)?;
    let reduction_axes = axes.reduction_axes();

    let (mut out, mean, invstd) = match running {
        Some((running_mean, running_var)) if !options.use_input_stats => {
            let mean_b = fd.broadcast(running_mean, &axes.is_spatial_or_batch_dim)?;
            let centered = fd.sub(x, mean_b)?;
            let var_eps = fd.add(running_var, inputs.eps)?;
            let invstd = fd.rsqrt(var_eps)?;
            let invstd_b = fd.broadcast(invstd, &axes.is_spatial_or_batch_dim)?;
            (fd.mul(centered, invstd_b)?, running_mean, invstd)
        }
        _ => {
            let (var, mean) = fd.var_mean(x, &reduction_axes, usize::from(options.unbiased))?;
            if let Some((running_mean, running_var)) = running {
                let updater = RunningStatUpdate::new(fd, x, &axes, inputs.momentum, options)?;
                let new_mean = updater.apply(fd, running_mean, mean)?;
                fd.add_output_alias(new_mean, running_mean)?;

                let var_unbiased = if options.unbiased {
                    var
                } else {
                    let count = fd.numel(x, &reduction_axes)?;
                    let count_m1 = fd.sub(count, 1.0)?;
                    let correction = fd.div(count, count_m1)?;
                    fd.mul(var, correction)?
                };
                let new_var = updater.apply(fd, running_var, var_unbiased)?;
                fd.add_output_alias(new_var, running_var)?;
            }
            let mean_b = fd.broadcast(mean, &axes.is_spatial_dim)?;
            let centered = fd.sub(x, mean_b)?;
            let var_eps = fd.add(var, inputs.eps)?;
            let invstd = fd.rsqrt(var_eps)?;
            let invstd_b = fd.broadcast(invstd, &axes.is_spatial_dim)?;
            (fd.mul(centered, invstd_b)?, mean, invstd)
        }
    };

    if let Some(weight) = inputs.weight {
        let weight_b = fd.broadcast(weight, &axes.is_spatial_or_batch_dim)?;
        out = fd.mul(out, weight_b)?;
    }
    if let Some(bias) = inputs.bias {
        let bias_b = fd.broadcast(bias, &axes.is_spatial_or_batch_dim)?;
        out = fd.add(out, bias_b)?;
    }
    Ok(NormForwardOutputs { out, mean, invstd })
}

/// Exponential moving average `(1 - m) * running + m * current`, averaged over the batch when
/// the batch axis indexes the statistics so the running value never carries it.
struct RunningStatUpdate {
    momentum: ScalarValue,
    rev_momentum: ScalarValue,
    rev_batch_size: Option<ScalarValue>,
}

impl RunningStatUpdate {
    fn new(
        fd: &mut FusionDefinition,
        x: TensorValue,
        axes: &NormAxes,
        momentum: ScalarValue,
        options: &NormGraphOptions,
    ) -> Result<Self> {
        let rev_momentum = fd.sub(1.0, momentum)?;
        let rev_batch_size = if options.stat_axes.batch {
            let batch_size = fd.size(x, axes.batch_dim)?;
            Some(fd.reciprocal(batch_size)?)
        } else {
            None
        };
        Ok(Self {
            momentum,
            rev_momentum,
            rev_batch_size,
        })
    }

    fn apply(
        &self,
        fd: &mut FusionDefinition,
        running: TensorValue,
        current: TensorValue,
    ) -> Result<TensorValue> {
        let current_hat = fd.mul(current, self.momentum)?;
        let running_hat = fd.mul(running, self.rev_momentum)?;
        let mut updated = fd.add(running_hat, current_hat)?;
        if let Some(rev_batch_size) = self.rev_batch_size {
            updated = fd.sum(updated, &[0])?;
            updated = fd.mul(updated, rev_batch_size)?;
        }
        Ok(updated)
    }
}

/// Graph values consumed by [`norm_fusion_backward`].
#[derive(Debug, Clone, Copy)]
pub struct NormBackwardInputs {
    pub x: TensorValue,
    pub grad_output: TensorValue,
    /// Statistics used by the forward pass: batch statistics or the running ones.
    pub mean: TensorValue,
    pub invstd: TensorValue,
    pub weight: Option<TensorValue>,
    pub bias: Option<TensorValue>,
    pub running_mean: Option<TensorValue>,
    pub running_var: Option<TensorValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormBackwardOptions {
    pub use_input_stats: bool,
    pub channels_last: bool,
    pub stat_axes: StatAxes,
}

#[derive(Debug, Clone, Copy)]
pub struct NormBackwardOutputs {
    pub grad_input: TensorValue,
    pub grad_weight: Option<TensorValue>,
    pub grad_bias: Option<TensorValue>,
}

/// Adds the normalization backward pass to `fd`. Outputs are not declared.
///
/// `grad_weight` and `grad_bias` are `None` when the corresponding parameter is absent.
pub fn norm_fusion_backward(
    fd: &mut FusionDefinition,
    inputs: &NormBackwardInputs,
    options: &NormBackwardOptions,
) -> Result<NormBackwardOutputs> {
    paired_running_stats(inputs.running_mean, inputs.running_var)?;
    let x = inputs.x;
    let grad_output = inputs.grad_output;
    let axes = NormAxes::new(x.rank(), options.channels_last, options.stat_axes)?;
    let reduction_axes = axes.reduction_axes();
    // Running statistics are never indexed by batch.
    let stat_mask = if options.use_input_stats {
        &axes.is_spatial_dim
    } else {
        &axes.is_spatial_or_batch_dim
    };

    let num_features = fd.numel(x, &reduction_axes)?;
    let norm = fd.reciprocal(num_features)?;
    let mean_b = fd.broadcast(inputs.mean, stat_mask)?;
    let centered = fd.sub(x, mean_b)?;
    let grad_output_sum = fd.sum(grad_output, &reduction_axes)?;
    let weighted = fd.mul(grad_output, centered)?;
    let dot_p = fd.sum(weighted, &reduction_axes)?;

    let invstd_b = fd.broadcast(inputs.invstd, stat_mask)?;
    let grad_scale = match inputs.weight {
        Some(weight) => {
            let weight_b = fd.broadcast(weight, &axes.is_spatial_or_batch_dim)?;
            fd.mul(invstd_b, weight_b)?
        }
        None => invstd_b,
    };

    let grad_input = if options.use_input_stats {
        let grad_mean = fd.mul(grad_output_sum, norm)?;
        let grad_mean_b = fd.broadcast(grad_mean, &axes.is_spatial_dim)?;
        let dot_norm = fd.mul(dot_p, norm)?;
        let invstd_sq = fd.mul(inputs.invstd, inputs.invstd)?;
        let proj_scale = fd.mul(dot_norm, invstd_sq)?;
        let proj_scale_b = fd.broadcast(proj_scale, &axes.is_spatial_dim)?;
        let proj = fd.mul(centered, proj_scale_b)?;
        let shifted = fd.sub(grad_output, proj)?;
        let shifted = fd.sub(shifted, grad_mean_b)?;
        fd.mul(shifted, grad_scale)?
    } else {
        fd.mul(grad_output, grad_scale)?
    };

    let grad_weight = match inputs.weight {
        Some(_) => {
            let grad_weight = fd.mul(dot_p, inputs.invstd)?;
            Some(sum_over_batch(fd, grad_weight, options.stat_axes)?)
        }
        None => None,
    };
    let grad_bias = match inputs.bias {
        Some(_) => Some(sum_over_batch(fd, grad_output_sum, options.stat_axes)?),
        None => None,
    };
    Ok(NormBackwardOutputs {
        grad_input,
        grad_weight,
        grad_bias,
    })
}

fn sum_over_batch(
    fd: &mut FusionDefinition,
    value: TensorValue,
    stat_axes: StatAxes,
) -> Result<TensorValue> {
    if stat_axes.batch {
        fd.sum(value, &[0])
    } else {
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_norm_reduces_spatial_axes_only() {
        let axes = NormAxes::new(4, false, StatAxes::INSTANCE).unwrap();
        assert_eq!(axes.reduction_axes(), vec![2, 3]);
        assert_eq!(axes.is_spatial_or_batch_dim, vec![true, false, true, true]);
    }

    #[test]
    fn channels_last_moves_the_channel_axis() {
        let axes = NormAxes::new(4, true, StatAxes::BATCH_NORM).unwrap();
        assert_eq!(axes.channel_dim, 3);
        assert_eq!(axes.reduction_axes(), vec![0, 1, 2]);
    }

    #[test]
    fn layer_norm_keeps_batch_statistics() {
        let axes = NormAxes::new(3, false, StatAxes::LAYER_NORM).unwrap();
        assert_eq!(axes.reduction_axes(), vec![1, 2]);
        assert_eq!(axes.is_spatial_or_batch_dim, vec![true, true, true]);
    }

    #[test]
    fn role_sets_round_trip_through_named_axes() {
        assert_eq!(
            StatAxes::new(&[NamedAxis::Channel, NamedAxis::Batch]),
            StatAxes::INSTANCE
        );
        assert!(!StatAxes::LAYER_NORM.contains(NamedAxis::Channel));
    }

    #[test]
    fn rejects_vectors() {
        assert!(matches!(
            NormAxes::new(1, false, StatAxes::INSTANCE),
            Err(NormError::RankTooLow(1))
        ));
    }
}
