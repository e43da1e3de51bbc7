//! Normalization modules.
//!
//! One [`NormLayer`] type covers instance, batch and layer normalization; the variant is a
//! [`NormKind`] tag that selects the statistics axes and the accepted input rank.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::function::{NormContext, NormFunction, NormInputs, NormOptions};
use super::graph::StatAxes;
use super::NormError;
use crate::backend::spec::{DType, FusionBackend};
use crate::module::{load_tensors, LoadReport, Module, ParamVisitor, StateDict, TensorRole};
use crate::tensor::Tensor;

/// Spatial dimensionality of an instance norm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Spatial {
    D1,
    D2,
    D3,
}

impl Spatial {
    /// Input rank including the batch and channel axes.
    pub fn expected_rank(self) -> usize {
        match self {
            Spatial::D1 => 3,
            Spatial::D2 => 4,
            Spatial::D3 => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NormKind {
    Instance(Spatial),
    Batch,
    Layer,
}

impl NormKind {
    pub fn stat_axes(self) -> StatAxes {
        match self {
            NormKind::Instance(_) => StatAxes::INSTANCE,
            NormKind::Batch => StatAxes::BATCH_NORM,
            NormKind::Layer => StatAxes::LAYER_NORM,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            NormKind::Instance(Spatial::D1) => "InstanceNorm1d",
            NormKind::Instance(Spatial::D2) => "InstanceNorm2d",
            NormKind::Instance(Spatial::D3) => "InstanceNorm3d",
            NormKind::Batch => "BatchNorm",
            NormKind::Layer => "LayerNorm",
        }
    }

    /// Instance norms accept exactly their rank; batch and layer norms any rank with batch
    /// and channel axes.
    pub fn check_input_dim(self, input: &Tensor) -> Result<(), NormError> {
        let actual = input.dim();
        match self {
            NormKind::Instance(spatial) if actual != spatial.expected_rank() => {
                Err(NormError::InvalidInputRank {
                    expected: spatial.expected_rank(),
                    actual,
                })
            }
            _ if actual < 2 => Err(NormError::RankTooLow(actual)),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormConfig {
    pub eps: f64,
    pub momentum: f64,
    pub affine: bool,
    pub track_running_stats: bool,
    pub dtype: DType,
}

impl Default for NormConfig {
    fn default() -> Self {
        Self {
            eps: 1e-5,
            momentum: 0.1,
            affine: false,
            track_running_stats: false,
            dtype: DType::F32,
        }
    }
}

/// Learnable tensor with an accumulated gradient.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub value: Tensor,
    pub grad: Option<Tensor>,
}

impl Parameter {
    pub fn new(value: Tensor) -> Self {
        Self { value, grad: None }
    }

    pub fn accumulate_grad(&mut self, grad: &Tensor) -> Result<()> {
        let total = match &self.grad {
            Some(existing) => existing.add(grad)?,
            None => grad.clone(),
        };
        self.grad = Some(total.to_dtype(self.value.dtype()));
        Ok(())
    }

    pub fn zero_grad(&mut self) {
        self.grad = None;
    }
}

pub struct NormLayer {
    kind: NormKind,
    num_features: usize,
    pub eps: f64,
    pub momentum: f64,
    training: bool,
    pub weight: Option<Parameter>,
    pub bias: Option<Parameter>,
    pub running_mean: Option<Tensor>,
    pub running_var: Option<Tensor>,
    pub num_batches_tracked: Option<Tensor>,
}

impl NormLayer {
    /// Parameters and running statistics have shape `[num_features]` when channels index the
    /// statistics and are scalars otherwise.
    pub fn new(kind: NormKind, num_features: usize, config: &NormConfig) -> Self {
        let shape = if kind.stat_axes().channel {
            vec![num_features]
        } else {
            Vec::new()
        };
        let (weight, bias) = if config.affine {
            (
                Some(Parameter::new(Tensor::ones(shape.clone(), config.dtype))),
                Some(Parameter::new(Tensor::zeros(shape.clone(), config.dtype))),
            )
        } else {
            (None, None)
        };
        let (running_mean, running_var, num_batches_tracked) = if config.track_running_stats {
            (
                Some(Tensor::zeros(shape.clone(), config.dtype)),
                Some(Tensor::ones(shape, config.dtype)),
                Some(Tensor::scalar(0.0, DType::F64)),
            )
        } else {
            (None, None, None)
        };
        Self {
            kind,
            num_features,
            eps: config.eps,
            momentum: config.momentum,
            training: true,
            weight,
            bias,
            running_mean,
            running_var,
            num_batches_tracked,
        }
    }

    pub fn instance_norm(spatial: Spatial, num_features: usize, config: &NormConfig) -> Self {
        Self::new(NormKind::Instance(spatial), num_features, config)
    }

    pub fn instance_norm_1d(num_features: usize, config: &NormConfig) -> Self {
        Self::instance_norm(Spatial::D1, num_features, config)
    }

    pub fn instance_norm_2d(num_features: usize, config: &NormConfig) -> Self {
        Self::instance_norm(Spatial::D2, num_features, config)
    }

    pub fn instance_norm_3d(num_features: usize, config: &NormConfig) -> Self {
        Self::instance_norm(Spatial::D3, num_features, config)
    }

    pub fn batch_norm(num_features: usize, config: &NormConfig) -> Self {
        Self::new(NormKind::Batch, num_features, config)
    }

    pub fn layer_norm(num_features: usize, config: &NormConfig) -> Self {
        Self::new(NormKind::Layer, num_features, config)
    }

    pub fn kind(&self) -> NormKind {
        self.kind
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn track_running_stats(&self) -> bool {
        self.running_mean.is_some()
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn train(&mut self, mode: bool) {
        self.training = mode;
    }

    pub fn eval(&mut self) {
        self.train(false);
    }

    /// Normalizes `input`, updating the running statistics when training.
    pub fn forward(
        &mut self,
        backend: &dyn FusionBackend,
        input: &Tensor,
    ) -> Result<(Tensor, NormContext)> {
        self.kind.check_input_dim(input)?;
        let use_input_stats = self.training || !self.track_running_stats();
        let options = NormOptions {
            use_input_stats,
            momentum: self.momentum,
            eps: self.eps,
            unbiased: false,
            stat_axes: self.kind.stat_axes(),
        };
        let result = NormFunction::forward(
            backend,
            NormInputs {
                x: input,
                weight: self.weight.as_ref().map(|p| &p.value),
                bias: self.bias.as_ref().map(|p| &p.value),
                running_mean: self.running_mean.as_ref(),
                running_var: self.running_var.as_ref(),
            },
            &options,
        )?;
        if self.training {
            if let Some(count) = &self.num_batches_tracked {
                count.copy_from(&Tensor::scalar(count.item()? + 1.0, DType::F64))?;
            }
        }
        Ok(result)
    }

    /// Returns the input gradient and accumulates parameter gradients.
    pub fn backward(
        &mut self,
        backend: &dyn FusionBackend,
        ctx: &NormContext,
        grad_output: &Tensor,
    ) -> Result<Tensor> {
        let grads = NormFunction::backward(backend, ctx, grad_output)?;
        if let (Some(weight), Some(grad)) = (self.weight.as_mut(), grads.grad_weight.as_ref()) {
            weight.accumulate_grad(grad)?;
        }
        if let (Some(bias), Some(grad)) = (self.bias.as_mut(), grads.grad_bias.as_ref()) {
            bias.accumulate_grad(grad)?;
        }
        Ok(grads.grad_input)
    }
}

const RUNNING_STAT_KEYS: [&str; 2] = ["running_mean", "running_var"];

impl Module for NormLayer {
    fn visit_params(&self, v: &mut ParamVisitor<'_>) -> Result<()> {
        if let Some(weight) = &self.weight {
            v.param("weight", TensorRole::Parameter, &weight.value)?;
        }
        if let Some(bias) = &self.bias {
            v.param("bias", TensorRole::Parameter, &bias.value)?;
        }
        if let Some(running_mean) = &self.running_mean {
            v.param("running_mean", TensorRole::Buffer, running_mean)?;
        }
        if let Some(running_var) = &self.running_var {
            v.param("running_var", TensorRole::Buffer, running_var)?;
        }
        if let Some(count) = &self.num_batches_tracked {
            v.param("num_batches_tracked", TensorRole::Buffer, count)?;
        }
        Ok(())
    }

    /// Version 2 added `num_batches_tracked`; dicts without a version predate dropping the
    /// running statistics of untracked layers.
    fn version(&self) -> Option<u32> {
        Some(2)
    }

    fn load_from_state_dict(
        &mut self,
        state: &mut StateDict,
        prefix: &str,
        report: &mut LoadReport,
    ) -> Result<()> {
        let version = state.version(prefix);
        if version.is_none() && !self.track_running_stats() {
            let stale: Vec<String> = RUNNING_STAT_KEYS
                .iter()
                .map(|name| format!("{prefix}{name}"))
                .filter(|key| state.contains(key))
                .collect();
            if !stale.is_empty() {
                let names = stale
                    .iter()
                    .map(|key| format!("\"{key}\""))
                    .collect::<Vec<_>>()
                    .join(" and ");
                let layer = self.kind.name();
                tracing::warn!(keys = %names, layer, "dropping stale running stats");
                report.error_msgs.push(format!(
                    "Unexpected running stats buffer(s) {names} for {layer} with \
                     track_running_stats=False. If state_dict is a checkpoint saved before \
                     running stats became optional, this may be expected because {layer} does \
                     not track running stats by default. Please remove these keys from \
                     state_dict. If the running stats are actually needed, instead set \
                     track_running_stats=True in {layer} to enable them."
                ));
                for key in &stale {
                    state.remove(key);
                }
            }
        }
        if version.map_or(true, |v| v < 2) && self.track_running_stats() {
            let key = format!("{prefix}num_batches_tracked");
            if !state.contains(&key) {
                state.insert(key, Tensor::scalar(0.0, DType::F64));
            }
        }
        load_tensors(&*self, state, prefix, report)
    }
}
