use std::fmt;

use anyhow::Result;

use super::error::FusionError;
use crate::backend::spec::{
    Extent, Function, FusionBackend, ParameterKind, ParameterSpec, Program,
};
use crate::layout::compute_contiguity;
use crate::tensor::Tensor;

/// Concrete argument bound to a fusion input, in declaration order.
#[derive(Debug, Clone)]
pub enum FusionArg {
    Tensor(Tensor),
    Scalar(f64),
}

impl From<Tensor> for FusionArg {
    fn from(tensor: Tensor) -> Self {
        FusionArg::Tensor(tensor)
    }
}

impl From<&Tensor> for FusionArg {
    fn from(tensor: &Tensor) -> Self {
        FusionArg::Tensor(tensor.clone())
    }
}

impl From<f64> for FusionArg {
    fn from(value: f64) -> Self {
        FusionArg::Scalar(value)
    }
}

/// Finalized fusion: a lowered program plus the bookkeeping needed to bind arguments and
/// commit aliased outputs.
#[derive(Debug, Clone)]
pub struct Fusion {
    program: Program,
    num_outputs: usize,
}

impl Fusion {
    pub(crate) fn new(program: Program, num_outputs: usize) -> Self {
        Self {
            program,
            num_outputs,
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    fn function(&self) -> Result<&Function> {
        Ok(self.program.entry_function()?)
    }

    /// Number of declared inputs (tensors and runtime scalars).
    pub fn num_inputs(&self) -> usize {
        self.function().map_or(0, |f| f.parameters.len())
    }

    /// Number of outputs returned by [`Fusion::execute`]; aliased outputs are not counted.
    pub fn num_outputs(&self) -> usize {
        self.num_outputs
    }

    /// Binds `args`, runs the program on `backend` and returns the visible outputs.
    ///
    /// Aliased outputs are copied into their input tensors only after the engine has produced
    /// every result, so a failing run leaves the inputs untouched.
    pub fn execute(&self, backend: &dyn FusionBackend, args: &[FusionArg]) -> Result<Vec<Tensor>> {
        let function = self.function()?;
        if args.len() != function.parameters.len() {
            return Err(FusionError::ArgumentCount {
                expected: function.parameters.len(),
                actual: args.len(),
            }
            .into());
        }
        let mut inputs = Vec::with_capacity(args.len());
        for (index, (param, arg)) in function.parameters.iter().zip(args).enumerate() {
            inputs.push(bind_argument(index, param, arg)?);
        }

        tracing::trace!(
            backend = backend.backend_name(),
            inputs = inputs.len(),
            "executing fusion"
        );
        let mut results = backend.run_program(&self.program, &inputs)?;
        if results.len() != function.result_ids.len() {
            return Err(anyhow::anyhow!(
                "engine returned {} results, program declares {}",
                results.len(),
                function.result_ids.len()
            ));
        }

        for alias in &function.aliases {
            let target = &inputs[alias.parameter];
            let value = &results[alias.result];
            if target.sizes() != value.sizes() {
                return Err(FusionError::InputMismatch {
                    index: alias.parameter,
                    reason: format!(
                        "aliased output of shape {:?} cannot be stored into shape {:?}",
                        value.sizes(),
                        target.sizes()
                    ),
                }
                .into());
            }
        }
        for alias in &function.aliases {
            inputs[alias.parameter].copy_from(&results[alias.result])?;
        }
        results.truncate(self.num_outputs);
        Ok(results)
    }
}

fn bind_argument(index: usize, param: &ParameterSpec, arg: &FusionArg) -> Result<Tensor> {
    match (param.kind, arg) {
        (ParameterKind::Scalar, FusionArg::Scalar(value)) => {
            Ok(Tensor::scalar(*value, param.spec.dtype))
        }
        (ParameterKind::Scalar, FusionArg::Tensor(tensor)) if tensor.dim() == 0 => {
            Ok(Tensor::scalar(tensor.item()?, param.spec.dtype))
        }
        (ParameterKind::Scalar, FusionArg::Tensor(_)) => Err(FusionError::ArgumentKind {
            index,
            expected: "scalar",
        }
        .into()),
        (ParameterKind::Tensor, FusionArg::Scalar(_)) => Err(FusionError::ArgumentKind {
            index,
            expected: "tensor",
        }
        .into()),
        (ParameterKind::Tensor, FusionArg::Tensor(tensor)) => {
            check_tensor_binding(index, param, tensor)?;
            Ok(tensor.clone())
        }
    }
}

/// Rejects tensors whose rank, dtype, fixed extents or stride pattern differ from the declared
/// input.
fn check_tensor_binding(index: usize, param: &ParameterSpec, tensor: &Tensor) -> Result<()> {
    let spec = &param.spec;
    if tensor.dtype() != spec.dtype {
        return Err(FusionError::DTypeMismatch {
            index,
            expected: spec.dtype,
            actual: tensor.dtype(),
        }
        .into());
    }
    if tensor.dim() != spec.rank() {
        return Err(FusionError::InputMismatch {
            index,
            reason: format!(
                "expected rank {} tensor, got shape {:?}",
                spec.rank(),
                tensor.sizes()
            ),
        }
        .into());
    }
    for (axis, (extent, &size)) in spec.shape.dims().iter().zip(tensor.sizes()).enumerate() {
        if let Extent::Static(expected) = *extent {
            if expected != size {
                return Err(FusionError::InputMismatch {
                    index,
                    reason: format!("axis {axis} has size {size}, expected {expected}"),
                }
                .into());
            }
        }
    }
    // Size-1 axes place no constraint on strides.
    let actual = compute_contiguity(tensor.sizes(), tensor.strides());
    let compatible = actual
        .iter()
        .zip(&param.contiguity)
        .all(|(actual, declared)| actual.is_none() || actual == declared);
    if !compatible {
        return Err(FusionError::InputMismatch {
            index,
            reason: format!(
                "contiguity {:?} does not match declared {:?}",
                actual, param.contiguity
            ),
        }
        .into());
    }
    Ok(())
}

impl fmt::Display for Fusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.program, f)
    }
}
