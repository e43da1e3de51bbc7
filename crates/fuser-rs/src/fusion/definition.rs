use anyhow::Result;

use super::error::FusionError;
use super::execute::Fusion;
use crate::backend::spec::{
    CastSpec, DType, Extent, Operation, OutputAlias, ParameterKind, ParameterSpec, Program,
    ProgramBuilder, ScalarLiteral, Shape, TensorSpec, ValueId,
};
use crate::layout::compute_contiguity;
use crate::tensor::Tensor;

/// Symbolic value produced while defining a fusion.
///
/// Handles are only meaningful for the [`FusionDefinition`] that created them. Rank-0 values
/// double as scalars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorValue {
    id: ValueId,
    rank: usize,
    dtype: DType,
}

/// Rank-0 value, either an immediate constant or a runtime scalar input.
pub type ScalarValue = TensorValue;

impl TensorValue {
    pub fn id(self) -> ValueId {
        self.id
    }

    pub fn rank(self) -> usize {
        self.rank
    }

    pub fn dtype(self) -> DType {
        self.dtype
    }

    pub fn is_scalar(self) -> bool {
        self.rank == 0
    }
}

/// Anything that can appear as an operand: existing values or immediate constants.
pub trait IntoValue {
    fn into_value(self, fd: &mut FusionDefinition) -> Result<TensorValue>;
}

impl IntoValue for TensorValue {
    fn into_value(self, _fd: &mut FusionDefinition) -> Result<TensorValue> {
        Ok(self)
    }
}

impl IntoValue for f64 {
    fn into_value(self, fd: &mut FusionDefinition) -> Result<TensorValue> {
        Ok(fd.define_scalar(self))
    }
}

/// Mutable graph-building scope.
///
/// Obtained only through [`FusionDefinition::define`]; the definition is finalized into an
/// executable [`Fusion`] when the closure returns successfully.
#[derive(Debug)]
pub struct FusionDefinition {
    builder: ProgramBuilder,
    outputs: Vec<ValueId>,
    alias_outputs: Vec<(ValueId, usize)>,
}

impl FusionDefinition {
    /// Runs `build` against a fresh definition and finalizes the result.
    pub fn define<F>(build: F) -> Result<Fusion>
    where
        F: FnOnce(&mut FusionDefinition) -> Result<()>,
    {
        let mut fd = FusionDefinition {
            builder: ProgramBuilder::new(),
            outputs: Vec::new(),
            alias_outputs: Vec::new(),
        };
        build(&mut fd)?;
        fd.finalize()
    }

    /// Declares a tensor input.
    ///
    /// `shape` uses `-1` for extents only known at execution and non-negative values for fixed
    /// extents (`1` marks a broadcast axis). `contiguity` must have one entry per axis.
    pub fn define_tensor(
        &mut self,
        shape: &[i64],
        contiguity: &[Option<bool>],
        dtype: DType,
    ) -> Result<TensorValue> {
        if shape.len() != contiguity.len() {
            return Err(FusionError::InvalidDefinition(format!(
                "contiguity {:?} does not match rank {}",
                contiguity,
                shape.len()
            ))
            .into());
        }
        let mut dims = Vec::with_capacity(shape.len());
        for (axis, &extent) in shape.iter().enumerate() {
            dims.push(match extent {
                -1 => Extent::Symbolic,
                n if n >= 0 => Extent::Static(n as usize),
                n => {
                    return Err(FusionError::InvalidDefinition(format!(
                        "axis {axis} has invalid extent {n}"
                    ))
                    .into())
                }
            });
            if dims[axis].is_broadcast() && contiguity[axis].is_some() {
                return Err(FusionError::InvalidDefinition(format!(
                    "broadcast axis {axis} must have no contiguity flag"
                ))
                .into());
            }
        }
        let spec = TensorSpec::new(dtype, Shape::new(dims));
        Ok(self.add_parameter(ParameterSpec {
            kind: ParameterKind::Tensor,
            spec,
            contiguity: contiguity.to_vec(),
        }))
    }

    /// Declares a tensor input matching `tensor`'s rank, dtype and stride pattern.
    ///
    /// Size-1 axes become broadcast extents, every other axis is symbolic.
    pub fn define_tensor_like(&mut self, tensor: &Tensor) -> Result<TensorValue> {
        let shape: Vec<i64> = tensor
            .sizes()
            .iter()
            .map(|&size| if size == 1 { 1 } else { -1 })
            .collect();
        let contiguity = compute_contiguity(tensor.sizes(), tensor.strides());
        self.define_tensor(&shape, &contiguity, tensor.dtype())
    }

    /// Immediate `f64` constant; never an input.
    pub fn define_scalar(&mut self, value: f64) -> ScalarValue {
        self.emit(
            Operation::Constant(ScalarLiteral { value }),
            Vec::new(),
            TensorSpec::scalar(DType::F64),
        )
    }

    /// Runtime scalar input supplied as `FusionArg::Scalar` at execution.
    pub fn define_scalar_input(&mut self, dtype: DType) -> ScalarValue {
        self.add_parameter(ParameterSpec {
            kind: ParameterKind::Scalar,
            spec: TensorSpec::scalar(dtype),
            contiguity: Vec::new(),
        })
    }

    pub fn add_output(&mut self, value: TensorValue) -> Result<()> {
        self.spec(value)?;
        self.outputs.push(value.id);
        Ok(())
    }

    /// Writes `value` back into the storage of input `input` after execution instead of
    /// returning it.
    ///
    /// `input` may be the input itself or a cast of it. The stored value is cast to the input's
    /// dtype when they differ.
    pub fn add_output_alias(&mut self, value: TensorValue, input: TensorValue) -> Result<()> {
        let value_spec = self.spec(value)?.clone();
        let parameter = self.resolve_alias_target(input)?;
        if self
            .alias_outputs
            .iter()
            .any(|&(_, existing)| existing == parameter)
        {
            return Err(FusionError::InvalidAlias(format!(
                "input %{} already has an aliased output",
                input.id.0
            ))
            .into());
        }
        let param_spec = self
            .builder
            .parameter(parameter)
            .cloned()
            .ok_or_else(|| FusionError::InvalidAlias(format!("unknown input {parameter}")))?;
        if param_spec.kind != ParameterKind::Tensor {
            return Err(FusionError::InvalidAlias("scalar inputs cannot be aliased".into()).into());
        }
        if value_spec.rank() != param_spec.spec.rank() {
            return Err(FusionError::InvalidAlias(format!(
                "output of rank {} cannot alias an input of rank {}",
                value_spec.rank(),
                param_spec.spec.rank()
            ))
            .into());
        }
        for (axis, (out, inp)) in value_spec
            .shape
            .dims()
            .iter()
            .zip(param_spec.spec.shape.dims())
            .enumerate()
        {
            if let (Extent::Static(a), Extent::Static(b)) = (out, inp) {
                if a != b {
                    return Err(FusionError::InvalidAlias(format!(
                        "axis {axis}: output extent {a} does not match input extent {b}"
                    ))
                    .into());
                }
            }
        }
        let stored = if value.dtype != param_spec.spec.dtype {
            self.cast(value, param_spec.spec.dtype)?
        } else {
            value
        };
        self.alias_outputs.push((stored.id, parameter));
        Ok(())
    }

    /// Follows casts back to the input an alias target refers to.
    fn resolve_alias_target(&self, input: TensorValue) -> Result<usize> {
        let mut id = input.id;
        loop {
            if let Some(index) = self.builder.parameter_index(id) {
                return Ok(index);
            }
            match self.builder.producer(id) {
                Some(inst) if matches!(inst.op, Operation::Cast(_)) => id = inst.operands[0],
                Some(_) => {
                    return Err(FusionError::InvalidAlias(format!(
                        "%{} is neither an input nor a cast of one",
                        input.id.0
                    ))
                    .into())
                }
                None => return Err(FusionError::UnknownValue(id.0).into()),
            }
        }
    }

    /// Type and shape recorded for `value`.
    pub fn spec(&self, value: TensorValue) -> Result<&TensorSpec> {
        self.builder
            .value_spec(value.id)
            .ok_or_else(|| FusionError::UnknownValue(value.id.0).into())
    }

    fn add_parameter(&mut self, param: ParameterSpec) -> TensorValue {
        let rank = param.spec.rank();
        let dtype = param.spec.dtype;
        let id = self.builder.add_parameter(param);
        TensorValue { id, rank, dtype }
    }

    pub(crate) fn emit(
        &mut self,
        op: Operation,
        operands: Vec<ValueId>,
        output: TensorSpec,
    ) -> TensorValue {
        let rank = output.rank();
        let dtype = output.dtype;
        let id = self.builder.emit_single(op, operands, output);
        TensorValue { id, rank, dtype }
    }

    pub fn cast(&mut self, value: TensorValue, dtype: DType) -> Result<TensorValue> {
        let spec = self.spec(value)?;
        if spec.dtype == dtype {
            return Ok(value);
        }
        let output = TensorSpec::new(dtype, spec.shape.clone());
        Ok(self.emit(Operation::Cast(CastSpec { dtype }), vec![value.id], output))
    }

    fn finalize(self) -> Result<Fusion> {
        if self.outputs.is_empty() && self.alias_outputs.is_empty() {
            return Err(FusionError::NoOutputs.into());
        }
        let num_outputs = self.outputs.len();
        let mut result_ids = self.outputs;
        let mut aliases = Vec::with_capacity(self.alias_outputs.len());
        for (id, parameter) in self.alias_outputs {
            aliases.push(OutputAlias {
                result: result_ids.len(),
                parameter,
            });
            result_ids.push(id);
        }
        let function = self.builder.finish("fusion", result_ids, aliases)?;
        let program = Program::new("fusion").with_functions(vec![function]);
        tracing::debug!(
            parameters = program.functions[0].parameters.len(),
            instructions = program.functions[0].body.len(),
            outputs = num_outputs,
            "fusion definition finalized"
        );
        Ok(Fusion::new(program, num_outputs))
    }
}
