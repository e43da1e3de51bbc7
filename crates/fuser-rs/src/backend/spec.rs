use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::tensor::DType;
use crate::tensor::Tensor;

/// Program format version enforced by this interface.
pub const SPEC_VERSION: &str = "fuser.v1";

fn default_spec_version() -> String {
    SPEC_VERSION.to_string()
}

/// Size of one tensor axis as known when the program is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Extent {
    /// Fixed extent. `Static(1)` marks a broadcast axis that expands in elementwise ops.
    Static(usize),
    /// Extent only known once concrete inputs are bound.
    Symbolic,
}

impl Extent {
    pub fn is_broadcast(self) -> bool {
        self == Extent::Static(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<Extent>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<Extent>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Extent] {
        &self.dims
    }
}

/// Dtype and shape of an SSA value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    pub fn scalar(dtype: DType) -> Self {
        Self::new(dtype, Shape::scalar())
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterKind {
    Tensor,
    /// Runtime scalar argument, passed as a rank-0 tensor.
    Scalar,
}

/// Program input: value type plus the stride pattern concrete tensors must follow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub kind: ParameterKind,
    pub spec: TensorSpec,
    /// Per-axis contiguity; `None` for broadcast axes. Empty for scalars.
    pub contiguity: Vec<Option<bool>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseUnaryOp {
    Neg,
    Exp,
    Tanh,
    Rsqrt,
    Reciprocal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseBinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Sum over `axes`, which are dropped from the result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReduceSpec {
    pub axes: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CastSpec {
    pub dtype: DType,
}

/// Inserts size-1 axes: output axis `i` is new when `is_broadcast_dim[i]` is set, otherwise it
/// takes the next operand axis in order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BroadcastSpec {
    pub is_broadcast_dim: Vec<bool>,
}

/// Maps operand axis `i` onto output axis `broadcast_dims[i]` and expands to `shape`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BroadcastInDimSpec {
    pub shape: Vec<Extent>,
    pub broadcast_dims: Vec<usize>,
}

/// Runtime extent of `axis` as a rank-0 value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SizeSpec {
    pub axis: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalarLiteral {
    pub value: f64,
}

/// Unique identifier for SSA values in a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Declarative form of program operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Constant(ScalarLiteral),
    ElementwiseUnary(ElementwiseUnaryOp),
    ElementwiseBinary(ElementwiseBinaryOp),
    Cast(CastSpec),
    Broadcast(BroadcastSpec),
    BroadcastInDim(BroadcastInDimSpec),
    Reduce(ReduceSpec),
    Size(SizeSpec),
}

impl Operation {
    /// True for ops that compute each output element from the matching input elements only.
    pub fn is_elementwise(&self) -> bool {
        !matches!(self, Operation::Reduce(_) | Operation::Size(_))
    }
}

/// Single SSA instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub id: ValueId,
    pub op: Operation,
    pub operands: Vec<ValueId>,
    pub output: TensorSpec,
}

/// Output written back into an input buffer instead of being returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputAlias {
    /// Index into `Function::result_ids`.
    pub result: usize,
    /// Index into `Function::parameter_ids`.
    pub parameter: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub parameters: Vec<ParameterSpec>,
    pub parameter_ids: Vec<ValueId>,
    pub results: Vec<TensorSpec>,
    pub body: Vec<Instruction>,
    pub result_ids: Vec<ValueId>,
    #[serde(default)]
    pub aliases: Vec<OutputAlias>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default = "default_spec_version")]
    pub spec_version: String,
    pub entry: String,
    pub functions: Vec<Function>,
}

#[derive(Debug, Error)]
pub enum ProgramSerdeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("program spec version '{found}' does not match expected '{expected}'")]
    SpecVersionMismatch {
        found: String,
        expected: &'static str,
    },
}

impl Program {
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            spec_version: SPEC_VERSION.to_string(),
            entry: entry.into(),
            functions: Vec::new(),
        }
    }

    pub fn with_functions(mut self, functions: Vec<Function>) -> Self {
        self.functions = functions;
        self
    }

    /// Looks up the entry function.
    pub fn entry_function(&self) -> BackendResult<&Function> {
        self.functions
            .iter()
            .find(|function| function.name == self.entry)
            .ok_or_else(|| {
                BackendError::spec(
                    SpecErrorCode::UnknownEntry,
                    format!("entry function @{} not found", self.entry),
                )
            })
    }

    pub fn to_json_string(&self) -> Result<String, ProgramSerdeError> {
        serde_json::to_string_pretty(self).map_err(ProgramSerdeError::from)
    }

    pub fn from_json_str(src: &str) -> Result<Self, ProgramSerdeError> {
        let mut program: Program = serde_json::from_str(src).map_err(ProgramSerdeError::from)?;
        program.spec_version = normalize_spec_version(program.spec_version)?;
        Ok(program)
    }

    pub fn to_text(&self) -> String {
        format!("{self}")
    }
}

fn normalize_spec_version(version: String) -> Result<String, ProgramSerdeError> {
    if version.is_empty() {
        return Ok(SPEC_VERSION.to_string());
    }
    if version == SPEC_VERSION {
        Ok(version)
    } else {
        Err(ProgramSerdeError::SpecVersionMismatch {
            found: version,
            expected: SPEC_VERSION,
        })
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_line(
            f,
            0,
            &format!(
                "program @{} (spec_version = {}) {{",
                self.entry, self.spec_version
            ),
        )?;
        for function in &self.functions {
            fmt_function(function, 1, f)?;
        }
        write_line(f, 0, "}")
    }
}

fn fmt_function(function: &Function, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write_line(f, indent, &format!("func @{} {{", function.name))?;
    if !function.parameter_ids.is_empty() {
        write_line(f, indent + 1, "params:")?;
        for (value_id, param) in function.parameter_ids.iter().zip(&function.parameters) {
            let line = match param.kind {
                ParameterKind::Scalar => {
                    format!("%{} : scalar<{:?}>", value_id.0, param.spec.dtype)
                }
                ParameterKind::Tensor => format!(
                    "%{} : {} contiguity={}",
                    value_id.0,
                    format_spec(&param.spec),
                    format_contiguity(&param.contiguity)
                ),
            };
            write_line(f, indent + 2, &line)?;
        }
    }
    if !function.body.is_empty() {
        write_line(f, indent + 1, "body:")?;
        for instruction in &function.body {
            fmt_instruction(instruction, indent + 2, f)?;
        }
    }
    if !function.result_ids.is_empty() {
        write_line(f, indent + 1, "results:")?;
        for (index, (value_id, spec)) in function
            .result_ids
            .iter()
            .zip(&function.results)
            .enumerate()
        {
            let alias = function
                .aliases
                .iter()
                .find(|alias| alias.result == index)
                .map(|alias| {
                    format!(
                        " aliases %{}",
                        function.parameter_ids[alias.parameter].0
                    )
                })
                .unwrap_or_default();
            write_line(
                f,
                indent + 2,
                &format!("%{} : {}{}", value_id.0, format_spec(spec), alias),
            )?;
        }
    }
    write_line(f, indent, "}")
}

fn fmt_instruction(
    instruction: &Instruction,
    indent: usize,
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    let operands = instruction
        .operands
        .iter()
        .map(|id| format!("%{}", id.0))
        .collect::<Vec<_>>();
    let op_repr = match &instruction.op {
        Operation::Constant(lit) => format!("Constant({})", lit.value),
        other => format!("{other:?}"),
    };
    let line = if operands.is_empty() {
        format!(
            "%{} = {} -> {}",
            instruction.id.0,
            op_repr,
            format_spec(&instruction.output)
        )
    } else {
        format!(
            "%{} = {}({}) -> {}",
            instruction.id.0,
            op_repr,
            operands.join(", "),
            format_spec(&instruction.output)
        )
    };
    write_line(f, indent, &line)
}

fn format_spec(spec: &TensorSpec) -> String {
    format!("tensor<{:?} x {}>", spec.dtype, format_shape(&spec.shape))
}

fn format_shape(shape: &Shape) -> String {
    let dims = shape
        .dims()
        .iter()
        .map(|dim| match dim {
            Extent::Static(v) => v.to_string(),
            Extent::Symbolic => "?".to_string(),
        })
        .collect::<Vec<_>>();
    if dims.is_empty() {
        "[]".to_string()
    } else {
        dims.join("x")
    }
}

fn format_contiguity(contiguity: &[Option<bool>]) -> String {
    let flags = contiguity
        .iter()
        .map(|flag| match flag {
            Some(true) => "T",
            Some(false) => "F",
            None => "_",
        })
        .collect::<Vec<_>>();
    format!("[{}]", flags.join(","))
}

fn write_line(f: &mut fmt::Formatter<'_>, indent: usize, line: &str) -> fmt::Result {
    for _ in 0..indent {
        f.write_str("  ")?;
    }
    writeln!(f, "{line}")
}

/// Lightweight builder for constructing functions programmatically.
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    next_value_id: u32,
    parameters: Vec<(ValueId, ParameterSpec)>,
    instructions: Vec<Instruction>,
    value_specs: HashMap<ValueId, TensorSpec>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_parameter(&mut self, param: ParameterSpec) -> ValueId {
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        self.value_specs.insert(id, param.spec.clone());
        self.parameters.push((id, param));
        id
    }

    pub fn emit_single(
        &mut self,
        op: Operation,
        operands: Vec<ValueId>,
        output: TensorSpec,
    ) -> ValueId {
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        self.value_specs.insert(id, output.clone());
        self.instructions.push(Instruction {
            id,
            op,
            operands,
            output,
        });
        id
    }

    pub fn value_spec(&self, id: ValueId) -> Option<&TensorSpec> {
        self.value_specs.get(&id)
    }

    pub fn parameter(&self, index: usize) -> Option<&ParameterSpec> {
        self.parameters.get(index).map(|(_, param)| param)
    }

    /// Position of `id` in the parameter list, if it is a parameter.
    pub fn parameter_index(&self, id: ValueId) -> Option<usize> {
        self.parameters.iter().position(|(param, _)| *param == id)
    }

    /// Instruction that produced `id`, if it is not a parameter.
    pub fn producer(&self, id: ValueId) -> Option<&Instruction> {
        self.instructions.iter().find(|inst| inst.id == id)
    }

    pub fn finish(
        self,
        name: impl Into<String>,
        result_ids: Vec<ValueId>,
        aliases: Vec<OutputAlias>,
    ) -> BackendResult<Function> {
        let mut results = Vec::with_capacity(result_ids.len());
        for id in &result_ids {
            let spec = self.value_specs.get(id).ok_or_else(|| {
                BackendError::spec(
                    SpecErrorCode::UnknownValue,
                    format!("result %{} is not defined", id.0),
                )
            })?;
            results.push(spec.clone());
        }
        let (parameter_ids, parameters): (Vec<_>, Vec<_>) = self.parameters.into_iter().unzip();
        Ok(Function {
            name: name.into(),
            parameters,
            parameter_ids,
            results,
            body: self.instructions,
            result_ids,
            aliases,
        })
    }
}

/// Stable identifiers for IR contract violations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SpecErrorCode {
    UnknownEntry,
    UnknownValue,
    ArityMismatch,
    DTypeMismatch,
    ShapeMismatch,
    BroadcastRankMismatch,
    BroadcastDimsInvalid,
    InvalidAxis,
    InvalidAlias,
    Unspecified(&'static str),
}

impl SpecErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpecErrorCode::UnknownEntry => "SpecError: unknown entry function",
            SpecErrorCode::UnknownValue => "SpecError: reference to undefined value",
            SpecErrorCode::ArityMismatch => "SpecError: operand count mismatch",
            SpecErrorCode::DTypeMismatch => "SpecError: dtype mismatch",
            SpecErrorCode::ShapeMismatch => "SpecError: shape mismatch",
            SpecErrorCode::BroadcastRankMismatch => "SpecError: broadcast rank mismatch",
            SpecErrorCode::BroadcastDimsInvalid => {
                "SpecError: broadcast dims must be sorted and unique"
            }
            SpecErrorCode::InvalidAxis => "SpecError: axis out of range",
            SpecErrorCode::InvalidAlias => "SpecError: invalid output alias",
            SpecErrorCode::Unspecified(code) => code,
        }
    }
}

/// Validation failure captured before execution.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecError {
    pub code: SpecErrorCode,
    pub detail: Option<String>,
}

impl SpecError {
    pub fn new(code: SpecErrorCode, detail: impl Into<Option<String>>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for SpecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{} ({detail})", self.code.as_str()),
            None => write!(f, "{}", self.code.as_str()),
        }
    }
}

impl std::error::Error for SpecError {}

/// Backend error surfaced to higher layers.
#[derive(Debug)]
pub enum BackendError {
    SpecViolation(SpecError),
    Execution { message: String },
}

impl BackendError {
    pub fn spec(code: SpecErrorCode, detail: impl Into<Option<String>>) -> Self {
        BackendError::SpecViolation(SpecError::new(code, detail))
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::SpecViolation(err) => write!(f, "{err}"),
            BackendError::Execution { message } => {
                write!(f, "backend execution failure: {message}")
            }
        }
    }
}

impl std::error::Error for BackendError {}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// Engine that compiles and runs fusion programs on host tensors.
///
/// Inputs arrive in parameter order, runtime scalars as rank-0 tensors. Implementations return
/// one tensor per entry in `Function::result_ids`, aliased results included; writing aliased
/// results back into their inputs is the caller's job so a failed run leaves inputs untouched.
pub trait FusionBackend: Send + Sync {
    /// Returns a human-readable backend identifier (e.g., `"cpu"`).
    fn backend_name(&self) -> &str;

    /// Executes the entry function of `program`.
    fn run_program(&self, program: &Program, inputs: &[Tensor]) -> BackendResult<Vec<Tensor>>;

    /// Drops every compiled artifact so the next run recompiles from scratch.
    fn clear_cache(&self) {}
}
