use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use fuser_rs::backend::hashing::program_fingerprint;
use fuser_rs::backend::spec::{
    BackendError, BackendResult, BroadcastInDimSpec, BroadcastSpec, DType, ElementwiseBinaryOp,
    ElementwiseUnaryOp, Extent, Function, FusionBackend, Instruction, Operation, Program,
    ReduceSpec, ValueId,
};
use fuser_rs::tensor::Tensor;
use lru::LruCache;

use crate::plan::CompiledPlan;
use crate::shape::{compute_strides, infer_dims, step_index};

const DEFAULT_PLAN_CACHE_CAPACITY: usize = 64;

/// Dense row-major buffer the engine computes on. Values are widened to `f64` and rounded to
/// `dtype` after every op.
#[derive(Debug, Clone)]
pub struct CpuTensor {
    pub dims: Vec<usize>,
    pub dtype: DType,
    pub data: Arc<[f64]>,
}

impl CpuTensor {
    pub fn from_tensor(tensor: &Tensor) -> Self {
        Self {
            dims: tensor.sizes().to_vec(),
            dtype: tensor.dtype(),
            data: Arc::from(tensor.to_vec_f64()),
        }
    }

    pub fn into_tensor(self) -> BackendResult<Tensor> {
        Tensor::from_vec(self.dims, self.data.to_vec(), self.dtype)
            .map_err(|err| BackendError::execution(err.to_string()))
    }

    fn rounded(dims: Vec<usize>, dtype: DType, values: Vec<f64>) -> Self {
        let data: Vec<f64> = values.into_iter().map(|v| dtype.round(v)).collect();
        Self {
            dims,
            dtype,
            data: Arc::from(data),
        }
    }
}

/// How compiled plans evaluate elementwise programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Reduction-free programs run as one fused loop over the output; other programs fall back
    /// to the interpreter.
    Fused,
    /// Every instruction materializes its own buffer.
    Interpreted,
}

/// Reference engine with a compiled-plan cache keyed by program fingerprint.
pub struct CpuBackend {
    mode: ExecutionMode,
    plans: Mutex<LruCache<u64, Arc<CompiledPlan>>>,
    compilations: AtomicUsize,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::with_mode(ExecutionMode::Fused)
    }

    pub fn interpreted() -> Self {
        Self::with_mode(ExecutionMode::Interpreted)
    }

    pub fn with_mode(mode: ExecutionMode) -> Self {
        let capacity = fuser_rs::env::plan_cache_capacity().unwrap_or(DEFAULT_PLAN_CACHE_CAPACITY);
        Self::with_capacity(mode, capacity)
    }

    pub fn with_capacity(mode: ExecutionMode, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            mode,
            plans: Mutex::new(LruCache::new(capacity)),
            compilations: AtomicUsize::new(0),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Number of plans currently cached.
    pub fn cached_plans(&self) -> usize {
        self.plans.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Number of plans compiled since construction.
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }

    fn plan_for(&self, program: &Program) -> BackendResult<Arc<CompiledPlan>> {
        let key = program_fingerprint(program);
        let mut plans = self.plans.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(plan) = plans.get(&key) {
            tracing::trace!(fingerprint = key, "plan cache hit");
            return Ok(Arc::clone(plan));
        }
        let plan = Arc::new(CompiledPlan::compile(program, self.mode)?);
        self.compilations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            fingerprint = key,
            fused = plan.is_fused(),
            instructions = plan.function().body.len(),
            "compiled fusion plan"
        );
        plans.put(key, Arc::clone(&plan));
        Ok(plan)
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FusionBackend for CpuBackend {
    fn backend_name(&self) -> &str {
        match self.mode {
            ExecutionMode::Fused => "cpu",
            ExecutionMode::Interpreted => "cpu-interpreted",
        }
    }

    fn run_program(&self, program: &Program, inputs: &[Tensor]) -> BackendResult<Vec<Tensor>> {
        let plan = self.plan_for(program)?;
        let inputs: Vec<CpuTensor> = inputs.iter().map(CpuTensor::from_tensor).collect();
        plan.execute(&inputs)?
            .into_iter()
            .map(CpuTensor::into_tensor)
            .collect()
    }

    fn clear_cache(&self) {
        let mut plans = self.plans.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::debug!(evicted = plans.len(), "clearing plan cache");
        plans.clear();
    }
}

/// Checks the bound inputs against the function's parameter list.
pub(crate) fn check_inputs(function: &Function, inputs: &[CpuTensor]) -> BackendResult<()> {
    if function.parameter_ids.len() != inputs.len() {
        return Err(BackendError::execution(format!(
            "entry input arity mismatch: expected {}, got {}",
            function.parameter_ids.len(),
            inputs.len()
        )));
    }
    for (index, (param, input)) in function.parameters.iter().zip(inputs).enumerate() {
        if param.spec.dtype != input.dtype {
            return Err(BackendError::execution(format!(
                "input {index}: expected {:?}, got {:?}",
                param.spec.dtype, input.dtype
            )));
        }
        let dims = param.spec.shape.dims();
        let matches = dims.len() == input.dims.len()
            && dims.iter().zip(&input.dims).all(|(extent, &size)| match extent {
                Extent::Static(n) => *n == size,
                Extent::Symbolic => true,
            });
        if !matches {
            return Err(BackendError::execution(format!(
                "input {index}: shape {:?} does not match {:?}",
                input.dims, dims
            )));
        }
    }
    Ok(())
}

/// Runs every instruction in order, materializing one buffer per value.
pub(crate) fn interpret(function: &Function, inputs: &[CpuTensor]) -> BackendResult<Vec<CpuTensor>> {
    let mut values: HashMap<ValueId, CpuTensor> = HashMap::new();
    for (param_id, input) in function.parameter_ids.iter().zip(inputs) {
        values.insert(*param_id, input.clone());
    }

    for (instr_index, instruction) in function.body.iter().enumerate() {
        let mut operands = Vec::with_capacity(instruction.operands.len());
        for id in &instruction.operands {
            let tensor = values
                .get(id)
                .ok_or_else(|| BackendError::execution("operand value missing"))?;
            operands.push(tensor);
        }
        let output = execute_operation(instruction, &operands).map_err(|err| {
            augment_backend_error(err, &function.name, instr_index, instruction, &operands)
        })?;
        values.insert(instruction.id, output);
    }

    let mut results = Vec::with_capacity(function.result_ids.len());
    for id in &function.result_ids {
        let value = values
            .get(id)
            .cloned()
            .ok_or_else(|| BackendError::execution("missing function result value"))?;
        results.push(value);
    }
    Ok(results)
}

fn execute_operation(instruction: &Instruction, inputs: &[&CpuTensor]) -> BackendResult<CpuTensor> {
    let dims: Vec<&[usize]> = inputs.iter().map(|t| t.dims.as_slice()).collect();
    let out_dims = infer_dims(&instruction.op, &dims)?;
    let dtype = instruction.output.dtype;
    let tensor = match &instruction.op {
        Operation::Constant(literal) => CpuTensor::rounded(out_dims, dtype, vec![literal.value]),
        Operation::ElementwiseUnary(op) => op_elementwise_unary(inputs[0], out_dims, dtype, *op),
        Operation::ElementwiseBinary(op) => {
            op_elementwise_binary(inputs[0], inputs[1], out_dims, dtype, *op)
        }
        Operation::Cast(_) => CpuTensor::rounded(out_dims, dtype, inputs[0].data.to_vec()),
        Operation::Broadcast(spec) => op_broadcast(inputs[0], out_dims, spec),
        Operation::BroadcastInDim(spec) => op_broadcast_in_dim(inputs[0], out_dims, spec),
        Operation::Reduce(spec) => op_reduce(inputs[0], out_dims, dtype, spec),
        Operation::Size(spec) => {
            CpuTensor::rounded(out_dims, dtype, vec![inputs[0].dims[spec.axis] as f64])
        }
    };
    Ok(tensor)
}

pub(crate) fn apply_unary(op: ElementwiseUnaryOp, x: f64) -> f64 {
    match op {
        ElementwiseUnaryOp::Neg => -x,
        ElementwiseUnaryOp::Exp => x.exp(),
        ElementwiseUnaryOp::Tanh => x.tanh(),
        ElementwiseUnaryOp::Rsqrt => 1.0 / x.sqrt(),
        ElementwiseUnaryOp::Reciprocal => 1.0 / x,
    }
}

pub(crate) fn apply_binary(op: ElementwiseBinaryOp, x: f64, y: f64) -> f64 {
    match op {
        ElementwiseBinaryOp::Add => x + y,
        ElementwiseBinaryOp::Sub => x - y,
        ElementwiseBinaryOp::Mul => x * y,
        ElementwiseBinaryOp::Div => x / y,
    }
}

fn op_elementwise_unary(
    input: &CpuTensor,
    dims: Vec<usize>,
    dtype: DType,
    op: ElementwiseUnaryOp,
) -> CpuTensor {
    let values = input.data.iter().map(|&x| apply_unary(op, x)).collect();
    CpuTensor::rounded(dims, dtype, values)
}

/// Strides that read a row-major `dims` buffer as if expanded to `out` (trailing-aligned).
fn expanded_strides(dims: &[usize], out: &[usize]) -> Vec<usize> {
    let own = compute_strides(dims);
    let offset = out.len() - dims.len();
    (0..out.len())
        .map(|axis| match axis.checked_sub(offset) {
            Some(i) if dims[i] != 1 => own[i],
            _ => 0,
        })
        .collect()
}

/// Materializes `data` read through `strides` over `out` in row-major order.
fn gather(data: &[f64], strides: &[usize], out: &[usize]) -> Vec<f64> {
    let numel: usize = out.iter().product();
    let mut values = Vec::with_capacity(numel);
    if numel == 0 {
        return values;
    }
    let mut index = vec![0usize; out.len()];
    loop {
        let offset: usize = index.iter().zip(strides).map(|(i, s)| i * s).sum();
        values.push(data[offset]);
        if !step_index(&mut index, out) {
            break;
        }
    }
    values
}

fn op_elementwise_binary(
    lhs: &CpuTensor,
    rhs: &CpuTensor,
    dims: Vec<usize>,
    dtype: DType,
    op: ElementwiseBinaryOp,
) -> CpuTensor {
    let a = gather(&lhs.data, &expanded_strides(&lhs.dims, &dims), &dims);
    let b = gather(&rhs.data, &expanded_strides(&rhs.dims, &dims), &dims);
    let values = a
        .into_iter()
        .zip(b)
        .map(|(x, y)| apply_binary(op, x, y))
        .collect();
    CpuTensor::rounded(dims, dtype, values)
}

fn op_broadcast(input: &CpuTensor, dims: Vec<usize>, _spec: &BroadcastSpec) -> CpuTensor {
    // Inserting unit axes keeps the row-major order of the data.
    CpuTensor {
        dims,
        dtype: input.dtype,
        data: Arc::clone(&input.data),
    }
}

fn op_broadcast_in_dim(input: &CpuTensor, dims: Vec<usize>, spec: &BroadcastInDimSpec) -> CpuTensor {
    let own = compute_strides(&input.dims);
    let mut strides = vec![0usize; dims.len()];
    for (i, &axis) in spec.broadcast_dims.iter().enumerate() {
        if input.dims[i] != 1 {
            strides[axis] = own[i];
        }
    }
    let values = gather(&input.data, &strides, &dims);
    CpuTensor {
        dims,
        dtype: input.dtype,
        data: Arc::from(values),
    }
}

fn op_reduce(input: &CpuTensor, dims: Vec<usize>, dtype: DType, spec: &ReduceSpec) -> CpuTensor {
    let kept: Vec<usize> = (0..input.dims.len())
        .filter(|axis| !spec.axes.contains(axis))
        .collect();
    let kept_dims: Vec<usize> = kept.iter().map(|&axis| input.dims[axis]).collect();
    let kept_strides = compute_strides(&kept_dims);
    let mut out_strides = vec![0usize; input.dims.len()];
    for (slot, &axis) in kept.iter().enumerate() {
        out_strides[axis] = kept_strides[slot];
    }
    let numel: usize = dims.iter().product();
    let mut acc = vec![0.0; numel];
    if input.data.is_empty() {
        return CpuTensor::rounded(dims, dtype, acc);
    }
    let mut index = vec![0usize; input.dims.len()];
    for &value in input.data.iter() {
        let slot: usize = index.iter().zip(&out_strides).map(|(i, s)| i * s).sum();
        acc[slot] += value;
        step_index(&mut index, &input.dims);
    }
    CpuTensor::rounded(dims, dtype, acc)
}

fn augment_backend_error(
    error: BackendError,
    function_name: &str,
    instruction_index: usize,
    instruction: &Instruction,
    inputs: &[&CpuTensor],
) -> BackendError {
    let context = format!(
        "function `{}` instruction #{}, {} id {:?} operands [{}]",
        function_name,
        instruction_index,
        operation_label(&instruction.op),
        instruction.id,
        format_operands(&instruction.operands, inputs)
    );
    match error {
        BackendError::Execution { message } => BackendError::Execution {
            message: format!("{message} (at {context})"),
        },
        BackendError::SpecViolation(mut err) => {
            let detail = err.detail.take().unwrap_or_default();
            err.detail = Some(format!("{detail} at {context}"));
            BackendError::SpecViolation(err)
        }
    }
}

fn format_operands(operands: &[ValueId], inputs: &[&CpuTensor]) -> String {
    if operands.is_empty() {
        return String::from("<none>");
    }
    operands
        .iter()
        .zip(inputs)
        .map(|(id, tensor)| format!("value {:?} {:?} dtype={:?}", id, tensor.dims, tensor.dtype))
        .collect::<Vec<_>>()
        .join(", ")
}

fn operation_label(op: &Operation) -> &'static str {
    match op {
        Operation::Constant(_) => "constant",
        Operation::ElementwiseUnary(_) => "elementwise_unary",
        Operation::ElementwiseBinary(_) => "elementwise_binary",
        Operation::Cast(_) => "cast",
        Operation::Broadcast(_) => "broadcast",
        Operation::BroadcastInDim(_) => "broadcast_in_dim",
        Operation::Reduce(_) => "reduce",
        Operation::Size(_) => "size",
    }
}
