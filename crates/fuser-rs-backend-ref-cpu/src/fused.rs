//! Single-loop evaluation of reduction-free programs.
//!
//! The kernel walks the output index space once and evaluates the whole instruction list per
//! element in registers, so no intermediate buffer is materialized. Broadcast ops become index
//! remaps: before running, every input gets strides expressed in output coordinates, derived by
//! walking the program backwards from its results.

use std::collections::HashMap;
use std::sync::Arc;

use fuser_rs::backend::spec::{BackendResult, DType, Function, Operation, ValueId};

use crate::cpu::{apply_binary, apply_unary, CpuTensor};
use crate::shape::{compute_strides, infer_dims, step_index};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionRef {
    Input(usize),
    Node(usize),
}

#[derive(Debug, Clone)]
pub struct FusionNode {
    pub op: Operation,
    pub args: Vec<FusionRef>,
    pub dtype: DType,
}

/// Output axis each operand axis follows; `None` for size-1 axes.
type AxisMap = Vec<Option<usize>>;

pub struct FusedKernel {
    nodes: Vec<FusionNode>,
    results: Vec<FusionRef>,
    result_dtypes: Vec<DType>,
}

impl FusedKernel {
    /// Returns `None` when the function contains non-elementwise instructions.
    pub fn build(function: &Function) -> Option<Self> {
        if !function.body.iter().all(|inst| inst.op.is_elementwise()) {
            return None;
        }
        let mut refs: HashMap<ValueId, FusionRef> = function
            .parameter_ids
            .iter()
            .enumerate()
            .map(|(index, id)| (*id, FusionRef::Input(index)))
            .collect();
        let mut nodes = Vec::with_capacity(function.body.len());
        for instruction in &function.body {
            let args = instruction
                .operands
                .iter()
                .map(|id| refs.get(id).copied())
                .collect::<Option<Vec<_>>>()?;
            refs.insert(instruction.id, FusionRef::Node(nodes.len()));
            nodes.push(FusionNode {
                op: instruction.op.clone(),
                args,
                dtype: instruction.output.dtype,
            });
        }
        let results = function
            .result_ids
            .iter()
            .map(|id| refs.get(id).copied())
            .collect::<Option<Vec<_>>>()?;
        let result_dtypes = function.results.iter().map(|spec| spec.dtype).collect();
        Some(Self {
            nodes,
            results,
            result_dtypes,
        })
    }

    /// Runs the kernel, or returns `Ok(None)` when these input shapes cannot be fused (results
    /// of different shapes, or one value read under two different index mappings).
    pub fn execute(&self, inputs: &[CpuTensor]) -> BackendResult<Option<Vec<CpuTensor>>> {
        if inputs.iter().any(|input| input.data.is_empty()) {
            return Ok(None);
        }

        let mut node_dims: Vec<Vec<usize>> = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let operand_dims: Vec<&[usize]> = node
                .args
                .iter()
                .map(|&r| dims_of(r, inputs, &node_dims))
                .collect();
            let dims = infer_dims(&node.op, &operand_dims)?;
            node_dims.push(dims);
        }

        let Some(&first) = self.results.first() else {
            return Ok(Some(Vec::new()));
        };
        let out_dims = dims_of(first, inputs, &node_dims).to_vec();
        if self
            .results
            .iter()
            .any(|&r| dims_of(r, inputs, &node_dims) != out_dims.as_slice())
        {
            return Ok(None);
        }

        let Some(input_maps) = self.axis_maps(inputs, &node_dims, &out_dims) else {
            return Ok(None);
        };
        let input_strides: Vec<Vec<usize>> = inputs
            .iter()
            .zip(&input_maps)
            .map(|(input, map)| {
                let own = compute_strides(&input.dims);
                let mut strides = vec![0usize; out_dims.len()];
                if let Some(map) = map {
                    for (axis, target) in map.iter().enumerate() {
                        if let Some(target) = target {
                            strides[*target] += own[axis];
                        }
                    }
                }
                strides
            })
            .collect();

        let numel: usize = out_dims.iter().product();
        let mut outputs: Vec<Vec<f64>> = vec![Vec::with_capacity(numel); self.results.len()];
        let mut regs = vec![0.0f64; self.nodes.len()];
        let mut offsets = vec![0usize; inputs.len()];
        let mut index = vec![0usize; out_dims.len()];
        if numel > 0 {
            loop {
                for (offset, strides) in offsets.iter_mut().zip(&input_strides) {
                    *offset = index.iter().zip(strides).map(|(i, s)| i * s).sum();
                }
                for (slot, node) in self.nodes.iter().enumerate() {
                    let value = match &node.op {
                        Operation::Constant(literal) => literal.value,
                        Operation::ElementwiseUnary(op) => {
                            apply_unary(*op, read(node.args[0], inputs, &offsets, &regs))
                        }
                        Operation::ElementwiseBinary(op) => apply_binary(
                            *op,
                            read(node.args[0], inputs, &offsets, &regs),
                            read(node.args[1], inputs, &offsets, &regs),
                        ),
                        _ => read(node.args[0], inputs, &offsets, &regs),
                    };
                    regs[slot] = node.dtype.round(value);
                }
                for (output, &r) in outputs.iter_mut().zip(&self.results) {
                    output.push(read(r, inputs, &offsets, &regs));
                }
                if !step_index(&mut index, &out_dims) {
                    break;
                }
            }
        }

        Ok(Some(
            outputs
                .into_iter()
                .zip(&self.result_dtypes)
                .map(|(values, &dtype)| CpuTensor {
                    dims: out_dims.clone(),
                    dtype,
                    data: Arc::from(values),
                })
                .collect(),
        ))
    }

    /// Propagates output coordinates back to every input. `None` on conflicting mappings.
    fn axis_maps(
        &self,
        inputs: &[CpuTensor],
        node_dims: &[Vec<usize>],
        out_dims: &[usize],
    ) -> Option<Vec<Option<AxisMap>>> {
        let mut input_maps: Vec<Option<AxisMap>> = vec![None; inputs.len()];
        let mut node_maps: Vec<Option<AxisMap>> = vec![None; self.nodes.len()];
        let identity: AxisMap = out_dims
            .iter()
            .enumerate()
            .map(|(axis, &dim)| (dim != 1).then_some(axis))
            .collect();
        for &r in &self.results {
            if !merge(slot_of(r, &mut input_maps, &mut node_maps), identity.clone()) {
                return None;
            }
        }
        for (slot, node) in self.nodes.iter().enumerate().rev() {
            let Some(consumer) = node_maps[slot].clone() else {
                continue;
            };
            for &arg in &node.args {
                let operand_dims = dims_of(arg, inputs, node_dims);
                let map = operand_map(&node.op, &consumer, operand_dims);
                if !merge(slot_of(arg, &mut input_maps, &mut node_maps), map) {
                    return None;
                }
            }
        }
        Some(input_maps)
    }
}

fn operand_map(op: &Operation, consumer: &[Option<usize>], dims: &[usize]) -> AxisMap {
    let raw: AxisMap = match op {
        Operation::ElementwiseUnary(_) | Operation::Cast(_) => consumer.to_vec(),
        Operation::ElementwiseBinary(_) => {
            let offset = consumer.len() - dims.len();
            consumer[offset..].to_vec()
        }
        Operation::Broadcast(spec) => spec
            .is_broadcast_dim
            .iter()
            .zip(consumer)
            .filter(|(&flag, _)| !flag)
            .map(|(_, &target)| target)
            .collect(),
        Operation::BroadcastInDim(spec) => spec
            .broadcast_dims
            .iter()
            .map(|&axis| consumer[axis])
            .collect(),
        _ => vec![None; dims.len()],
    };
    raw.into_iter()
        .zip(dims)
        .map(|(target, &dim)| if dim == 1 { None } else { target })
        .collect()
}

fn merge(slot: &mut Option<AxisMap>, map: AxisMap) -> bool {
    match slot {
        Some(existing) => *existing == map,
        None => {
            *slot = Some(map);
            true
        }
    }
}

fn slot_of<'a>(
    r: FusionRef,
    input_maps: &'a mut [Option<AxisMap>],
    node_maps: &'a mut [Option<AxisMap>],
) -> &'a mut Option<AxisMap> {
    match r {
        FusionRef::Input(index) => &mut input_maps[index],
        FusionRef::Node(index) => &mut node_maps[index],
    }
}

fn dims_of<'a>(r: FusionRef, inputs: &'a [CpuTensor], node_dims: &'a [Vec<usize>]) -> &'a [usize] {
    match r {
        FusionRef::Input(index) => &inputs[index].dims,
        FusionRef::Node(index) => &node_dims[index],
    }
}

fn read(r: FusionRef, inputs: &[CpuTensor], offsets: &[usize], regs: &[f64]) -> f64 {
    match r {
        FusionRef::Input(index) => inputs[index].data[offsets[index]],
        FusionRef::Node(index) => regs[index],
    }
}
