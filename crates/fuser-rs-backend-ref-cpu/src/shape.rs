//! Concrete shape rules shared by the interpreter and the fused kernel.

use fuser_rs::backend::spec::{
    BackendError, BackendResult, BroadcastInDimSpec, BroadcastSpec, Extent, Operation,
    ReduceSpec, SpecErrorCode,
};

pub(crate) fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

/// Advances a row-major multi-index, returning false once it wraps around.
pub(crate) fn step_index(index: &mut [usize], dims: &[usize]) -> bool {
    for axis in (0..dims.len()).rev() {
        index[axis] += 1;
        if index[axis] < dims[axis] {
            return true;
        }
        index[axis] = 0;
    }
    false
}

pub(crate) fn broadcast_binary(lhs: &[usize], rhs: &[usize]) -> BackendResult<Vec<usize>> {
    let rank = lhs.len().max(rhs.len());
    let mut out = Vec::with_capacity(rank);
    for axis in 0..rank {
        let l = axis.checked_sub(rank - lhs.len()).map_or(1, |i| lhs[i]);
        let r = axis.checked_sub(rank - rhs.len()).map_or(1, |i| rhs[i]);
        out.push(match (l, r) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => {
                return Err(BackendError::spec(
                    SpecErrorCode::ShapeMismatch,
                    format!("operands {:?} and {:?} do not broadcast", lhs, rhs),
                ))
            }
        });
    }
    Ok(out)
}

pub(crate) fn broadcast_mask(input: &[usize], spec: &BroadcastSpec) -> BackendResult<Vec<usize>> {
    let kept = spec.is_broadcast_dim.iter().filter(|&&flag| !flag).count();
    if kept != input.len() {
        return Err(BackendError::spec(
            SpecErrorCode::BroadcastRankMismatch,
            format!(
                "mask {:?} does not match operand rank {}",
                spec.is_broadcast_dim,
                input.len()
            ),
        ));
    }
    let mut dims = input.iter();
    Ok(spec
        .is_broadcast_dim
        .iter()
        .map(|&flag| if flag { 1 } else { dims.next().copied().unwrap_or(1) })
        .collect())
}

pub(crate) fn broadcast_in_dim(
    input: &[usize],
    spec: &BroadcastInDimSpec,
) -> BackendResult<Vec<usize>> {
    if spec.broadcast_dims.len() != input.len()
        || spec.broadcast_dims.iter().any(|&d| d >= spec.shape.len())
        || spec.broadcast_dims.windows(2).any(|pair| pair[0] >= pair[1])
    {
        return Err(BackendError::spec(
            SpecErrorCode::BroadcastDimsInvalid,
            format!(
                "broadcast dims {:?} for operand {:?} into rank {}",
                spec.broadcast_dims,
                input,
                spec.shape.len()
            ),
        ));
    }
    let mut out = Vec::with_capacity(spec.shape.len());
    for (axis, extent) in spec.shape.iter().enumerate() {
        let mapped = spec.broadcast_dims.iter().position(|&d| d == axis);
        out.push(match (mapped, *extent) {
            (Some(i), Extent::Symbolic) => input[i],
            (Some(i), Extent::Static(n)) if input[i] == n || input[i] == 1 => n,
            (None, Extent::Static(n)) => n,
            _ => {
                return Err(BackendError::spec(
                    SpecErrorCode::ShapeMismatch,
                    format!("operand {:?} cannot expand to {:?}", input, spec.shape),
                ))
            }
        });
    }
    Ok(out)
}

pub(crate) fn reduce(input: &[usize], spec: &ReduceSpec) -> BackendResult<Vec<usize>> {
    if let Some(&axis) = spec.axes.iter().find(|&&axis| axis >= input.len()) {
        return Err(BackendError::spec(
            SpecErrorCode::InvalidAxis,
            format!("reduce axis {axis} for rank {}", input.len()),
        ));
    }
    Ok(input
        .iter()
        .enumerate()
        .filter(|(axis, _)| !spec.axes.contains(axis))
        .map(|(_, &dim)| dim)
        .collect())
}

/// Output dims of `op` applied to operands of the given dims.
pub(crate) fn infer_dims(op: &Operation, operands: &[&[usize]]) -> BackendResult<Vec<usize>> {
    let expect = |count: usize| {
        if operands.len() == count {
            Ok(())
        } else {
            Err(BackendError::spec(
                SpecErrorCode::ArityMismatch,
                format!("expected {count} operands, got {}", operands.len()),
            ))
        }
    };
    match op {
        Operation::Constant(_) => {
            expect(0)?;
            Ok(Vec::new())
        }
        Operation::ElementwiseUnary(_) | Operation::Cast(_) => {
            expect(1)?;
            Ok(operands[0].to_vec())
        }
        Operation::ElementwiseBinary(_) => {
            expect(2)?;
            broadcast_binary(operands[0], operands[1])
        }
        Operation::Broadcast(spec) => {
            expect(1)?;
            broadcast_mask(operands[0], spec)
        }
        Operation::BroadcastInDim(spec) => {
            expect(1)?;
            broadcast_in_dim(operands[0], spec)
        }
        Operation::Reduce(spec) => {
            expect(1)?;
            reduce(operands[0], spec)
        }
        Operation::Size(spec) => {
            expect(1)?;
            if spec.axis >= operands[0].len() {
                return Err(BackendError::spec(
                    SpecErrorCode::InvalidAxis,
                    format!("size axis {} for rank {}", spec.axis, operands[0].len()),
                ));
            }
            Ok(Vec::new())
        }
    }
}
