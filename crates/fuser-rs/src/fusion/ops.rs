//! Operation methods on [`FusionDefinition`].
//!
//! Every method checks ranks, extents and dtypes while the graph is defined so shape errors
//! surface before any engine sees the program.

use anyhow::Result;

use super::definition::{FusionDefinition, IntoValue, ScalarValue, TensorValue};
use super::error::FusionError;
use crate::backend::spec::{
    BroadcastInDimSpec, BroadcastSpec, DType, ElementwiseBinaryOp, ElementwiseUnaryOp, Extent,
    Operation, ReduceSpec, Shape, SizeSpec, TensorSpec,
};

/// Combines two extents under numpy broadcasting rules.
fn broadcast_extent(lhs: Extent, rhs: Extent) -> Option<Extent> {
    match (lhs, rhs) {
        (Extent::Static(1), other) | (other, Extent::Static(1)) => Some(other),
        (Extent::Static(a), Extent::Static(b)) => (a == b).then_some(Extent::Static(a)),
        (Extent::Symbolic, Extent::Static(n)) | (Extent::Static(n), Extent::Symbolic) => {
            Some(Extent::Static(n))
        }
        (Extent::Symbolic, Extent::Symbolic) => Some(Extent::Symbolic),
    }
}

/// Result dtype of a binary op. A rank-0 operand never widens a ranked one.
fn binary_dtype(lhs: &TensorSpec, rhs: &TensorSpec) -> DType {
    match (lhs.rank(), rhs.rank()) {
        (0, r) if r > 0 => rhs.dtype,
        (l, 0) if l > 0 => lhs.dtype,
        _ => lhs.dtype.promote(rhs.dtype),
    }
}

fn check_axes(op: &'static str, axes: &[usize], rank: usize) -> Result<()> {
    let mut seen = vec![false; rank];
    for &axis in axes {
        if axis >= rank || seen[axis] {
            return Err(FusionError::InvalidAxis { op, axis, rank }.into());
        }
        seen[axis] = true;
    }
    Ok(())
}

impl FusionDefinition {
    fn unary(&mut self, op: ElementwiseUnaryOp, value: TensorValue) -> Result<TensorValue> {
        let output = self.spec(value)?.clone();
        Ok(self.emit(Operation::ElementwiseUnary(op), vec![value.id()], output))
    }

    fn binary(
        &mut self,
        name: &'static str,
        op: ElementwiseBinaryOp,
        lhs: impl IntoValue,
        rhs: impl IntoValue,
    ) -> Result<TensorValue> {
        let lhs = lhs.into_value(self)?;
        let rhs = rhs.into_value(self)?;
        let lhs_spec = self.spec(lhs)?.clone();
        let rhs_spec = self.spec(rhs)?.clone();
        let rank = lhs_spec.rank().max(rhs_spec.rank());
        let pad = |spec: &TensorSpec| {
            let mut dims = vec![Extent::Static(1); rank - spec.rank()];
            dims.extend_from_slice(spec.shape.dims());
            dims
        };
        let (l, r) = (pad(&lhs_spec), pad(&rhs_spec));
        let mut dims = Vec::with_capacity(rank);
        for (&a, &b) in l.iter().zip(&r) {
            let extent = broadcast_extent(a, b).ok_or_else(|| FusionError::IncompatibleShapes {
                op: name,
                lhs: lhs_spec.shape.dims().to_vec(),
                rhs: rhs_spec.shape.dims().to_vec(),
            })?;
            dims.push(extent);
        }
        let output = TensorSpec::new(binary_dtype(&lhs_spec, &rhs_spec), Shape::new(dims));
        Ok(self.emit(
            Operation::ElementwiseBinary(op),
            vec![lhs.id(), rhs.id()],
            output,
        ))
    }

    pub fn add(&mut self, lhs: impl IntoValue, rhs: impl IntoValue) -> Result<TensorValue> {
        self.binary("add", ElementwiseBinaryOp::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: impl IntoValue, rhs: impl IntoValue) -> Result<TensorValue> {
        self.binary("sub", ElementwiseBinaryOp::Sub, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: impl IntoValue, rhs: impl IntoValue) -> Result<TensorValue> {
        self.binary("mul", ElementwiseBinaryOp::Mul, lhs, rhs)
    }

    pub fn div(&mut self, lhs: impl IntoValue, rhs: impl IntoValue) -> Result<TensorValue> {
        self.binary("div", ElementwiseBinaryOp::Div, lhs, rhs)
    }

    pub fn neg(&mut self, value: TensorValue) -> Result<TensorValue> {
        self.unary(ElementwiseUnaryOp::Neg, value)
    }

    pub fn exp(&mut self, value: TensorValue) -> Result<TensorValue> {
        self.unary(ElementwiseUnaryOp::Exp, value)
    }

    pub fn tanh(&mut self, value: TensorValue) -> Result<TensorValue> {
        self.unary(ElementwiseUnaryOp::Tanh, value)
    }

    pub fn rsqrt(&mut self, value: TensorValue) -> Result<TensorValue> {
        self.unary(ElementwiseUnaryOp::Rsqrt, value)
    }

    pub fn reciprocal(&mut self, value: TensorValue) -> Result<TensorValue> {
        self.unary(ElementwiseUnaryOp::Reciprocal, value)
    }

    /// Inserts size-1 axes where `is_broadcast_dim` is set.
    ///
    /// The mask has one entry per output axis; its unset entries consume the operand's axes in
    /// order, so their count must equal the operand rank.
    pub fn broadcast(
        &mut self,
        value: TensorValue,
        is_broadcast_dim: &[bool],
    ) -> Result<TensorValue> {
        let spec = self.spec(value)?.clone();
        let kept = is_broadcast_dim.iter().filter(|&&flag| !flag).count();
        if kept != spec.rank() {
            return Err(FusionError::InvalidBroadcast {
                op: "broadcast",
                reason: format!(
                    "mask {:?} keeps {} axes but the operand has rank {}",
                    is_broadcast_dim,
                    kept,
                    spec.rank()
                ),
            }
            .into());
        }
        let mut operand_dims = spec.shape.dims().iter();
        let dims: Vec<Extent> = is_broadcast_dim
            .iter()
            .map(|&flag| {
                if flag {
                    Extent::Static(1)
                } else {
                    operand_dims.next().copied().unwrap_or(Extent::Static(1))
                }
            })
            .collect();
        let output = TensorSpec::new(spec.dtype, Shape::new(dims));
        Ok(self.emit(
            Operation::Broadcast(BroadcastSpec {
                is_broadcast_dim: is_broadcast_dim.to_vec(),
            }),
            vec![value.id()],
            output,
        ))
    }

    /// Maps operand axis `i` to output axis `broadcast_dims[i]` and expands to `shape`.
    ///
    /// `shape` follows [`FusionDefinition::define_tensor`]: `-1` entries take the extent of the
    /// mapped operand axis, fixed entries must match it or expand a size-1 operand axis.
    /// Unmapped output axes need a fixed extent.
    pub fn broadcast_in_dim(
        &mut self,
        value: TensorValue,
        shape: &[i64],
        broadcast_dims: &[usize],
    ) -> Result<TensorValue> {
        let spec = self.spec(value)?.clone();
        let invalid = |reason: String| FusionError::InvalidBroadcast {
            op: "broadcast_in_dim",
            reason,
        };
        if broadcast_dims.len() != spec.rank() {
            return Err(invalid(format!(
                "{} broadcast dims for an operand of rank {}",
                broadcast_dims.len(),
                spec.rank()
            ))
            .into());
        }
        if broadcast_dims.windows(2).any(|pair| pair[0] >= pair[1])
            || broadcast_dims.iter().any(|&axis| axis >= shape.len())
        {
            return Err(invalid(format!(
                "broadcast dims {:?} must be increasing and below rank {}",
                broadcast_dims,
                shape.len()
            ))
            .into());
        }
        let mut target = Vec::with_capacity(shape.len());
        for &extent in shape {
            target.push(match extent {
                -1 => Extent::Symbolic,
                n if n >= 0 => Extent::Static(n as usize),
                n => return Err(invalid(format!("invalid extent {n}")).into()),
            });
        }
        let mut dims = Vec::with_capacity(shape.len());
        for (axis, &extent) in target.iter().enumerate() {
            let mapped = broadcast_dims.iter().position(|&d| d == axis);
            let dim = match (mapped, extent) {
                (None, Extent::Symbolic) => {
                    return Err(invalid(format!(
                        "output axis {axis} is not mapped and has no fixed extent"
                    ))
                    .into())
                }
                (None, fixed) => fixed,
                (Some(i), Extent::Symbolic) => spec.shape.dims()[i],
                (Some(i), Extent::Static(n)) => match spec.shape.dims()[i] {
                    Extent::Static(m) if m != n && m != 1 => {
                        return Err(invalid(format!(
                            "operand axis {i} has extent {m}, cannot expand to {n}"
                        ))
                        .into())
                    }
                    _ => Extent::Static(n),
                },
            };
            dims.push(dim);
        }
        let output = TensorSpec::new(spec.dtype, Shape::new(dims));
        Ok(self.emit(
            Operation::BroadcastInDim(BroadcastInDimSpec {
                shape: target,
                broadcast_dims: broadcast_dims.to_vec(),
            }),
            vec![value.id()],
            output,
        ))
    }

    /// Sums over `axes`, dropping them from the result.
    pub fn sum(&mut self, value: TensorValue, axes: &[usize]) -> Result<TensorValue> {
        let spec = self.spec(value)?.clone();
        check_axes("sum", axes, spec.rank())?;
        let dims: Vec<Extent> = spec
            .shape
            .dims()
            .iter()
            .enumerate()
            .filter(|(axis, _)| !axes.contains(axis))
            .map(|(_, &extent)| extent)
            .collect();
        let mut sorted = axes.to_vec();
        sorted.sort_unstable();
        let output = TensorSpec::new(spec.dtype, Shape::new(dims));
        Ok(self.emit(
            Operation::Reduce(ReduceSpec { axes: sorted }),
            vec![value.id()],
            output,
        ))
    }

    /// Runtime extent of `axis` as an `F64` scalar.
    pub fn size(&mut self, value: TensorValue, axis: usize) -> Result<ScalarValue> {
        let rank = self.spec(value)?.rank();
        check_axes("size", &[axis], rank)?;
        Ok(self.emit(
            Operation::Size(SizeSpec { axis }),
            vec![value.id()],
            TensorSpec::scalar(DType::F64),
        ))
    }

    /// Product of the runtime extents of `axes` as an `F64` scalar.
    pub fn numel(&mut self, value: TensorValue, axes: &[usize]) -> Result<ScalarValue> {
        let rank = self.spec(value)?.rank();
        check_axes("numel", axes, rank)?;
        let mut count = self.define_scalar(1.0);
        for &axis in axes {
            let extent = self.size(value, axis)?;
            count = self.mul(count, extent)?;
        }
        Ok(count)
    }

    /// Variance and mean over `axes`; the variance divides by `N - correction`.
    ///
    /// Returns `(var, mean)` with the reduced axes dropped.
    pub fn var_mean(
        &mut self,
        value: TensorValue,
        axes: &[usize],
        correction: usize,
    ) -> Result<(TensorValue, TensorValue)> {
        let rank = self.spec(value)?.rank();
        check_axes("var_mean", axes, rank)?;
        let count = self.numel(value, axes)?;
        let total = self.sum(value, axes)?;
        let mean = self.div(total, count)?;
        let mask: Vec<bool> = (0..rank).map(|axis| axes.contains(&axis)).collect();
        let mean_b = self.broadcast(mean, &mask)?;
        let centered = self.sub(value, mean_b)?;
        let squared = self.mul(centered, centered)?;
        let m2 = self.sum(squared, axes)?;
        let denom = self.sub(count, correction as f64)?;
        let var = self.div(m2, denom)?;
        Ok((var, mean))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extents_follow_numpy_broadcasting() {
        assert_eq!(
            broadcast_extent(Extent::Static(1), Extent::Symbolic),
            Some(Extent::Symbolic)
        );
        assert_eq!(
            broadcast_extent(Extent::Static(4), Extent::Static(4)),
            Some(Extent::Static(4))
        );
        assert_eq!(broadcast_extent(Extent::Static(4), Extent::Static(3)), None);
    }

    #[test]
    fn scalars_do_not_widen_tensors() {
        let half = TensorSpec::new(DType::F16, Shape::new(vec![Extent::Symbolic]));
        let scalar = TensorSpec::scalar(DType::F64);
        assert_eq!(binary_dtype(&half, &scalar), DType::F16);
        assert_eq!(binary_dtype(&scalar, &scalar), DType::F64);
    }
}
