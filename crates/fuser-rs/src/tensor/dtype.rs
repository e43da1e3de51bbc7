//! Enumerates the floating-point element types understood by fusion programs and host tensors.

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

/// Logical dtype identifier shared between host tensors, fusion values and backend programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 16-bit floating point with full mantissa (fp16).
    F16,
    /// 16-bit bfloat16 precision as used by many accelerators.
    BF16,
    /// 32-bit floating point following IEEE-754 semantics.
    F32,
    /// 64-bit floating point, used for references and runtime scalars.
    F64,
}

impl DType {
    /// Returns the number of bytes required per scalar element.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F16 | DType::BF16 => 2,
            DType::F32 => 4,
            DType::F64 => 8,
        }
    }

    /// True for the 16-bit types that fusion graphs promote to `F32` before computing.
    pub fn is_reduced_precision(self) -> bool {
        matches!(self, DType::F16 | DType::BF16)
    }

    /// Result type of an arithmetic op between two tensors of these dtypes.
    ///
    /// The wider type wins; mixing the two 16-bit formats yields `F32` because neither
    /// represents the other exactly.
    pub fn promote(self, other: DType) -> DType {
        match (self, other) {
            (a, b) if a == b => a,
            (DType::F64, _) | (_, DType::F64) => DType::F64,
            _ => DType::F32,
        }
    }

    /// Rounds an `f64` to the nearest value representable in this dtype.
    pub fn round(self, value: f64) -> f64 {
        match self {
            DType::F16 => f16::from_f64(value).to_f64(),
            DType::BF16 => bf16::from_f64(value).to_f64(),
            DType::F32 => value as f32 as f64,
            DType::F64 => value,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
