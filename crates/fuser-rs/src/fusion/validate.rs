use anyhow::Result;
use thiserror::Error;

use super::execute::{Fusion, FusionArg};
use crate::backend::spec::{DType, FusionBackend};
use crate::tensor::Tensor;

/// Absolute and relative tolerance used to compare an output against its reference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub atol: f64,
    pub rtol: f64,
}

impl Tolerance {
    pub fn new(atol: f64, rtol: f64) -> Self {
        Self { atol, rtol }
    }

    /// Default tolerance for outputs stored in `dtype`.
    pub fn for_dtype(dtype: DType) -> Self {
        match dtype {
            DType::F64 => Self::new(1e-7, 1e-7),
            DType::F32 => Self::new(1e-5, 1e-5),
            DType::F16 => Self::new(1e-5, 1e-3),
            DType::BF16 => Self::new(1e-5, 1.6e-2),
        }
    }

    /// `|actual - expected| <= atol + rtol * |expected|`; NaNs only match NaNs.
    pub fn is_close(&self, actual: f64, expected: f64) -> bool {
        if actual.is_nan() || expected.is_nan() {
            return actual.is_nan() && expected.is_nan();
        }
        if actual == expected {
            return true;
        }
        (actual - expected).abs() <= self.atol + self.rtol * expected.abs()
    }
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("fusion produced {actual} outputs, {expected} references were given")]
    OutputCount { expected: usize, actual: usize },
    #[error("output {output}: shape {actual:?} does not match reference shape {expected:?}")]
    ShapeMismatch {
        output: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error(
        "output {output}: element {index} is {actual}, reference is {expected} \
         (max abs error {max_abs_error:e}, atol {atol:e}, rtol {rtol:e})"
    )]
    Mismatch {
        output: usize,
        index: usize,
        actual: f64,
        expected: f64,
        max_abs_error: f64,
        atol: f64,
        rtol: f64,
    },
}

/// Compares each output with its reference using the output dtype's tolerance.
pub fn compare_outputs(outputs: &[Tensor], references: &[Tensor]) -> Result<(), ValidationError> {
    if outputs.len() != references.len() {
        return Err(ValidationError::OutputCount {
            expected: references.len(),
            actual: outputs.len(),
        });
    }
    for (output, (actual, expected)) in outputs.iter().zip(references).enumerate() {
        if actual.sizes() != expected.sizes() {
            return Err(ValidationError::ShapeMismatch {
                output,
                expected: expected.sizes().to_vec(),
                actual: actual.sizes().to_vec(),
            });
        }
        let tolerance = Tolerance::for_dtype(actual.dtype());
        let actual_values = actual.to_vec_f64();
        let expected_values = expected.to_vec_f64();
        let mut first_failure = None;
        let mut max_abs_error = 0.0f64;
        for (index, (&a, &e)) in actual_values.iter().zip(&expected_values).enumerate() {
            max_abs_error = max_abs_error.max((a - e).abs());
            if first_failure.is_none() && !tolerance.is_close(a, e) {
                first_failure = Some((index, a, e));
            }
        }
        if let Some((index, actual, expected)) = first_failure {
            return Err(ValidationError::Mismatch {
                output,
                index,
                actual,
                expected,
                max_abs_error,
                atol: tolerance.atol,
                rtol: tolerance.rtol,
            });
        }
    }
    Ok(())
}

impl Fusion {
    /// Executes the fusion and checks every output against `references`.
    ///
    /// Returns the outputs on success. A mismatch surfaces as a [`ValidationError`] inside the
    /// returned error.
    pub fn validate(
        &self,
        backend: &dyn FusionBackend,
        args: &[FusionArg],
        references: &[Tensor],
    ) -> Result<Vec<Tensor>> {
        let outputs = self.execute(backend, args)?;
        compare_outputs(&outputs, references)?;
        Ok(outputs)
    }
}
