use thiserror::Error;

use crate::backend::spec::{DType, Extent};

/// Definition-time and binding-time failures of the fusion front-end.
#[derive(Debug, Error)]
pub enum FusionError {
    #[error("{op}: shapes {lhs:?} and {rhs:?} are not broadcast compatible")]
    IncompatibleShapes {
        op: &'static str,
        lhs: Vec<Extent>,
        rhs: Vec<Extent>,
    },
    #[error("{op}: axis {axis} is out of range or repeated for rank {rank}")]
    InvalidAxis {
        op: &'static str,
        axis: usize,
        rank: usize,
    },
    #[error("{op}: {reason}")]
    InvalidBroadcast { op: &'static str, reason: String },
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),
    #[error("value %{0} does not belong to this fusion")]
    UnknownValue(u32),
    #[error("invalid output alias: {0}")]
    InvalidAlias(String),
    #[error("fusion declares no outputs")]
    NoOutputs,
    #[error("fusion expects {expected} arguments, got {actual}")]
    ArgumentCount { expected: usize, actual: usize },
    #[error("argument {index}: expected a {expected}")]
    ArgumentKind { index: usize, expected: &'static str },
    #[error("argument {index}: expected {expected} tensor, got {actual}")]
    DTypeMismatch {
        index: usize,
        expected: DType,
        actual: DType,
    },
    #[error("argument {index}: {reason}")]
    InputMismatch { index: usize, reason: String },
}
