//! Fused instance, batch and layer normalization.
//!
//! [`graph`] emits the forward and backward graphs for any statistics-axis role set,
//! [`NormFunction`] binds them to concrete tensors with an explicit saved context, and
//! [`NormLayer`] wraps that in a module with parameters, running buffers and state-dict
//! loading.

use thiserror::Error;

mod function;
pub mod graph;
mod layers;

pub use function::{
    detect_channels_last, NormContext, NormFunction, NormGradients, NormInputs, NormOptions,
};
pub use graph::{
    norm_fusion_backward, norm_fusion_forward, NamedAxis, NormAxes, NormBackwardInputs,
    NormBackwardOptions, NormBackwardOutputs, NormForwardOutputs, NormGraphInputs,
    NormGraphOptions, StatAxes,
};
pub use layers::{NormConfig, NormKind, NormLayer, Parameter, Spatial};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormError {
    #[error("expected {expected}D input (got {actual}D input)")]
    InvalidInputRank { expected: usize, actual: usize },
    #[error("normalization needs batch and channel axes, got a rank {0} input")]
    RankTooLow(usize),
    #[error("unhandled channels_last format variation for a rank {0} tensor")]
    UnsupportedChannelsLastRank(usize),
    #[error("running_mean and running_var must be given together")]
    UnpairedRunningStats,
    #[error("{what} of shape {actual:?} does not match {expected:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}
