//! Fusion graph definition, execution and the graphs built on top of it.
//!
//! Graphs are defined with [`FusionDefinition`], lowered to a [`backend::spec::Program`] and run
//! by any [`FusionBackend`]. The [`ops`] and [`nn`] trees build complete graphs (GELU backward,
//! instance/batch/layer normalization); [`bench`] times them against unfused baselines.

pub mod backend;
pub mod bench;
pub mod env;
pub mod fusion;
pub mod layout;
pub mod module;
pub mod nn;
pub mod ops;
pub mod tensor;

pub use backend::spec::FusionBackend;
pub use fusion::{Fusion, FusionArg, FusionDefinition};
pub use tensor::{DType, Tensor};
