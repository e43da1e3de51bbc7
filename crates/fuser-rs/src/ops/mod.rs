//! Graph builders layered on the fusion definition API.
//!
//! Builders take a [`FusionDefinition`](crate::fusion::FusionDefinition) and add a complete
//! subgraph to it; they leave declaring outputs to the caller unless the builder describes a
//! whole fusion.

pub mod gelu;

pub use gelu::{gelu_bwd_eager, gelu_bwd_fusion, gelu_bwd_reference_f64};
