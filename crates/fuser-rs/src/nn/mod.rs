//! Neural network building blocks assembled from fusion graphs.
//!
//! Layers define their graphs per call and run them on the [`FusionBackend`] they are handed;
//! compiled programs are cached by the backend, not by the layer.
//!
//! [`FusionBackend`]: crate::backend::spec::FusionBackend

pub mod normalization;

pub use normalization::{
    NormConfig, NormContext, NormError, NormFunction, NormGradients, NormKind, NormLayer,
    Parameter, Spatial, StatAxes,
};
