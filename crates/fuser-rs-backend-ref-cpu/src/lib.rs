//! Reference CPU engine for `fuser-rs` programs.
//!
//! [`CpuBackend`] implements [`FusionBackend`](fuser_rs::backend::spec::FusionBackend). Programs
//! are validated and compiled once per fingerprint into an LRU plan cache. In
//! [`ExecutionMode::Fused`] reduction-free programs run as a single loop over the output; all
//! other programs, and every program in [`ExecutionMode::Interpreted`], run instruction by
//! instruction.

pub mod cpu;
mod fused;
mod plan;
mod shape;

pub use cpu::{CpuBackend, CpuTensor, ExecutionMode};
