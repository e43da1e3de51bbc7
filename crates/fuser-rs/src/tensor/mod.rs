//! Host tensor runtime shared by the fusion front-end and its backends.
//!
//! Tensors are strided views over shared, dtype-tagged storage. The module also hosts the
//! eager elementwise ops used as the unfused baseline in benchmarks.

pub mod dtype;
mod eager;
mod host_tensor;

pub use dtype::DType;
pub use eager::broadcast_shapes;
pub use host_tensor::Tensor;
