//! Fusion graph definition front-end.
//!
//! A graph is defined inside [`FusionDefinition::define`], which hands the closure a mutable
//! definition scope and finalizes it into a [`Fusion`] once the closure returns. The fusion is
//! then executed against concrete tensors on any [`FusionBackend`](crate::backend::spec::FusionBackend).
//!
//! ```ignore
//! let fusion = FusionDefinition::define(|fd| {
//!     let x = fd.define_tensor(&[-1, -1], &[Some(true), Some(true)], DType::F32)?;
//!     let y = fd.mul(x, 2.0)?;
//!     fd.add_output(y)
//! })?;
//! let outputs = fusion.execute(&backend, &[FusionArg::from(&input)])?;
//! ```

mod definition;
mod error;
mod execute;
mod ops;
mod validate;

pub use definition::{FusionDefinition, IntoValue, ScalarValue, TensorValue};
pub use error::FusionError;
pub use execute::{Fusion, FusionArg};
pub use validate::{compare_outputs, Tolerance, ValidationError};
