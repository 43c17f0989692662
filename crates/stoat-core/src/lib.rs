//! # stoat-core
//!
//! Tensor primitives and the training-time lifecycle machinery of Stoat:
//!
//! - [`Tensor`] — strided, reference-counted n-d array with eager ops and
//!   recorded autograd lineage
//! - [`Shape`] / [`Layout`] — geometry and memory layout
//! - [`DType`] / [`WithDType`] — element types (f16 through i64)
//! - [`Backend`] — the pluggable compute-device trait
//! - [`GradStore`] / [`backprop`] — reverse-mode differentiation
//! - [`WeightTensor`] — weight/gradient pair with explicit buffer lifecycle
//! - [`Graph`] / [`SubGraph`] — scoped lifetime tracking and backward
//!   orchestration

pub mod backend;
pub mod backprop;
pub mod dtype;
pub mod error;
pub mod graph;
pub mod layout;
pub mod op;
pub mod shape;
pub mod tensor;
pub mod weight;

pub use backend::{Backend, BinaryOp, Device, ReduceOp, Storage, UnaryOp};
pub use backprop::{backward, backward_with_seed, GradStore};
pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use graph::{Graph, SubGraph};
pub use layout::Layout;
pub use op::{Op, TensorId};
pub use shape::Shape;
pub use tensor::Tensor;
pub use weight::{NormType, WeightIo, WeightTensor};
