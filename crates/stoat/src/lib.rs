//! # stoat
//!
//! Umbrella crate of the Stoat deep-learning engine: the model weight
//! store with optional vector-quantized compression, checkpoint
//! persistence, and weight diagnostics — on top of re-exports of the
//! tensor core and the layer library.
//!
//! ```ignore
//! use stoat::prelude::*;
//! use stoat_cpu::{CpuBackend, CpuDevice};
//!
//! let dev = CpuDevice::default();
//! let graph = Graph::<CpuBackend>::root();
//! let w = WeightTensor::trainable(
//!     "proj", (64, 32), DType::F32, &dev,
//!     NormType::Uniform, Some(64), Some(32),
//! )?;
//!
//! let mut store = ModelStore::new(QuantMode::Int8);
//! w.save(&mut store)?;
//! checkpoint::save("model.stw", &store)?;
//! ```

pub mod checkpoint;
pub mod diag;
pub mod store;
pub mod vq;

pub use diag::WeightLogger;
pub use store::{ModelStore, QuantEntry, QuantMode};
pub use vq::VectorQuantizer;

pub mod prelude {
    pub use crate::store::{ModelStore, QuantMode};
    pub use crate::vq::VectorQuantizer;
    pub use stoat_core::{
        backward, DType, Error, GradStore, Graph, NormType, Result, Shape, SubGraph, Tensor,
        WeightIo, WeightTensor,
    };
    pub use stoat_nn::{
        cross_entropy_loss, top_p_sample, Activation, LayerNorm, Lstm, LstmAttentionCell,
        LstmCell, MoeFeedForward, Module,
    };
}
