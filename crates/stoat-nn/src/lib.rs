//! # stoat-nn
//!
//! Trainable layer modules built on the stoat-core tensor engine:
//!
//! - [`LayerNorm`] — per-row normalization with learnable scale/shift
//! - [`LstmCell`] / [`Lstm`] / [`LstmAttentionCell`] — recurrent cells
//! - [`MoeFeedForward`] — token-level mixture-of-experts dense layer
//! - [`mask`] — attention mask builders (causal, pad, cross, feature)
//! - [`cross_entropy_loss`] — label-smoothed CE with fused gradient seeding
//! - [`top_p_sample`] — nucleus sampling with repeat penalty
//!
//! Layers consume only the tensor operator surface plus graph bind/unbind;
//! none of them touch backend storage directly.

pub mod layernorm;
pub mod loss;
pub mod mask;
pub mod module;
pub mod moe;
pub mod rnn;
pub mod sampling;

pub use layernorm::LayerNorm;
pub use loss::cross_entropy_loss;
pub use module::Module;
pub use moe::{Activation, MoeFeedForward};
pub use rnn::{Lstm, LstmAttentionCell, LstmCell};
pub use sampling::top_p_sample;
