// Op — the record of how a tensor was produced.
//
// Every operation stamps its output with an Op variant holding Arc-cheap
// clones of the inputs plus whatever parameters the backward rule needs.
// The resulting DAG *is* the autograd graph: backward() walks it from the
// loss in reverse topological order, and input tensors stay alive exactly
// as long as some output still references them.

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Unique tensor identifier; key for gradient accumulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId(pub(crate) u64);

impl TensorId {
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        TensorId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TensorId {
    fn default() -> Self {
        Self::new()
    }
}

/// The operation that produced a tensor. `None` marks leaves (inputs and
/// parameters); everything else carries its inputs for the backward pass.
pub enum Op<B: Backend> {
    None,

    Binary {
        lhs: Tensor<B>,
        rhs: Tensor<B>,
        op: BinaryOp,
    },

    Unary {
        input: Tensor<B>,
        op: UnaryOp,
    },

    /// result = input * mul + add; only `mul` matters for the gradient.
    ScaleShift {
        input: Tensor<B>,
        mul: f64,
    },

    /// Fused a⊙b + c⊙d.
    MulMulAdd {
        a: Tensor<B>,
        b: Tensor<B>,
        c: Tensor<B>,
        d: Tensor<B>,
    },

    Reduce {
        input: Tensor<B>,
        op: ReduceOp,
        dims: Vec<usize>,
        keep_dim: bool,
    },

    Matmul {
        lhs: Tensor<B>,
        rhs: Tensor<B>,
    },

    /// Covers reshape/unsqueeze; `src_shape` restores the gradient's shape.
    Reshape {
        input: Tensor<B>,
        src_shape: Shape,
    },

    Transpose {
        input: Tensor<B>,
        dim0: usize,
        dim1: usize,
    },

    Narrow {
        input: Tensor<B>,
        dim: usize,
        start: usize,
        len: usize,
    },

    Contiguous {
        input: Tensor<B>,
    },

    /// `sizes` are the per-input extents along `dim`, so backward can carve
    /// the gradient back into per-input slices.
    Cat {
        inputs: Vec<Tensor<B>>,
        dim: usize,
        sizes: Vec<usize>,
    },

    Gather {
        input: Tensor<B>,
        index: Tensor<B>,
        dim: usize,
    },

    Scatter {
        base: Tensor<B>,
        index: Tensor<B>,
        src: Tensor<B>,
        dim: usize,
        accumulate: bool,
    },

    IndexSelect {
        input: Tensor<B>,
        indices: Vec<usize>,
        dim: usize,
    },

    IndexUpdate {
        base: Tensor<B>,
        indices: Vec<usize>,
        src: Tensor<B>,
        dim: usize,
        accumulate: bool,
    },
}

impl<B: Backend> Op<B> {
    /// Input tensors of this op, for the topological walk.
    pub fn inputs(&self) -> Vec<&Tensor<B>> {
        match self {
            Op::None => vec![],
            Op::Binary { lhs, rhs, .. } | Op::Matmul { lhs, rhs } => vec![lhs, rhs],
            Op::Unary { input, .. }
            | Op::ScaleShift { input, .. }
            | Op::Reduce { input, .. }
            | Op::Reshape { input, .. }
            | Op::Transpose { input, .. }
            | Op::Narrow { input, .. }
            | Op::Contiguous { input }
            | Op::Gather { input, .. }
            | Op::IndexSelect { input, .. } => vec![input],
            Op::MulMulAdd { a, b, c, d } => vec![a, b, c, d],
            Op::Cat { inputs, .. } => inputs.iter().collect(),
            Op::Scatter {
                base, index, src, ..
            } => vec![base, index, src],
            Op::IndexUpdate { base, src, .. } => vec![base, src],
        }
    }
}

// Clones are cheap throughout: a Tensor clone is an Arc refcount bump.
impl<B: Backend> Clone for Op<B> {
    fn clone(&self) -> Self {
        match self {
            Op::None => Op::None,
            Op::Binary { lhs, rhs, op } => Op::Binary {
                lhs: lhs.clone(),
                rhs: rhs.clone(),
                op: *op,
            },
            Op::Unary { input, op } => Op::Unary {
                input: input.clone(),
                op: *op,
            },
            Op::ScaleShift { input, mul } => Op::ScaleShift {
                input: input.clone(),
                mul: *mul,
            },
            Op::MulMulAdd { a, b, c, d } => Op::MulMulAdd {
                a: a.clone(),
                b: b.clone(),
                c: c.clone(),
                d: d.clone(),
            },
            Op::Reduce {
                input,
                op,
                dims,
                keep_dim,
            } => Op::Reduce {
                input: input.clone(),
                op: *op,
                dims: dims.clone(),
                keep_dim: *keep_dim,
            },
            Op::Matmul { lhs, rhs } => Op::Matmul {
                lhs: lhs.clone(),
                rhs: rhs.clone(),
            },
            Op::Reshape { input, src_shape } => Op::Reshape {
                input: input.clone(),
                src_shape: src_shape.clone(),
            },
            Op::Transpose { input, dim0, dim1 } => Op::Transpose {
                input: input.clone(),
                dim0: *dim0,
                dim1: *dim1,
            },
            Op::Narrow {
                input,
                dim,
                start,
                len,
            } => Op::Narrow {
                input: input.clone(),
                dim: *dim,
                start: *start,
                len: *len,
            },
            Op::Contiguous { input } => Op::Contiguous {
                input: input.clone(),
            },
            Op::Cat { inputs, dim, sizes } => Op::Cat {
                inputs: inputs.clone(),
                dim: *dim,
                sizes: sizes.clone(),
            },
            Op::Gather { input, index, dim } => Op::Gather {
                input: input.clone(),
                index: index.clone(),
                dim: *dim,
            },
            Op::Scatter {
                base,
                index,
                src,
                dim,
                accumulate,
            } => Op::Scatter {
                base: base.clone(),
                index: index.clone(),
                src: src.clone(),
                dim: *dim,
                accumulate: *accumulate,
            },
            Op::IndexSelect {
                input,
                indices,
                dim,
            } => Op::IndexSelect {
                input: input.clone(),
                indices: indices.clone(),
                dim: *dim,
            },
            Op::IndexUpdate {
                base,
                indices,
                src,
                dim,
                accumulate,
            } => Op::IndexUpdate {
                base: base.clone(),
                indices: indices.clone(),
                src: src.clone(),
                dim: *dim,
                accumulate: *accumulate,
            },
        }
    }
}

// Debug shows op kind and input ids, never element data.
impl<B: Backend> std::fmt::Debug for Op<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::None => write!(f, "None"),
            Op::Binary { lhs, rhs, op } => {
                write!(f, "Binary({op:?}, {:?}, {:?})", lhs.id(), rhs.id())
            }
            Op::Unary { input, op } => write!(f, "Unary({op:?}, {:?})", input.id()),
            Op::ScaleShift { input, mul } => write!(f, "ScaleShift(*{mul}, {:?})", input.id()),
            Op::MulMulAdd { a, b, c, d } => write!(
                f,
                "MulMulAdd({:?}, {:?}, {:?}, {:?})",
                a.id(),
                b.id(),
                c.id(),
                d.id()
            ),
            Op::Reduce {
                input, op, dims, ..
            } => write!(f, "Reduce({op:?}, dims={dims:?}, {:?})", input.id()),
            Op::Matmul { lhs, rhs } => write!(f, "Matmul({:?}, {:?})", lhs.id(), rhs.id()),
            Op::Reshape { input, src_shape } => {
                write!(f, "Reshape({src_shape} -> ?, {:?})", input.id())
            }
            Op::Transpose { input, dim0, dim1 } => {
                write!(f, "Transpose({dim0}, {dim1}, {:?})", input.id())
            }
            Op::Narrow {
                input,
                dim,
                start,
                len,
            } => write!(
                f,
                "Narrow(dim={dim}, {start}..{}, {:?})",
                start + len,
                input.id()
            ),
            Op::Contiguous { input } => write!(f, "Contiguous({:?})", input.id()),
            Op::Cat { inputs, dim, .. } => {
                let ids: Vec<_> = inputs.iter().map(|t| t.id()).collect();
                write!(f, "Cat(dim={dim}, {ids:?})")
            }
            Op::Gather { input, index, dim } => {
                write!(f, "Gather(dim={dim}, {:?}, {:?})", input.id(), index.id())
            }
            Op::Scatter {
                base,
                index,
                src,
                dim,
                accumulate,
            } => write!(
                f,
                "Scatter(dim={dim}, acc={accumulate}, {:?}, {:?}, {:?})",
                base.id(),
                index.id(),
                src.id()
            ),
            Op::IndexSelect { input, dim, .. } => {
                write!(f, "IndexSelect(dim={dim}, {:?})", input.id())
            }
            Op::IndexUpdate {
                base,
                src,
                dim,
                accumulate,
                ..
            } => write!(
                f,
                "IndexUpdate(dim={dim}, acc={accumulate}, {:?}, {:?})",
                base.id(),
                src.id()
            ),
        }
    }
}
