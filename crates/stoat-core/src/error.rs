use crate::shape::Shape;

/// Every failure mode of the engine, in one enum.
///
/// Invariant violations (shape mismatches, double-assigned buffers, reads
/// after release) surface here immediately at the call site; nothing in the
/// core catches or retries. The weight-lifecycle variants carry the tensor
/// name and, where it helps, the provenance of the earlier assignment.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    #[error("dtype mismatch: expected {expected:?}, got {got:?}")]
    DTypeMismatch {
        expected: crate::DType,
        got: crate::DType,
    },

    #[error("dimension out of range: dim {dim} for tensor of rank {rank}")]
    DimOutOfRange { dim: usize, rank: usize },

    #[error("narrow out of bounds: dim {dim}, start {start}, len {len}, dim size {dim_size}")]
    NarrowOutOfBounds {
        dim: usize,
        start: usize,
        len: usize,
        dim_size: usize,
    },

    #[error("element count mismatch: shape {shape} needs {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    #[error("matmul shape mismatch: [{m}x{k1}] @ [{k2}x{n}] — inner dims must agree")]
    MatmulShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    #[error("cannot reshape {src} elements into {dst_shape} ({dst} elements)")]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    /// The weight buffer of a `WeightTensor` was assigned while already
    /// occupied. `set_by` names the call that performed the earlier
    /// assignment so the offending accumulation path can be found.
    #[error("weight buffer of '{name}' is already assigned (by {set_by}); release it first")]
    WeightAlreadySet { name: String, set_by: String },

    #[error("gradient buffer of '{name}' is already assigned (by {set_by}); release it first")]
    GradientAlreadySet { name: String, set_by: String },

    /// Any read or write of a released weight tensor.
    #[error("weight tensor '{name}' has been released and can no longer be accessed")]
    WeightReleased { name: String },

    #[error("gradient shape {grad} does not match weight shape {weight} on '{name}'")]
    GradientShapeMismatch {
        name: String,
        weight: Shape,
        grad: Shape,
    },

    /// An indexing op (gather/scatter/index_select/...) got operands of
    /// different rank.
    #[error("{op}: operand ranks must match, got {lhs} vs {rhs}")]
    IndexRankMismatch {
        op: &'static str,
        lhs: usize,
        rhs: usize,
    },

    /// An indexing op got operands that disagree in size on an axis other
    /// than the target dim.
    #[error("{op}: size mismatch on axis {axis} (target dim {dim}): expected {expected}, got {got}")]
    IndexSizeMismatch {
        op: &'static str,
        axis: usize,
        dim: usize,
        expected: usize,
        got: usize,
    },

    #[error("{0}")]
    Msg(String),
}

impl Error {
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted `Error::Msg`.
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
