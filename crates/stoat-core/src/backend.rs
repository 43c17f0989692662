use crate::dtype::DType;
use crate::error::Result;
use crate::layout::Layout;
use crate::shape::Shape;
use std::fmt;

// Backend — the pluggable compute-device seam.
//
// Everything above this trait (tensors, autograd, weight lifecycle, layers)
// is device-agnostic; everything below it (buffer pools, kernels) is one
// backend crate. A backend supplies its own storage and device types, so a
// CPU backend holds typed vecs while a GPU backend would hold device
// allocations — the core never touches raw buffers, only storage handles
// plus layouts.
//
// All kernels are immutable: they take storage + layout and return fresh
// storage. In-place semantics live a level up (tensor views aliasing one
// storage), not in the kernel signatures.

/// A logical compute device. The `ordinal` is the stable integer id used to
/// key allocations and placements.
pub trait Device: Clone + fmt::Debug + Send + Sync + 'static {
    fn ordinal(&self) -> usize;

    /// Human-readable name, e.g. "cpu:0".
    fn name(&self) -> String;
}

/// A buffer of tensor elements living on some device.
pub trait Storage: Clone + Send + Sync + 'static {
    fn dtype(&self) -> DType;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Element-wise binary operations. Recorded in the op graph so backward
/// knows which derivative to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Element-wise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Exp,
    Log,
    Sqrt,
    /// x^(-1/2); cheaper than sqrt-then-div in normalization paths.
    Rsqrt,
    Square,
    Relu,
    Sigmoid,
    Tanh,
    /// x * sigmoid(x) (swish).
    Silu,
}

/// Reductions along dimension(s).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
    ArgMax,
}

/// A complete compute backend: implement this and every tensor operation,
/// layer, and the weight store run unchanged on the new device.
pub trait Backend: Clone + Send + Sync + fmt::Debug + 'static {
    type Device: Device;
    type Storage: Storage;

    // Allocation

    fn zeros(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    fn full(shape: &Shape, val: f64, dtype: DType, device: &Self::Device)
        -> Result<Self::Storage>;

    /// Build storage from host f64 data, converting to `dtype`.
    fn from_f64_slice(data: &[f64], dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Uniform random values in [0, 1).
    fn rand_uniform(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    // Element-wise

    /// result[i] = op(lhs[i], rhs[i]) with NumPy-style broadcasting; the
    /// layouts carry strides for non-contiguous and broadcast inputs.
    fn binary_op(
        op: BinaryOp,
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<Self::Storage>;

    fn unary_op(op: UnaryOp, input: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    /// result[i] = input[i] * mul + add (scalar affine).
    fn scale_shift(
        input: &Self::Storage,
        layout: &Layout,
        mul: f64,
        add: f64,
    ) -> Result<Self::Storage>;

    /// Fused result = a⊙b + c⊙d. One pass, no intermediate buffer; the
    /// LSTM cell-state update is the main consumer.
    #[allow(clippy::too_many_arguments)]
    fn mul_mul_add(
        a: &Self::Storage,
        a_layout: &Layout,
        b: &Self::Storage,
        b_layout: &Layout,
        c: &Self::Storage,
        c_layout: &Layout,
        d: &Self::Storage,
        d_layout: &Layout,
    ) -> Result<Self::Storage>;

    // Reductions

    /// Reduce along `dims` (empty = reduce everything).
    fn reduce_op(
        op: ReduceOp,
        input: &Self::Storage,
        layout: &Layout,
        dims: &[usize],
        keep_dim: bool,
    ) -> Result<Self::Storage>;

    // Linear algebra

    /// C = A @ B; batched when rank > 2 (leading dims must match).
    fn matmul(
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<Self::Storage>;

    // Data movement

    fn to_contiguous(input: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    /// Copy to host as f64 (the device→host inspection boundary).
    fn to_f64_vec(input: &Self::Storage, layout: &Layout) -> Result<Vec<f64>>;

    // Indexing

    /// output[..., i, ...] = input[..., index[..., i, ...], ...] at `dim`.
    /// `index` and `input` have equal rank; output takes `index`'s shape.
    fn gather(
        input: &Self::Storage,
        input_layout: &Layout,
        index: &Self::Storage,
        index_layout: &Layout,
        dim: usize,
    ) -> Result<Self::Storage>;

    /// Inverse of gather: a copy of `base` with `src`'s elements written
    /// (or, with `accumulate`, added) at the positions `index` names along
    /// `dim`.
    #[allow(clippy::too_many_arguments)]
    fn scatter(
        base: &Self::Storage,
        base_layout: &Layout,
        index: &Self::Storage,
        index_layout: &Layout,
        src: &Self::Storage,
        src_layout: &Layout,
        dim: usize,
        accumulate: bool,
    ) -> Result<Self::Storage>;

    /// A copy of `base` with a constant written at the indexed positions.
    fn scatter_fill(
        base: &Self::Storage,
        base_layout: &Layout,
        index: &Self::Storage,
        index_layout: &Layout,
        value: f64,
        dim: usize,
    ) -> Result<Self::Storage>;

    /// Pick whole slices along `dim`: output slice i = input slice
    /// indices[i]. Indices arrive host-side (routing decisions are made on
    /// the host).
    fn index_select(
        input: &Self::Storage,
        layout: &Layout,
        indices: &[usize],
        dim: usize,
    ) -> Result<Self::Storage>;

    /// A copy of `base` with src slice i written (or added) at slice
    /// indices[i] along `dim`.
    fn index_update(
        base: &Self::Storage,
        base_layout: &Layout,
        indices: &[usize],
        src: &Self::Storage,
        src_layout: &Layout,
        dim: usize,
        accumulate: bool,
    ) -> Result<Self::Storage>;

    /// Concatenate along `dim` into one contiguous storage. `out_shape` is
    /// pre-validated by the caller.
    fn cat(
        inputs: &[(&Self::Storage, &Layout)],
        out_shape: &Shape,
        dim: usize,
    ) -> Result<Self::Storage>;

    // Conversion

    /// Cast to another dtype. Default goes through a host f64 round-trip;
    /// backends with native conversion kernels should override.
    fn cast(
        input: &Self::Storage,
        layout: &Layout,
        dtype: DType,
        device: &Self::Device,
    ) -> Result<Self::Storage> {
        let data = Self::to_f64_vec(input, layout)?;
        Self::from_f64_slice(&data, dtype, device)
    }

    /// Return a storage buffer to the device allocator for reuse. Called
    /// when a weight tensor releases the last reference to its buffer.
    /// Default: drop it.
    fn recycle(_storage: Self::Storage, _device: &Self::Device) {}
}
