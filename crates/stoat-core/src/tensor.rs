use std::sync::{Arc, RwLock};

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};
use crate::bail;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::op::{Op, TensorId};
use crate::shape::Shape;

// Tensor — a typed, strided view over backend-owned storage.
//
// The handle/data split matters here: `Tensor` is a thin Arc around
// `TensorInner`, so cloning is a refcount bump and views (transpose,
// narrow, reshape) are new handles onto the same storage. That shared
// storage is the engine's reference-counting model: the buffer is freed
// when the last view drops, and mutation through any alias is visible to
// every other alias — callers must not assume copy-on-write.
//
// Each forward op computes eagerly through the Backend and stamps its
// output with an `Op` recording the inputs, which is all backward() needs.

struct TensorInner<B: Backend> {
    id: TensorId,
    storage: Arc<RwLock<B::Storage>>,
    layout: Layout,
    dtype: DType,
    device: B::Device,
    /// How this tensor was produced; `Op::None` for leaves.
    op: Op<B>,
    /// Trainable leaves accumulate gradients during backward().
    is_variable: bool,
}

/// An n-dimensional array on a backend device, with eager execution and
/// recorded autograd lineage.
pub struct Tensor<B: Backend> {
    inner: Arc<TensorInner<B>>,
}

impl<B: Backend> Clone for Tensor<B> {
    fn clone(&self) -> Self {
        Tensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Tensor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(id={:?}, shape={}, dtype={}, device={:?})",
            self.inner.id,
            self.inner.layout.shape(),
            self.inner.dtype,
            self.inner.device,
        )
    }
}

impl<B: Backend> Tensor<B> {
    pub(crate) fn from_storage(
        storage: B::Storage,
        layout: Layout,
        dtype: DType,
        device: B::Device,
        op: Op<B>,
    ) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::new(RwLock::new(storage)),
                layout,
                dtype,
                device,
                op,
                is_variable: false,
            }),
        }
    }

    /// New handle sharing this tensor's storage under a different layout.
    fn view_with_layout(&self, layout: Layout, op: Op<B>) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::clone(&self.inner.storage),
                layout,
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
                op,
                is_variable: false,
            }),
        }
    }

    // Accessors

    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    pub fn shape(&self) -> &Shape {
        self.inner.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.inner.layout.dims()
    }

    pub fn rank(&self) -> usize {
        self.inner.layout.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.inner.layout.elem_count()
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn device(&self) -> &B::Device {
        &self.inner.device
    }

    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    pub fn is_contiguous(&self) -> bool {
        self.inner.layout.is_contiguous()
    }

    pub fn is_variable(&self) -> bool {
        self.inner.is_variable
    }

    pub fn op(&self) -> &Op<B> {
        &self.inner.op
    }

    fn read_storage(&self) -> Result<std::sync::RwLockReadGuard<'_, B::Storage>> {
        self.inner
            .storage
            .read()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    fn write_storage(&self) -> Result<std::sync::RwLockWriteGuard<'_, B::Storage>> {
        self.inner
            .storage
            .write()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    /// True when no other handle shares this tensor's storage.
    pub fn storage_unshared(&self) -> bool {
        Arc::strong_count(&self.inner.storage) == 1
    }

    /// Take the storage out of this tensor if it holds the last reference.
    /// Used by the weight lifecycle to hand buffers back to the allocator.
    pub(crate) fn try_take_storage(self) -> Option<B::Storage> {
        let inner = Arc::try_unwrap(self.inner).ok()?;
        let lock = Arc::try_unwrap(inner.storage).ok()?;
        lock.into_inner().ok()
    }

    // Creation

    pub fn zeros(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let layout = Layout::contiguous(shape.clone());
        let storage = B::zeros(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            layout,
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    pub fn ones(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        Self::full(shape, 1.0, dtype, device)
    }

    pub fn full(
        shape: impl Into<Shape>,
        val: f64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        let layout = Layout::contiguous(shape.clone());
        let storage = B::full(&shape, val, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            layout,
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    pub fn from_f64_slice(
        data: &[f64],
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        let layout = Layout::contiguous(shape);
        let storage = B::from_f64_slice(data, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            layout,
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Uniform random values in [0, 1).
    pub fn rand(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let layout = Layout::contiguous(shape.clone());
        let storage = B::rand_uniform(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            layout,
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    pub fn zeros_like(other: &Self) -> Result<Self> {
        Self::zeros(other.shape().clone(), other.dtype(), other.device())
    }

    /// 1-D index tensor from host indices.
    pub fn from_indices(indices: &[usize], device: &B::Device) -> Result<Self> {
        let data: Vec<f64> = indices.iter().map(|&i| i as f64).collect();
        Self::from_f64_slice(&data, indices.len(), DType::I64, device)
    }

    // Variable / lineage control

    /// Mark this tensor as a trainable leaf; gradients accumulate for it
    /// during backward(). Shares storage with the original.
    pub fn set_variable(self) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: self.inner.id,
                storage: Arc::clone(&self.inner.storage),
                layout: self.inner.layout.clone(),
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
                op: self.inner.op.clone(),
                is_variable: true,
            }),
        }
    }

    /// Cut the autograd lineage: same storage, fresh id, no recorded op.
    pub fn detach(&self) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::clone(&self.inner.storage),
                layout: self.inner.layout.clone(),
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
                op: Op::None,
                is_variable: false,
            }),
        }
    }

    // Shape manipulation (views — no data copy unless noted)

    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self> {
        let layout = self.inner.layout.transpose(dim0, dim1)?;
        let op = Op::Transpose {
            input: self.clone(),
            dim0,
            dim1,
        };
        Ok(self.view_with_layout(layout, op))
    }

    /// 2-D transpose shorthand.
    pub fn t(&self) -> Result<Self> {
        if self.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank(),
            });
        }
        self.transpose(0, 1)
    }

    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        let layout = self.inner.layout.narrow(dim, start, len)?;
        let op = Op::Narrow {
            input: self.clone(),
            dim,
            start,
            len,
        };
        Ok(self.view_with_layout(layout, op))
    }

    /// Same elements under a new shape. Copies only when the source view is
    /// not contiguous.
    pub fn reshape(&self, new_shape: impl Into<Shape>) -> Result<Self> {
        let new_shape = new_shape.into();
        if self.elem_count() != new_shape.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src: self.elem_count(),
                dst: new_shape.elem_count(),
                dst_shape: new_shape,
            });
        }
        let base = if self.is_contiguous() {
            self.clone()
        } else {
            self.contiguous()?
        };
        let src_shape = base.shape().clone();
        let layout = Layout::contiguous(new_shape);
        let op = Op::Reshape {
            input: base.clone(),
            src_shape,
        };
        Ok(base.view_with_layout(layout, op))
    }

    /// Insert a size-1 dim at `dim`.
    pub fn unsqueeze(&self, dim: usize) -> Result<Self> {
        let rank = self.rank();
        if dim > rank {
            return Err(Error::DimOutOfRange {
                dim,
                rank: rank + 1,
            });
        }
        let mut dims = self.dims().to_vec();
        let mut strides = self.layout().strides().to_vec();
        let stride = if dim < rank { strides[dim] } else { 1 };
        dims.insert(dim, 1);
        strides.insert(dim, stride);
        let layout = Layout::with_strides(Shape::new(dims), strides, self.layout().offset());
        let op = Op::Reshape {
            input: self.clone(),
            src_shape: self.shape().clone(),
        };
        Ok(self.view_with_layout(layout, op))
    }

    /// Materialize into dense row-major storage (clone if already dense).
    pub fn contiguous(&self) -> Result<Self> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        let storage = self.read_storage()?;
        let dense = B::to_contiguous(&storage, &self.inner.layout)?;
        drop(storage);
        let layout = Layout::contiguous(self.shape().clone());
        Ok(Self::from_storage(
            dense,
            layout,
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Contiguous {
                input: self.clone(),
            },
        ))
    }

    // Element-wise arithmetic

    pub fn add(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Add)
    }

    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Sub)
    }

    /// Element-wise (Hadamard) product.
    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Mul)
    }

    pub fn div(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Div)
    }

    fn binary_op(&self, rhs: &Self, op: BinaryOp) -> Result<Self> {
        if self.dtype() != rhs.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: rhs.dtype(),
            });
        }
        let out_shape = self.shape().broadcast_with(rhs.shape())?;
        let lhs_s = self.read_storage()?;
        let rhs_s = rhs.read_storage()?;
        let out = B::binary_op(op, &lhs_s, &self.inner.layout, &rhs_s, &rhs.inner.layout)?;
        drop(lhs_s);
        drop(rhs_s);
        Ok(Self::from_storage(
            out,
            Layout::contiguous(out_shape),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Binary {
                lhs: self.clone(),
                rhs: rhs.clone(),
                op,
            },
        ))
    }

    pub fn neg(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Neg)
    }

    pub fn exp(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Exp)
    }

    pub fn log(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Log)
    }

    pub fn sqrt(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Sqrt)
    }

    /// 1/sqrt(x).
    pub fn rsqrt(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Rsqrt)
    }

    pub fn square(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Square)
    }

    pub fn relu(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Relu)
    }

    pub fn sigmoid(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Sigmoid)
    }

    pub fn tanh(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Tanh)
    }

    /// x * sigmoid(x).
    pub fn silu(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Silu)
    }

    fn unary_op(&self, op: UnaryOp) -> Result<Self> {
        let storage = self.read_storage()?;
        let out = B::unary_op(op, &storage, &self.inner.layout)?;
        drop(storage);
        Ok(Self::from_storage(
            out,
            Layout::contiguous(self.shape().clone()),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Unary {
                input: self.clone(),
                op,
            },
        ))
    }

    /// Scalar affine: self * mul + add.
    pub fn scale_shift(&self, mul: f64, add: f64) -> Result<Self> {
        let storage = self.read_storage()?;
        let out = B::scale_shift(&storage, &self.inner.layout, mul, add)?;
        drop(storage);
        Ok(Self::from_storage(
            out,
            Layout::contiguous(self.shape().clone()),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::ScaleShift {
                input: self.clone(),
                mul,
            },
        ))
    }

    /// scalar − self.
    pub fn rsub_scalar(&self, scalar: f64) -> Result<Self> {
        self.scale_shift(-1.0, scalar)
    }

    /// Fused self⊙b + c⊙d. All four operands must be the same size; the
    /// single-pass kernel skips the two intermediate products.
    pub fn mul_mul_add(&self, b: &Self, c: &Self, d: &Self) -> Result<Self> {
        for other in [b, c, d] {
            if other.shape() != self.shape() {
                return Err(Error::ShapeMismatch {
                    expected: self.shape().clone(),
                    got: other.shape().clone(),
                });
            }
        }
        let (a_s, b_s, c_s, d_s) = (
            self.read_storage()?,
            b.read_storage()?,
            c.read_storage()?,
            d.read_storage()?,
        );
        let out = B::mul_mul_add(
            &a_s,
            &self.inner.layout,
            &b_s,
            &b.inner.layout,
            &c_s,
            &c.inner.layout,
            &d_s,
            &d.inner.layout,
        )?;
        drop((a_s, b_s, c_s, d_s));
        Ok(Self::from_storage(
            out,
            Layout::contiguous(self.shape().clone()),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::MulMulAdd {
                a: self.clone(),
                b: b.clone(),
                c: c.clone(),
                d: d.clone(),
            },
        ))
    }

    // Reductions

    pub fn sum(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Sum, &[dim], keep_dim)
    }

    pub fn sum_all(&self) -> Result<Self> {
        self.reduce_op(ReduceOp::Sum, &[], false)
    }

    pub fn mean(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Mean, &[dim], keep_dim)
    }

    pub fn mean_all(&self) -> Result<Self> {
        self.reduce_op(ReduceOp::Mean, &[], false)
    }

    pub fn max(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Max, &[dim], keep_dim)
    }

    /// Index of the per-slice maximum; I64 output, non-differentiable.
    pub fn argmax(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::ArgMax, &[dim], keep_dim)
    }

    fn reduce_op(&self, op: ReduceOp, dims: &[usize], keep_dim: bool) -> Result<Self> {
        for &d in dims {
            if d >= self.rank() {
                return Err(Error::DimOutOfRange {
                    dim: d,
                    rank: self.rank(),
                });
            }
        }
        let storage = self.read_storage()?;
        let out = B::reduce_op(op, &storage, &self.inner.layout, dims, keep_dim)?;
        drop(storage);

        let out_shape = if dims.is_empty() {
            Shape::from(())
        } else if keep_dim {
            let mut d = self.dims().to_vec();
            for &i in dims {
                d[i] = 1;
            }
            Shape::new(d)
        } else {
            let d: Vec<usize> = self
                .dims()
                .iter()
                .enumerate()
                .filter(|(i, _)| !dims.contains(i))
                .map(|(_, &s)| s)
                .collect();
            Shape::new(d)
        };
        let out_dtype = match op {
            ReduceOp::ArgMax => DType::I64,
            _ => self.inner.dtype,
        };
        Ok(Self::from_storage(
            out,
            Layout::contiguous(out_shape),
            out_dtype,
            self.inner.device.clone(),
            Op::Reduce {
                input: self.clone(),
                op,
                dims: dims.to_vec(),
                keep_dim,
            },
        ))
    }

    // Linear algebra

    /// Matrix product; batched when rank > 2. [m,k] @ [k,n] → [m,n].
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        let l = self.dims();
        let r = rhs.dims();
        if l.len() < 2 || r.len() != l.len() {
            return Err(Error::RankMismatch {
                expected: l.len().max(2),
                got: r.len(),
            });
        }
        let (m, k1) = (l[l.len() - 2], l[l.len() - 1]);
        let (k2, n) = (r[r.len() - 2], r[r.len() - 1]);
        if k1 != k2 || l[..l.len() - 2] != r[..r.len() - 2] {
            return Err(Error::MatmulShapeMismatch { m, k1, k2, n });
        }
        let lhs_s = self.read_storage()?;
        let rhs_s = rhs.read_storage()?;
        let out = B::matmul(&lhs_s, &self.inner.layout, &rhs_s, &rhs.inner.layout)?;
        drop(lhs_s);
        drop(rhs_s);
        let mut out_dims = l[..l.len() - 2].to_vec();
        out_dims.push(m);
        out_dims.push(n);
        Ok(Self::from_storage(
            out,
            Layout::contiguous(Shape::new(out_dims)),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Matmul {
                lhs: self.clone(),
                rhs: rhs.clone(),
            },
        ))
    }

    /// x·W + b with the bias broadcast over rows.
    ///
    /// self: [rows, in], `w`: [in, out], `b`: [out] or [1, out].
    pub fn affine(&self, w: &Self, b: &Self) -> Result<Self> {
        self.matmul(w)?.add(b)
    }

    // Composites (built from recorded primitives; gradients flow through)

    /// Numerically stable softmax along `dim` (max-shifted).
    pub fn softmax(&self, dim: usize) -> Result<Self> {
        let max = self.max(dim, true)?.detach();
        let shifted = self.sub(&max)?;
        let e = shifted.exp()?;
        let denom = e.sum(dim, true)?;
        e.div(&denom)
    }

    /// log(softmax(x)) computed without forming softmax.
    pub fn log_softmax(&self, dim: usize) -> Result<Self> {
        let max = self.max(dim, true)?.detach();
        let shifted = self.sub(&max)?;
        let lse = shifted.exp()?.sum(dim, true)?.log()?;
        shifted.sub(&lse)
    }

    /// Population variance along `dim`: mean((x − mean)²).
    pub fn var(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        let mu = self.mean(dim, true)?;
        self.sub(&mu)?.square()?.mean(dim, keep_dim)
    }

    // Concatenation / splitting

    /// Concatenate along `dim`. Inputs must agree on every other axis.
    pub fn cat(tensors: &[Self], dim: usize) -> Result<Self> {
        if tensors.is_empty() {
            bail!("cat: empty tensor list");
        }
        if tensors.len() == 1 {
            return Ok(tensors[0].clone());
        }
        let first = &tensors[0];
        let rank = first.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange { dim, rank });
        }
        for (i, t) in tensors.iter().enumerate().skip(1) {
            if t.rank() != rank {
                return Err(Error::RankMismatch {
                    expected: rank,
                    got: t.rank(),
                });
            }
            if t.dtype() != first.dtype() {
                return Err(Error::DTypeMismatch {
                    expected: first.dtype(),
                    got: t.dtype(),
                });
            }
            for d in 0..rank {
                if d != dim && t.dims()[d] != first.dims()[d] {
                    bail!(
                        "cat: input {i} has size {} on axis {d}, expected {}",
                        t.dims()[d],
                        first.dims()[d]
                    );
                }
            }
        }

        let sizes: Vec<usize> = tensors.iter().map(|t| t.dims()[dim]).collect();
        let mut out_dims = first.dims().to_vec();
        out_dims[dim] = sizes.iter().sum();
        let out_shape = Shape::new(out_dims);

        let guards: Vec<_> = tensors
            .iter()
            .map(|t| t.read_storage())
            .collect::<Result<_>>()?;
        let pairs: Vec<(&B::Storage, &Layout)> = tensors
            .iter()
            .enumerate()
            .map(|(i, t)| (&*guards[i], &t.inner.layout))
            .collect();
        let out = B::cat(&pairs, &out_shape, dim)?;
        drop(pairs);
        drop(guards);

        Ok(Self::from_storage(
            out,
            Layout::contiguous(out_shape),
            first.dtype(),
            first.device().clone(),
            Op::Cat {
                inputs: tensors.to_vec(),
                dim,
                sizes,
            },
        ))
    }

    /// Partition the column axis of a 2-D tensor into views of the given
    /// widths. The widths must sum to the column count exactly.
    pub fn split_cols(&self, sizes: &[usize]) -> Result<Vec<Self>> {
        if self.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank(),
            });
        }
        let cols = self.dims()[1];
        let total: usize = sizes.iter().sum();
        if total != cols {
            bail!("split_cols: widths {sizes:?} sum to {total}, tensor has {cols} columns");
        }
        let mut out = Vec::with_capacity(sizes.len());
        let mut start = 0;
        for &w in sizes {
            out.push(self.narrow(1, start, w)?);
            start += w;
        }
        Ok(out)
    }

    /// Split the columns of a 2-D tensor into `n` equal parts.
    pub fn split_cols_even(&self, n: usize) -> Result<Vec<Self>> {
        if self.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank(),
            });
        }
        let cols = self.dims()[1];
        if n == 0 || !cols.is_multiple_of(n) {
            bail!("split_cols_even: {cols} columns do not split into {n} equal parts");
        }
        self.split_cols(&vec![cols / n; n])
    }

    // Top-k

    /// The `k` largest values along `dim` and their indices.
    ///
    /// Values are detached; the index tensor is I64 with the same shape as
    /// self except `dim` has size `k`. Ties resolve to the first-seen index
    /// (stable sort), which keeps expert routing deterministic.
    pub fn topk(&self, k: usize, dim: usize) -> Result<(Self, Self)> {
        if dim >= self.rank() {
            return Err(Error::DimOutOfRange {
                dim,
                rank: self.rank(),
            });
        }
        let dims = self.dims().to_vec();
        let dim_size = dims[dim];
        if k == 0 || k > dim_size {
            bail!("topk: k={k} out of range for axis of size {dim_size}");
        }
        let data = self.contiguous()?.to_f64_vec()?;
        let inner: usize = dims[dim + 1..].iter().product();
        let outer: usize = dims[..dim].iter().product();

        let mut out_dims = dims.clone();
        out_dims[dim] = k;
        let out_len: usize = out_dims.iter().product();
        let mut values = vec![0.0f64; out_len];
        let mut indices = vec![0.0f64; out_len];

        for o in 0..outer {
            for i in 0..inner {
                let mut slice: Vec<(f64, usize)> = (0..dim_size)
                    .map(|d| (data[(o * dim_size + d) * inner + i], d))
                    .collect();
                // Stable: equal values keep ascending index order.
                slice.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
                for (j, &(v, idx)) in slice.iter().take(k).enumerate() {
                    let flat = (o * k + j) * inner + i;
                    values[flat] = v;
                    indices[flat] = idx as f64;
                }
            }
        }

        let shape = Shape::new(out_dims);
        let vals = Self::from_f64_slice(&values, shape.clone(), self.dtype(), self.device())?;
        let idxs = Self::from_f64_slice(&indices, shape, DType::I64, self.device())?;
        Ok((vals, idxs))
    }

    // Indexing ops. One shared validation contract: equal ranks, and the
    // two shape-checked operands must agree on every axis except `dim`.

    fn check_index_shapes(op: &'static str, a: &Shape, b: &Shape, dim: usize) -> Result<()> {
        if a.rank() != b.rank() {
            return Err(Error::IndexRankMismatch {
                op,
                lhs: a.rank(),
                rhs: b.rank(),
            });
        }
        if dim >= a.rank() {
            return Err(Error::DimOutOfRange {
                dim,
                rank: a.rank(),
            });
        }
        for axis in 0..a.rank() {
            if axis == dim {
                continue;
            }
            if a.dims()[axis] != b.dims()[axis] {
                return Err(Error::IndexSizeMismatch {
                    op,
                    axis,
                    dim,
                    expected: a.dims()[axis],
                    got: b.dims()[axis],
                });
            }
        }
        Ok(())
    }

    /// output[p] = self[p with dim replaced by index[p]].
    pub fn gather(&self, dim: usize, index: &Self) -> Result<Self> {
        Self::check_index_shapes("gather", self.shape(), index.shape(), dim)?;
        let input_s = self.read_storage()?;
        let index_s = index.read_storage()?;
        let out = B::gather(
            &input_s,
            &self.inner.layout,
            &index_s,
            &index.inner.layout,
            dim,
        )?;
        drop(input_s);
        drop(index_s);
        Ok(Self::from_storage(
            out,
            Layout::contiguous(index.shape().clone()),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Gather {
                input: self.clone(),
                index: index.clone(),
                dim,
            },
        ))
    }

    /// A copy of self with src[p] written at [p with dim := index[p]].
    /// Later writes to the same position win.
    pub fn scatter(&self, dim: usize, index: &Self, src: &Self) -> Result<Self> {
        self.scatter_impl(dim, index, src, false)
    }

    /// Like [`scatter`](Self::scatter) but accumulating: repeated indices
    /// add their contributions instead of overwriting.
    pub fn scatter_add(&self, dim: usize, index: &Self, src: &Self) -> Result<Self> {
        self.scatter_impl(dim, index, src, true)
    }

    fn scatter_impl(&self, dim: usize, index: &Self, src: &Self, accumulate: bool) -> Result<Self> {
        let op_name = if accumulate { "scatter_add" } else { "scatter" };
        Self::check_index_shapes(op_name, self.shape(), index.shape(), dim)?;
        if index.shape() != src.shape() {
            return Err(Error::ShapeMismatch {
                expected: index.shape().clone(),
                got: src.shape().clone(),
            });
        }
        let base_s = self.read_storage()?;
        let index_s = index.read_storage()?;
        let src_s = src.read_storage()?;
        let out = B::scatter(
            &base_s,
            &self.inner.layout,
            &index_s,
            &index.inner.layout,
            &src_s,
            &src.inner.layout,
            dim,
            accumulate,
        )?;
        drop((base_s, index_s, src_s));
        Ok(Self::from_storage(
            out,
            Layout::contiguous(self.shape().clone()),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Scatter {
                base: self.clone(),
                index: index.clone(),
                src: src.clone(),
                dim,
                accumulate,
            },
        ))
    }

    /// A copy of self with `value` written at every indexed position.
    /// Non-differentiable (used for mask construction).
    pub fn scatter_fill(&self, dim: usize, index: &Self, value: f64) -> Result<Self> {
        Self::check_index_shapes("scatter_fill", self.shape(), index.shape(), dim)?;
        let base_s = self.read_storage()?;
        let index_s = index.read_storage()?;
        let out = B::scatter_fill(
            &base_s,
            &self.inner.layout,
            &index_s,
            &index.inner.layout,
            value,
            dim,
        )?;
        drop((base_s, index_s));
        Ok(Self::from_storage(
            out,
            Layout::contiguous(self.shape().clone()),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::None,
        ))
    }

    /// Pick whole slices along `dim`: output slice i = self slice
    /// indices[i].
    pub fn index_select(&self, dim: usize, indices: &[usize]) -> Result<Self> {
        if dim >= self.rank() {
            return Err(Error::DimOutOfRange {
                dim,
                rank: self.rank(),
            });
        }
        let dim_size = self.dims()[dim];
        for &i in indices {
            if i >= dim_size {
                return Err(Error::IndexSizeMismatch {
                    op: "index_select",
                    axis: dim,
                    dim,
                    expected: dim_size,
                    got: i,
                });
            }
        }
        let storage = self.read_storage()?;
        let out = B::index_select(&storage, &self.inner.layout, indices, dim)?;
        drop(storage);
        let mut out_dims = self.dims().to_vec();
        out_dims[dim] = indices.len();
        Ok(Self::from_storage(
            out,
            Layout::contiguous(Shape::new(out_dims)),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::IndexSelect {
                input: self.clone(),
                indices: indices.to_vec(),
                dim,
            },
        ))
    }

    /// A copy of self with src slice i written over slice indices[i].
    pub fn index_update(&self, dim: usize, indices: &[usize], src: &Self) -> Result<Self> {
        self.index_update_impl(dim, indices, src, false)
    }

    /// A copy of self with src slice i added onto slice indices[i];
    /// repeated indices accumulate.
    pub fn index_add(&self, dim: usize, indices: &[usize], src: &Self) -> Result<Self> {
        self.index_update_impl(dim, indices, src, true)
    }

    fn index_update_impl(
        &self,
        dim: usize,
        indices: &[usize],
        src: &Self,
        accumulate: bool,
    ) -> Result<Self> {
        let op_name = if accumulate {
            "index_add"
        } else {
            "index_update"
        };
        Self::check_index_shapes(op_name, self.shape(), src.shape(), dim)?;
        if src.dims()[dim] != indices.len() {
            return Err(Error::IndexSizeMismatch {
                op: op_name,
                axis: dim,
                dim,
                expected: indices.len(),
                got: src.dims()[dim],
            });
        }
        let dim_size = self.dims()[dim];
        for &i in indices {
            if i >= dim_size {
                return Err(Error::IndexSizeMismatch {
                    op: op_name,
                    axis: dim,
                    dim,
                    expected: dim_size,
                    got: i,
                });
            }
        }
        let base_s = self.read_storage()?;
        let src_s = src.read_storage()?;
        let out = B::index_update(
            &base_s,
            &self.inner.layout,
            indices,
            &src_s,
            &src.inner.layout,
            dim,
            accumulate,
        )?;
        drop((base_s, src_s));
        Ok(Self::from_storage(
            out,
            Layout::contiguous(self.shape().clone()),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::IndexUpdate {
                base: self.clone(),
                indices: indices.to_vec(),
                src: src.clone(),
                dim,
                accumulate,
            },
        ))
    }

    // Host transfer / inspection

    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let storage = self.read_storage()?;
        B::to_f64_vec(&storage, &self.inner.layout)
    }

    /// The single element of a scalar (or one-element) tensor.
    pub fn scalar_value(&self) -> Result<f64> {
        if self.elem_count() != 1 {
            bail!(
                "scalar_value: tensor has shape {}, expected one element",
                self.shape()
            );
        }
        Ok(self.to_f64_vec()?[0])
    }

    /// Read one element by multi-index.
    pub fn value_at(&self, index: &[usize]) -> Result<f64> {
        if index.len() != self.rank() {
            return Err(Error::RankMismatch {
                expected: self.rank(),
                got: index.len(),
            });
        }
        for (d, (&i, &s)) in index.iter().zip(self.dims().iter()).enumerate() {
            if i >= s {
                return Err(Error::DimOutOfRange {
                    dim: d,
                    rank: self.rank(),
                });
            }
        }
        // A narrow chain would also work; a direct strided read is cheaper.
        let flat_logical: usize = {
            let strides = self.shape().stride_contiguous();
            index.iter().zip(strides.iter()).map(|(&i, &s)| i * s).sum()
        };
        let data = self.to_f64_vec()?;
        Ok(data[flat_logical])
    }

    /// Overwrite this tensor's storage with new host data (same element
    /// count and dtype). Every view sharing the storage sees the update —
    /// this is how optimizer steps reach the layers that hold parameters.
    pub fn update_data_inplace(&self, new_data: &[f64]) -> Result<()> {
        if new_data.len() != self.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: self.shape().clone(),
                expected: self.elem_count(),
                got: new_data.len(),
            });
        }
        // A narrowed/transposed view covers only part of the buffer;
        // swapping the storage out from under the other views would
        // corrupt them.
        if !self.is_contiguous() {
            bail!("update_data_inplace requires a contiguous tensor");
        }
        let fresh = B::from_f64_slice(new_data, self.dtype(), self.device())?;
        let mut guard = self.write_storage()?;
        *guard = fresh;
        Ok(())
    }
}
