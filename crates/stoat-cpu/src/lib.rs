//! # stoat-cpu
//!
//! The CPU backend: typed host storage, a caching buffer pool (the device
//! allocator), and every operator kernel the core's [`Backend`] trait asks
//! for. Fast paths exist for contiguous f32/f64 data; everything else goes
//! through a layout-aware f64 path, which keeps broadcasting and strided
//! views correct for all dtypes at the cost of a conversion.

use rayon::prelude::*;
use std::sync::Arc;

use stoat_core::backend::{Backend, BinaryOp, Device, ReduceOp, Storage, UnaryOp};
use stoat_core::{bail, DType, Error, Layout, Result, Shape};

pub mod pool;
pub use pool::{CpuMemPool, PoolStats};

// Device

/// A logical CPU device: an ordinal plus its buffer pool.
#[derive(Clone)]
pub struct CpuDevice {
    ordinal: usize,
    pool: Arc<CpuMemPool>,
}

impl CpuDevice {
    pub fn new(ordinal: usize) -> Self {
        CpuDevice {
            ordinal,
            pool: Arc::new(CpuMemPool::new()),
        }
    }

    pub fn pool(&self) -> &CpuMemPool {
        &self.pool
    }
}

impl Default for CpuDevice {
    fn default() -> Self {
        CpuDevice::new(0)
    }
}

impl std::fmt::Debug for CpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CpuDevice(cpu:{})", self.ordinal)
    }
}

impl Device for CpuDevice {
    fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn name(&self) -> String {
        format!("cpu:{}", self.ordinal)
    }
}

// Storage

/// Host tensor storage: one typed vec per dtype.
#[derive(Clone, Debug)]
pub enum CpuStorage {
    F16(Vec<half::f16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    U8(Vec<u8>),
    I64(Vec<i64>),
}

impl Storage for CpuStorage {
    fn dtype(&self) -> DType {
        match self {
            CpuStorage::F16(_) => DType::F16,
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F64(_) => DType::F64,
            CpuStorage::U8(_) => DType::U8,
            CpuStorage::I64(_) => DType::I64,
        }
    }

    fn len(&self) -> usize {
        match self {
            CpuStorage::F16(v) => v.len(),
            CpuStorage::F32(v) => v.len(),
            CpuStorage::F64(v) => v.len(),
            CpuStorage::U8(v) => v.len(),
            CpuStorage::I64(v) => v.len(),
        }
    }
}

// Host-side helpers

/// Read storage into f64, walking the layout so views and broadcasts come
/// out in logical row-major order.
fn read_f64(storage: &CpuStorage, layout: &Layout) -> Vec<f64> {
    macro_rules! walk {
        ($data:expr, $conv:expr) => {{
            let data = $data;
            if layout.is_contiguous() && layout.elem_count() == data.len() {
                data.iter().map($conv).collect()
            } else {
                layout.positions().map(|i| $conv(&data[i])).collect()
            }
        }};
    }
    match storage {
        CpuStorage::F16(v) => walk!(v, |x: &half::f16| x.to_f32() as f64),
        CpuStorage::F32(v) => walk!(v, |x: &f32| *x as f64),
        CpuStorage::F64(v) => walk!(v, |x: &f64| *x),
        CpuStorage::U8(v) => walk!(v, |x: &u8| *x as f64),
        CpuStorage::I64(v) => walk!(v, |x: &i64| *x as f64),
    }
}

/// Pack host f64 data into storage of the requested dtype.
fn pack(data: &[f64], dtype: DType) -> CpuStorage {
    match dtype {
        DType::F16 => CpuStorage::F16(data.iter().map(|&v| half::f16::from_f64(v)).collect()),
        DType::F32 => CpuStorage::F32(data.iter().map(|&v| v as f32).collect()),
        DType::F64 => CpuStorage::F64(data.to_vec()),
        DType::U8 => CpuStorage::U8(data.iter().map(|&v| v as u8).collect()),
        DType::I64 => CpuStorage::I64(data.iter().map(|&v| v as i64).collect()),
    }
}

/// Read storage expanded (broadcast) up to `out_shape`.
fn read_broadcast(storage: &CpuStorage, layout: &Layout, out_shape: &Shape) -> Vec<f64> {
    let logical = read_f64(storage, layout);
    if layout.shape() == out_shape {
        return logical;
    }
    let strides = layout.shape().broadcast_strides(out_shape);
    let bl = Layout::with_strides(out_shape.clone(), strides, 0);
    bl.positions().map(|i| logical[i]).collect()
}

fn apply_unary(op: UnaryOp, x: f64) -> f64 {
    match op {
        UnaryOp::Neg => -x,
        UnaryOp::Exp => x.exp(),
        UnaryOp::Log => x.ln(),
        UnaryOp::Sqrt => x.sqrt(),
        UnaryOp::Rsqrt => 1.0 / x.sqrt(),
        UnaryOp::Square => x * x,
        UnaryOp::Relu => x.max(0.0),
        UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        UnaryOp::Tanh => x.tanh(),
        UnaryOp::Silu => x / (1.0 + (-x).exp()),
    }
}

fn apply_binary(op: BinaryOp, a: f64, b: f64) -> f64 {
    match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
    }
}

/// Decompose the reduce geometry of `dims` into (outer, dim_size, inner)
/// for a single reduced axis.
fn slice_geometry(dims: &[usize], dim: usize) -> (usize, usize, usize) {
    let outer: usize = dims[..dim].iter().product();
    let inner: usize = dims[dim + 1..].iter().product();
    (outer, dims[dim], inner)
}

// Backend

/// The CPU compute backend.
#[derive(Clone, Debug)]
pub struct CpuBackend;

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Storage = CpuStorage;

    fn zeros(shape: &Shape, dtype: DType, device: &CpuDevice) -> Result<CpuStorage> {
        let n = shape.elem_count();
        Ok(match dtype {
            DType::F16 => {
                let mut buf = device.pool.alloc_f16(n);
                buf.resize(n, half::f16::from_f64(0.0));
                CpuStorage::F16(buf)
            }
            DType::F32 => {
                let mut buf = device.pool.alloc_f32(n);
                buf.resize(n, 0.0);
                CpuStorage::F32(buf)
            }
            DType::F64 => {
                let mut buf = device.pool.alloc_f64(n);
                buf.resize(n, 0.0);
                CpuStorage::F64(buf)
            }
            DType::U8 => {
                let mut buf = device.pool.alloc_u8(n);
                buf.resize(n, 0);
                CpuStorage::U8(buf)
            }
            DType::I64 => {
                let mut buf = device.pool.alloc_i64(n);
                buf.resize(n, 0);
                CpuStorage::I64(buf)
            }
        })
    }

    fn full(shape: &Shape, val: f64, dtype: DType, device: &CpuDevice) -> Result<CpuStorage> {
        let n = shape.elem_count();
        Ok(match dtype {
            DType::F16 => {
                let mut buf = device.pool.alloc_f16(n);
                buf.resize(n, half::f16::from_f64(val));
                CpuStorage::F16(buf)
            }
            DType::F32 => {
                let mut buf = device.pool.alloc_f32(n);
                buf.resize(n, val as f32);
                CpuStorage::F32(buf)
            }
            DType::F64 => {
                let mut buf = device.pool.alloc_f64(n);
                buf.resize(n, val);
                CpuStorage::F64(buf)
            }
            DType::U8 => {
                let mut buf = device.pool.alloc_u8(n);
                buf.resize(n, val as u8);
                CpuStorage::U8(buf)
            }
            DType::I64 => {
                let mut buf = device.pool.alloc_i64(n);
                buf.resize(n, val as i64);
                CpuStorage::I64(buf)
            }
        })
    }

    fn from_f64_slice(data: &[f64], dtype: DType, device: &CpuDevice) -> Result<CpuStorage> {
        let n = data.len();
        Ok(match dtype {
            DType::F16 => {
                let mut buf = device.pool.alloc_f16(n);
                buf.extend(data.iter().map(|&v| half::f16::from_f64(v)));
                CpuStorage::F16(buf)
            }
            DType::F32 => {
                let mut buf = device.pool.alloc_f32(n);
                buf.extend(data.iter().map(|&v| v as f32));
                CpuStorage::F32(buf)
            }
            DType::F64 => {
                let mut buf = device.pool.alloc_f64(n);
                buf.extend_from_slice(data);
                CpuStorage::F64(buf)
            }
            DType::U8 => {
                let mut buf = device.pool.alloc_u8(n);
                buf.extend(data.iter().map(|&v| v as u8));
                CpuStorage::U8(buf)
            }
            DType::I64 => {
                let mut buf = device.pool.alloc_i64(n);
                buf.extend(data.iter().map(|&v| v as i64));
                CpuStorage::I64(buf)
            }
        })
    }

    fn rand_uniform(shape: &Shape, dtype: DType, device: &CpuDevice) -> Result<CpuStorage> {
        use rand::Rng;
        if !dtype.is_float() {
            bail!("rand_uniform: dtype {dtype} is not a float type");
        }
        let n = shape.elem_count();
        let mut rng = rand::thread_rng();
        let data: Vec<f64> = (0..n).map(|_| rng.gen::<f64>()).collect();
        Self::from_f64_slice(&data, dtype, device)
    }

    fn binary_op(
        op: BinaryOp,
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        // Fast path: identical contiguous shapes, native element types.
        if lhs_layout.shape() == rhs_layout.shape()
            && lhs_layout.is_contiguous()
            && rhs_layout.is_contiguous()
        {
            match (lhs, rhs) {
                (CpuStorage::F32(a), CpuStorage::F32(b)) => {
                    let out: Vec<f32> = a
                        .iter()
                        .zip(b.iter())
                        .map(|(&x, &y)| apply_binary(op, x as f64, y as f64) as f32)
                        .collect();
                    return Ok(CpuStorage::F32(out));
                }
                (CpuStorage::F64(a), CpuStorage::F64(b)) => {
                    let out: Vec<f64> = a
                        .iter()
                        .zip(b.iter())
                        .map(|(&x, &y)| apply_binary(op, x, y))
                        .collect();
                    return Ok(CpuStorage::F64(out));
                }
                _ => {}
            }
        }

        let out_shape = lhs_layout.shape().broadcast_with(rhs_layout.shape())?;
        let a = read_broadcast(lhs, lhs_layout, &out_shape);
        let b = read_broadcast(rhs, rhs_layout, &out_shape);
        let out: Vec<f64> = a
            .iter()
            .zip(b.iter())
            .map(|(&x, &y)| apply_binary(op, x, y))
            .collect();
        Ok(pack(&out, lhs.dtype()))
    }

    fn unary_op(op: UnaryOp, input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        if layout.is_contiguous() {
            if let CpuStorage::F32(v) = input {
                let out: Vec<f32> = v
                    .iter()
                    .map(|&x| apply_unary(op, x as f64) as f32)
                    .collect();
                return Ok(CpuStorage::F32(out));
            }
        }
        let data = read_f64(input, layout);
        let out: Vec<f64> = data.iter().map(|&x| apply_unary(op, x)).collect();
        Ok(pack(&out, input.dtype()))
    }

    fn scale_shift(input: &CpuStorage, layout: &Layout, mul: f64, add: f64) -> Result<CpuStorage> {
        let data = read_f64(input, layout);
        let out: Vec<f64> = data.iter().map(|&x| x * mul + add).collect();
        Ok(pack(&out, input.dtype()))
    }

    #[allow(clippy::too_many_arguments)]
    fn mul_mul_add(
        a: &CpuStorage,
        a_layout: &Layout,
        b: &CpuStorage,
        b_layout: &Layout,
        c: &CpuStorage,
        c_layout: &Layout,
        d: &CpuStorage,
        d_layout: &Layout,
    ) -> Result<CpuStorage> {
        let av = read_f64(a, a_layout);
        let bv = read_f64(b, b_layout);
        let cv = read_f64(c, c_layout);
        let dv = read_f64(d, d_layout);
        let out: Vec<f64> = (0..av.len())
            .map(|i| av[i] * bv[i] + cv[i] * dv[i])
            .collect();
        Ok(pack(&out, a.dtype()))
    }

    fn reduce_op(
        op: ReduceOp,
        input: &CpuStorage,
        layout: &Layout,
        dims: &[usize],
        _keep_dim: bool,
    ) -> Result<CpuStorage> {
        let data = read_f64(input, layout);

        if dims.is_empty() {
            // Whole-tensor reduction.
            let value = match op {
                ReduceOp::Sum => data.iter().sum(),
                ReduceOp::Mean => data.iter().sum::<f64>() / data.len().max(1) as f64,
                ReduceOp::Max => data.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                ReduceOp::ArgMax => {
                    bail!("argmax needs an explicit dimension")
                }
            };
            return Ok(pack(&[value], input.dtype()));
        }
        if dims.len() != 1 {
            bail!("reduce over multiple explicit dims is not supported");
        }

        let dim = dims[0];
        let (outer, dim_size, inner) = slice_geometry(layout.dims(), dim);
        let mut out = vec![0.0f64; outer * inner];
        for o in 0..outer {
            for i in 0..inner {
                let mut acc = match op {
                    ReduceOp::Sum | ReduceOp::Mean => 0.0,
                    ReduceOp::Max | ReduceOp::ArgMax => f64::NEG_INFINITY,
                };
                let mut arg = 0usize;
                for d in 0..dim_size {
                    let v = data[(o * dim_size + d) * inner + i];
                    match op {
                        ReduceOp::Sum | ReduceOp::Mean => acc += v,
                        ReduceOp::Max | ReduceOp::ArgMax => {
                            if v > acc {
                                acc = v;
                                arg = d;
                            }
                        }
                    }
                }
                out[o * inner + i] = match op {
                    ReduceOp::Sum | ReduceOp::Max => acc,
                    ReduceOp::Mean => acc / dim_size as f64,
                    ReduceOp::ArgMax => arg as f64,
                };
            }
        }

        let out_dtype = match op {
            ReduceOp::ArgMax => DType::I64,
            _ => input.dtype(),
        };
        Ok(pack(&out, out_dtype))
    }

    fn matmul(
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        let l_dims = lhs_layout.dims();
        let r_dims = rhs_layout.dims();
        let rank = l_dims.len();
        if rank < 2 || r_dims.len() != rank {
            return Err(Error::RankMismatch {
                expected: rank.max(2),
                got: r_dims.len(),
            });
        }
        let (m, k) = (l_dims[rank - 2], l_dims[rank - 1]);
        let n = r_dims[rank - 1];
        if r_dims[rank - 2] != k {
            return Err(Error::MatmulShapeMismatch {
                m,
                k1: k,
                k2: r_dims[rank - 2],
                n,
            });
        }
        let batch: usize = l_dims[..rank - 2].iter().product();

        let a = read_f64(lhs, lhs_layout);
        let b = read_f64(rhs, rhs_layout);
        let mut out = vec![0.0f64; batch * m * n];

        // One rayon task per output row; skip zero multipliers, which are
        // common in masked/sparse paths.
        out.par_chunks_mut(n).enumerate().for_each(|(row, chunk)| {
            let bi = row / m;
            let i = row % m;
            let a_off = (bi * m + i) * k;
            let b_off = bi * k * n;
            for kk in 0..k {
                let av = a[a_off + kk];
                if av == 0.0 {
                    continue;
                }
                let b_row = b_off + kk * n;
                for (j, slot) in chunk.iter_mut().enumerate() {
                    *slot += av * b[b_row + j];
                }
            }
        });

        Ok(pack(&out, lhs.dtype()))
    }

    fn to_contiguous(input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        // Native per-type copy: no f64 round-trip, bit-exact for every dtype.
        macro_rules! densify {
            ($v:expr, $variant:ident) => {{
                let v = $v;
                CpuStorage::$variant(layout.positions().map(|i| v[i]).collect())
            }};
        }
        Ok(match input {
            CpuStorage::F16(v) => densify!(v, F16),
            CpuStorage::F32(v) => densify!(v, F32),
            CpuStorage::F64(v) => densify!(v, F64),
            CpuStorage::U8(v) => densify!(v, U8),
            CpuStorage::I64(v) => densify!(v, I64),
        })
    }

    fn to_f64_vec(input: &CpuStorage, layout: &Layout) -> Result<Vec<f64>> {
        Ok(read_f64(input, layout))
    }

    fn gather(
        input: &CpuStorage,
        input_layout: &Layout,
        index: &CpuStorage,
        index_layout: &Layout,
        dim: usize,
    ) -> Result<CpuStorage> {
        let data = read_f64(input, input_layout);
        let idx = read_f64(index, index_layout);
        let in_dims = input_layout.dims();
        let in_strides = input_layout.shape().stride_contiguous();
        let idx_strides = index_layout.shape().stride_contiguous();
        let rank = in_dims.len();
        let dim_size = in_dims[dim];

        let mut out = vec![0.0f64; idx.len()];
        let mut coords = vec![0usize; rank];
        for (p, slot) in out.iter_mut().enumerate() {
            let mut rem = p;
            for d in 0..rank {
                coords[d] = if idx_strides[d] == 0 {
                    0
                } else {
                    rem / idx_strides[d]
                };
                if idx_strides[d] != 0 {
                    rem %= idx_strides[d];
                }
            }
            let target = idx[p] as usize;
            if target >= dim_size {
                bail!("gather: index {target} out of bounds for axis {dim} of size {dim_size}");
            }
            coords[dim] = target;
            let mut flat = 0;
            for d in 0..rank {
                flat += coords[d] * in_strides[d];
            }
            *slot = data[flat];
        }
        Ok(pack(&out, input.dtype()))
    }

    #[allow(clippy::too_many_arguments)]
    fn scatter(
        base: &CpuStorage,
        base_layout: &Layout,
        index: &CpuStorage,
        index_layout: &Layout,
        src: &CpuStorage,
        src_layout: &Layout,
        dim: usize,
        accumulate: bool,
    ) -> Result<CpuStorage> {
        let mut out = read_f64(base, base_layout);
        let idx = read_f64(index, index_layout);
        let values = read_f64(src, src_layout);
        let base_strides = base_layout.shape().stride_contiguous();
        let idx_strides = index_layout.shape().stride_contiguous();
        let rank = base_layout.rank();
        let dim_size = base_layout.dims()[dim];

        let mut coords = vec![0usize; rank];
        for p in 0..idx.len() {
            let mut rem = p;
            for d in 0..rank {
                coords[d] = if idx_strides[d] == 0 {
                    0
                } else {
                    rem / idx_strides[d]
                };
                if idx_strides[d] != 0 {
                    rem %= idx_strides[d];
                }
            }
            let target = idx[p] as usize;
            if target >= dim_size {
                bail!("scatter: index {target} out of bounds for axis {dim} of size {dim_size}");
            }
            coords[dim] = target;
            let mut flat = 0;
            for d in 0..rank {
                flat += coords[d] * base_strides[d];
            }
            if accumulate {
                out[flat] += values[p];
            } else {
                out[flat] = values[p];
            }
        }
        Ok(pack(&out, base.dtype()))
    }

    fn scatter_fill(
        base: &CpuStorage,
        base_layout: &Layout,
        index: &CpuStorage,
        index_layout: &Layout,
        value: f64,
        dim: usize,
    ) -> Result<CpuStorage> {
        let mut out = read_f64(base, base_layout);
        let idx = read_f64(index, index_layout);
        let base_strides = base_layout.shape().stride_contiguous();
        let idx_strides = index_layout.shape().stride_contiguous();
        let rank = base_layout.rank();
        let dim_size = base_layout.dims()[dim];

        let mut coords = vec![0usize; rank];
        for (p, &iv) in idx.iter().enumerate() {
            let mut rem = p;
            for d in 0..rank {
                coords[d] = if idx_strides[d] == 0 {
                    0
                } else {
                    rem / idx_strides[d]
                };
                if idx_strides[d] != 0 {
                    rem %= idx_strides[d];
                }
            }
            let target = iv as usize;
            if target >= dim_size {
                bail!(
                    "scatter_fill: index {target} out of bounds for axis {dim} of size {dim_size}"
                );
            }
            coords[dim] = target;
            let mut flat = 0;
            for d in 0..rank {
                flat += coords[d] * base_strides[d];
            }
            out[flat] = value;
        }
        Ok(pack(&out, base.dtype()))
    }

    fn index_select(
        input: &CpuStorage,
        layout: &Layout,
        indices: &[usize],
        dim: usize,
    ) -> Result<CpuStorage> {
        let data = read_f64(input, layout);
        let (outer, dim_size, inner) = slice_geometry(layout.dims(), dim);
        let mut out = vec![0.0f64; outer * indices.len() * inner];
        for o in 0..outer {
            for (j, &idx) in indices.iter().enumerate() {
                if idx >= dim_size {
                    bail!(
                        "index_select: index {idx} out of bounds for axis {dim} of size {dim_size}"
                    );
                }
                let src = (o * dim_size + idx) * inner;
                let dst = (o * indices.len() + j) * inner;
                out[dst..dst + inner].copy_from_slice(&data[src..src + inner]);
            }
        }
        Ok(pack(&out, input.dtype()))
    }

    fn index_update(
        base: &CpuStorage,
        base_layout: &Layout,
        indices: &[usize],
        src: &CpuStorage,
        src_layout: &Layout,
        dim: usize,
        accumulate: bool,
    ) -> Result<CpuStorage> {
        let mut out = read_f64(base, base_layout);
        let values = read_f64(src, src_layout);
        let (outer, dim_size, inner) = slice_geometry(base_layout.dims(), dim);
        for o in 0..outer {
            for (j, &idx) in indices.iter().enumerate() {
                if idx >= dim_size {
                    bail!(
                        "index_update: index {idx} out of bounds for axis {dim} of size {dim_size}"
                    );
                }
                let dst = (o * dim_size + idx) * inner;
                let srcp = (o * indices.len() + j) * inner;
                for i in 0..inner {
                    if accumulate {
                        out[dst + i] += values[srcp + i];
                    } else {
                        out[dst + i] = values[srcp + i];
                    }
                }
            }
        }
        Ok(pack(&out, base.dtype()))
    }

    fn cat(
        inputs: &[(&CpuStorage, &Layout)],
        out_shape: &Shape,
        dim: usize,
    ) -> Result<CpuStorage> {
        let out_dims = out_shape.dims();
        let inner: usize = out_dims[dim + 1..].iter().product();
        let out_dim = out_dims[dim];
        let outer: usize = out_dims[..dim].iter().product();

        let mut out = vec![0.0f64; out_shape.elem_count()];
        let mut offset = 0usize;
        for (storage, layout) in inputs {
            let data = read_f64(storage, layout);
            let sz = layout.dims()[dim];
            for o in 0..outer {
                let src = o * sz * inner;
                let dst = (o * out_dim + offset) * inner;
                out[dst..dst + sz * inner].copy_from_slice(&data[src..src + sz * inner]);
            }
            offset += sz;
        }
        let dtype = inputs
            .first()
            .map(|(s, _)| s.dtype())
            .ok_or_else(|| Error::msg("cat: no inputs"))?;
        Ok(pack(&out, dtype))
    }

    fn recycle(storage: CpuStorage, device: &CpuDevice) {
        device.pool.reclaim(storage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stoat_core::Tensor;

    type T = Tensor<CpuBackend>;

    fn dev() -> CpuDevice {
        CpuDevice::default()
    }

    #[test]
    fn add_with_broadcast() {
        let d = dev();
        let a = T::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), DType::F32, &d).unwrap();
        let b = T::from_f64_slice(&[10.0, 20.0, 30.0], 3, DType::F32, &d).unwrap();
        let c = a.add(&b).unwrap();
        assert_eq!(c.dims(), &[2, 3]);
        assert_eq!(c.to_f64_vec().unwrap(), vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn matmul_2d() {
        let d = dev();
        let a = T::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F64, &d).unwrap();
        let b = T::from_f64_slice(&[5.0, 6.0, 7.0, 8.0], (2, 2), DType::F64, &d).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.to_f64_vec().unwrap(), vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn matmul_transposed_view() {
        let d = dev();
        let a = T::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), DType::F64, &d).unwrap();
        let at = a.t().unwrap(); // [3, 2], non-contiguous
        let b = T::from_f64_slice(&[1.0, 0.0, 0.0, 1.0], (2, 2), DType::F64, &d).unwrap();
        let c = at.matmul(&b).unwrap();
        assert_eq!(c.to_f64_vec().unwrap(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn reduce_sum_and_mean() {
        let d = dev();
        let a = T::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), DType::F64, &d).unwrap();
        assert_eq!(a.sum(1, false).unwrap().to_f64_vec().unwrap(), vec![6.0, 15.0]);
        assert_eq!(a.mean(0, false).unwrap().to_f64_vec().unwrap(), vec![2.5, 3.5, 4.5]);
        assert_eq!(a.sum_all().unwrap().scalar_value().unwrap(), 21.0);
    }

    #[test]
    fn argmax_dtype_and_values() {
        let d = dev();
        let a = T::from_f64_slice(&[0.1, 0.9, 0.5, 0.2, 0.3, 0.8], (2, 3), DType::F32, &d).unwrap();
        let am = a.argmax(1, false).unwrap();
        assert_eq!(am.dtype(), DType::I64);
        assert_eq!(am.to_f64_vec().unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn gather_along_columns() {
        let d = dev();
        let a = T::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), DType::F64, &d).unwrap();
        let idx = T::from_f64_slice(&[2.0, 0.0], (2, 1), DType::I64, &d).unwrap();
        let g = a.gather(1, &idx).unwrap();
        assert_eq!(g.to_f64_vec().unwrap(), vec![3.0, 4.0]);
    }

    #[test]
    fn gather_rejects_out_of_bounds() {
        let d = dev();
        let a = T::from_f64_slice(&[1.0, 2.0], (1, 2), DType::F64, &d).unwrap();
        let idx = T::from_f64_slice(&[5.0], (1, 1), DType::I64, &d).unwrap();
        assert!(a.gather(1, &idx).is_err());
    }

    #[test]
    fn index_select_and_update_roundtrip() {
        let d = dev();
        let a = T::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (3, 2), DType::F64, &d).unwrap();
        let rows = a.index_select(0, &[2, 0]).unwrap();
        assert_eq!(rows.to_f64_vec().unwrap(), vec![5.0, 6.0, 1.0, 2.0]);

        let zeros = T::zeros((3, 2), DType::F64, &d).unwrap();
        let back = zeros.index_update(0, &[2, 0], &rows).unwrap();
        assert_eq!(back.to_f64_vec().unwrap(), vec![1.0, 2.0, 0.0, 0.0, 5.0, 6.0]);
    }

    #[test]
    fn unary_math() {
        let d = dev();
        let a = T::from_f64_slice(&[4.0, 9.0], 2, DType::F64, &d).unwrap();
        assert_eq!(a.sqrt().unwrap().to_f64_vec().unwrap(), vec![2.0, 3.0]);
        let r = a.rsqrt().unwrap().to_f64_vec().unwrap();
        assert!((r[0] - 0.5).abs() < 1e-12);
        assert!((r[1] - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn fused_mul_mul_add() {
        let d = dev();
        let a = T::from_f64_slice(&[1.0, 2.0], 2, DType::F64, &d).unwrap();
        let b = T::from_f64_slice(&[3.0, 4.0], 2, DType::F64, &d).unwrap();
        let c = T::from_f64_slice(&[5.0, 6.0], 2, DType::F64, &d).unwrap();
        let e = T::from_f64_slice(&[7.0, 8.0], 2, DType::F64, &d).unwrap();
        let out = a.mul_mul_add(&b, &c, &e).unwrap();
        assert_eq!(out.to_f64_vec().unwrap(), vec![38.0, 56.0]);
    }

    #[test]
    fn cat_and_split_cols() {
        let d = dev();
        let a = T::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F64, &d).unwrap();
        let b = T::from_f64_slice(&[5.0, 6.0], (2, 1), DType::F64, &d).unwrap();
        let c = T::cat(&[a, b], 1).unwrap();
        assert_eq!(c.dims(), &[2, 3]);
        assert_eq!(c.to_f64_vec().unwrap(), vec![1.0, 2.0, 5.0, 3.0, 4.0, 6.0]);

        let parts = c.split_cols(&[2, 1]).unwrap();
        assert_eq!(parts[0].to_f64_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(parts[1].to_f64_vec().unwrap(), vec![5.0, 6.0]);
        assert!(c.split_cols(&[2, 2]).is_err());
    }

    #[test]
    fn topk_stable_ties() {
        let d = dev();
        let a = T::from_f64_slice(&[0.5, 0.5, 0.1, 0.5], (1, 4), DType::F64, &d).unwrap();
        let (vals, idxs) = a.topk(2, 1).unwrap();
        assert_eq!(vals.to_f64_vec().unwrap(), vec![0.5, 0.5]);
        // Equal values keep first-seen order.
        assert_eq!(idxs.to_f64_vec().unwrap(), vec![0.0, 1.0]);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let d = dev();
        let a = T::from_f64_slice(&[1.0, 2.0, 3.0, 1.0, 1.0, 1.0], (2, 3), DType::F64, &d).unwrap();
        let s = a.softmax(1).unwrap();
        let rows = s.sum(1, false).unwrap().to_f64_vec().unwrap();
        for r in rows {
            assert!((r - 1.0).abs() < 1e-12);
        }
    }
}
