// Attention mask builders.
//
// Additive masks hold 0 at visible positions and a large negative value at
// blocked ones; adding them to attention scores before softmax drives the
// blocked weights to ~0. Triangular masks enforce causal (left-to-right)
// visibility; pad masks blank out positions beyond each sequence's true
// length, taken from per-example original-length slices.
//
// A finite block value is used instead of -inf so a fully-masked row still
// softmaxes to numbers rather than NaN.

use stoat_core::backend::Backend;
use stoat_core::dtype::DType;
use stoat_core::error::Result;
use stoat_core::tensor::Tensor;

/// Additive value for blocked positions.
pub const BLOCKED: f64 = -1e9;

/// [rows, cols] additive triangular mask: position (i, j) is visible when
/// j ≤ i.
pub fn tri_mask<B: Backend>(
    rows: usize,
    cols: usize,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    let mut data = vec![BLOCKED; rows * cols];
    for i in 0..rows {
        for j in 0..cols.min(i + 1) {
            data[i * cols + j] = 0.0;
        }
    }
    Tensor::from_f64_slice(&data, (rows, cols), dtype, device)
}

/// Square causal mask for self-attention over `len` positions.
pub fn causal_mask<B: Backend>(len: usize, dtype: DType, device: &B::Device) -> Result<Tensor<B>> {
    tri_mask(len, len, dtype, device)
}

/// [batch, max_len, max_len] pad-only self-attention mask: row b blocks
/// every key at or beyond `lens[b]`.
pub fn pad_self_mask<B: Backend>(
    lens: &[usize],
    max_len: usize,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    let batch = lens.len();
    let mut data = vec![BLOCKED; batch * max_len * max_len];
    for (b, &len) in lens.iter().enumerate() {
        let len = len.min(max_len);
        for i in 0..max_len {
            for j in 0..len {
                data[(b * max_len + i) * max_len + j] = 0.0;
            }
        }
    }
    Tensor::from_f64_slice(&data, (batch, max_len, max_len), dtype, device)
}

/// [batch, max_len, max_len] causal + pad mask: (b, i, j) is visible when
/// j ≤ i and j < lens[b].
pub fn causal_pad_mask<B: Backend>(
    lens: &[usize],
    max_len: usize,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    let batch = lens.len();
    let mut data = vec![BLOCKED; batch * max_len * max_len];
    for (b, &len) in lens.iter().enumerate() {
        let len = len.min(max_len);
        for i in 0..max_len {
            for j in 0..len.min(i + 1) {
                data[(b * max_len + i) * max_len + j] = 0.0;
            }
        }
    }
    Tensor::from_f64_slice(&data, (batch, max_len, max_len), dtype, device)
}

/// [batch, tgt_len, max_src] cross-attention mask: every target position of
/// example b may see the first `src_lens[b]` source positions.
pub fn src_tgt_mask<B: Backend>(
    src_lens: &[usize],
    max_src: usize,
    tgt_len: usize,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    let batch = src_lens.len();
    let mut data = vec![BLOCKED; batch * tgt_len * max_src];
    for (b, &len) in src_lens.iter().enumerate() {
        let len = len.min(max_src);
        for i in 0..tgt_len {
            for j in 0..len {
                data[(b * tgt_len + i) * max_src + j] = 0.0;
            }
        }
    }
    Tensor::from_f64_slice(&data, (batch, tgt_len, max_src), dtype, device)
}

/// [batch, max_len, features] multiplicative mask: 1 for real timesteps,
/// 0 for padding. Multiplying activations by it zeroes padded rows.
pub fn feature_mask<B: Backend>(
    lens: &[usize],
    max_len: usize,
    features: usize,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    let batch = lens.len();
    let mut data = vec![0.0f64; batch * max_len * features];
    for (b, &len) in lens.iter().enumerate() {
        let len = len.min(max_len);
        for t in 0..len {
            let start = (b * max_len + t) * features;
            for slot in data[start..start + features].iter_mut() {
                *slot = 1.0;
            }
        }
    }
    Tensor::from_f64_slice(&data, (batch, max_len, features), dtype, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stoat_cpu::{CpuBackend, CpuDevice};

    #[test]
    fn causal_visibility() {
        let dev = CpuDevice::default();
        let m = causal_mask::<CpuBackend>(3, DType::F64, &dev).unwrap();
        let v = m.to_f64_vec().unwrap();
        // Row 0 sees only position 0; row 2 sees everything.
        assert_eq!(v[0], 0.0);
        assert_eq!(v[1], BLOCKED);
        assert_eq!(v[6], 0.0);
        assert_eq!(v[7], 0.0);
        assert_eq!(v[8], 0.0);
    }

    #[test]
    fn pad_mask_blocks_beyond_length() {
        let dev = CpuDevice::default();
        let m = pad_self_mask::<CpuBackend>(&[2, 4], 4, DType::F64, &dev).unwrap();
        // Example 0 (len 2): key 3 blocked on every row.
        assert_eq!(m.value_at(&[0, 0, 1]).unwrap(), 0.0);
        assert_eq!(m.value_at(&[0, 0, 3]).unwrap(), BLOCKED);
        // Example 1 (len 4): nothing blocked.
        assert_eq!(m.value_at(&[1, 3, 3]).unwrap(), 0.0);
    }

    #[test]
    fn causal_pad_combines_both_rules() {
        let dev = CpuDevice::default();
        let m = causal_pad_mask::<CpuBackend>(&[2], 3, DType::F64, &dev).unwrap();
        // (i=0, j=1): causally blocked even though j < len.
        assert_eq!(m.value_at(&[0, 0, 1]).unwrap(), BLOCKED);
        // (i=2, j=1): visible (j ≤ i, j < len).
        assert_eq!(m.value_at(&[0, 2, 1]).unwrap(), 0.0);
        // (i=2, j=2): pad-blocked (j ≥ len).
        assert_eq!(m.value_at(&[0, 2, 2]).unwrap(), BLOCKED);
    }

    #[test]
    fn src_tgt_follows_source_lengths() {
        let dev = CpuDevice::default();
        let m = src_tgt_mask::<CpuBackend>(&[1, 3], 3, 2, DType::F64, &dev).unwrap();
        assert_eq!(m.value_at(&[0, 1, 0]).unwrap(), 0.0);
        assert_eq!(m.value_at(&[0, 1, 2]).unwrap(), BLOCKED);
        assert_eq!(m.value_at(&[1, 0, 2]).unwrap(), 0.0);
    }

    #[test]
    fn feature_mask_is_multiplicative() {
        let dev = CpuDevice::default();
        let m = feature_mask::<CpuBackend>(&[1], 2, 3, DType::F64, &dev).unwrap();
        assert_eq!(m.to_f64_vec().unwrap(), vec![1.0, 1.0, 1.0, 0.0, 0.0, 0.0]);
    }
}
