// LayerNorm — per-row normalization with learnable scale and shift.
//
//   y = (x − mean(x)) · rsqrt(var(x) + ε) · α + β
//
// Mean and variance are taken over the last dimension of each row, so the
// result is batch-composition independent. α starts at 1 and β at 0; before
// they move, every output row has mean ≈ 0 and variance ≈ 1.

use stoat_core::backend::Backend;
use stoat_core::dtype::DType;
use stoat_core::error::{Error, Result};
use stoat_core::tensor::Tensor;
use stoat_core::weight::WeightTensor;

use crate::module::Module;

/// Layer normalization over the last dimension.
pub struct LayerNorm<B: Backend> {
    /// Learnable scale α, shape [size], initialized to 1.
    alpha: WeightTensor<B>,
    /// Learnable shift β, shape [size], initialized to 0.
    beta: WeightTensor<B>,
    size: usize,
    eps: f64,
}

impl<B: Backend> LayerNorm<B> {
    pub fn new(
        name: &str,
        size: usize,
        eps: f64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let alpha = WeightTensor::constant(format!("{name}.alpha"), size, 1.0, dtype, device, true)?;
        let beta = WeightTensor::constant(format!("{name}.beta"), size, 0.0, dtype, device, true)?;
        Ok(LayerNorm {
            alpha,
            beta,
            size,
            eps,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// Normalize over the last dimension, then scale and shift.
    pub fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        if x.rank() == 0 {
            return Err(Error::msg("layer norm needs at least one dimension"));
        }
        let last = x.rank() - 1;
        if x.dims()[last] != self.size {
            return Err(Error::msg(format!(
                "layer norm over {} features got input with {} columns",
                self.size,
                x.dims()[last]
            )));
        }

        let mu = x.mean(last, true)?;
        let centered = x.sub(&mu)?;
        let variance = centered.square()?.mean(last, true)?;
        let inv_std = variance.scale_shift(1.0, self.eps)?.rsqrt()?;
        let normalized = centered.mul(&inv_std)?;

        normalized.mul(&self.alpha.weight()?)?.add(&self.beta.weight()?)
    }
}

impl<B: Backend> Module<B> for LayerNorm<B> {
    fn params(&self) -> Vec<WeightTensor<B>> {
        vec![self.alpha.clone(), self.beta.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stoat_cpu::{CpuBackend, CpuDevice};

    type Ln = LayerNorm<CpuBackend>;
    type T = Tensor<CpuBackend>;

    #[test]
    fn rows_are_standardized_before_scale_shift() {
        let dev = CpuDevice::default();
        let ln = Ln::new("ln", 4, 1e-5, DType::F64, &dev).unwrap();
        let x = T::from_f64_slice(
            &[1.0, 2.0, 3.0, 4.0, -3.0, 0.0, 5.0, 2.0],
            (2, 4),
            DType::F64,
            &dev,
        )
        .unwrap();
        // α = 1, β = 0 at init, so the output is the bare normalization.
        let y = ln.forward(&x).unwrap();
        let mean = y.mean(1, false).unwrap().to_f64_vec().unwrap();
        let var = y.var(1, false).unwrap().to_f64_vec().unwrap();
        for m in mean {
            assert!(m.abs() < 1e-9, "row mean {m} not ~0");
        }
        for v in var {
            assert!((v - 1.0).abs() < 1e-3, "row var {v} not ~1");
        }
    }

    #[test]
    fn rejects_wrong_width() {
        let dev = CpuDevice::default();
        let ln = Ln::new("ln", 4, 1e-5, DType::F64, &dev).unwrap();
        let x = T::zeros((2, 3), DType::F64, &dev).unwrap();
        assert!(ln.forward(&x).is_err());
    }

    #[test]
    fn has_two_params() {
        let dev = CpuDevice::default();
        let ln = Ln::new("enc.ln", 8, 1e-5, DType::F32, &dev).unwrap();
        assert_eq!(ln.num_parameters(), 16);
        let names: Vec<String> = ln.named_params().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["enc.ln.alpha", "enc.ln.beta"]);
    }
}
