// Cross-entropy over softmaxed rows, with the backward seed fused in.
//
// The probability tensor arrives wrapped in a WeightTensor so the loss can
// do both halves of its job: return the scalar loss, and push the fused
// softmax-cross-entropy derivative (p − t)/batch into the gradient slot.
// Seeding goes through copy-or-add, so a second loss term over the same
// activations accumulates rather than overwrites.

use stoat_core::backend::Backend;
use stoat_core::bail;
use stoat_core::error::Result;
use stoat_core::tensor::Tensor;
use stoat_core::weight::WeightTensor;

/// Label-smoothed cross-entropy over already-softmaxed rows.
///
/// - `probs`: [batch, classes] rows summing to 1, wrapped for seeding
/// - `truth`: [batch] class indices (I64)
/// - `smoothing`: 0 for hard targets; otherwise the target distribution is
///   (1 − s)·one_hot + s/classes
/// - `seed_gradient`: when set, accumulates (p − t)/batch into `probs`'
///   gradient slot
///
/// Returns the mean negative log-likelihood.
pub fn cross_entropy_loss<B: Backend>(
    probs: &WeightTensor<B>,
    truth: &Tensor<B>,
    smoothing: f64,
    seed_gradient: bool,
) -> Result<f64> {
    let p = probs.weight()?;
    if p.rank() != 2 {
        bail!("cross entropy expects [batch, classes] probabilities");
    }
    let (batch, classes) = (p.dims()[0], p.dims()[1]);
    if truth.elem_count() != batch {
        bail!(
            "cross entropy got {} targets for batch of {batch}",
            truth.elem_count()
        );
    }
    if !(0.0..1.0).contains(&smoothing) {
        bail!("label smoothing {smoothing} outside [0, 1)");
    }

    let p_data = p.contiguous()?.to_f64_vec()?;
    let t_data = truth.to_f64_vec()?;

    let off_target = smoothing / classes as f64;
    let on_target = 1.0 - smoothing + off_target;

    let mut loss = 0.0;
    let mut grad = vec![0.0f64; batch * classes];
    for (b, &t) in t_data.iter().enumerate() {
        let target = t as usize;
        if target >= classes {
            bail!("target class {target} out of range for {classes} classes");
        }
        for c in 0..classes {
            let t_c = if c == target { on_target } else { off_target };
            if t_c > 0.0 {
                let p_c = p_data[b * classes + c].max(1e-12);
                loss -= t_c * p_c.ln();
            }
            grad[b * classes + c] = (p_data[b * classes + c] - t_c) / batch as f64;
        }
    }
    loss /= batch as f64;

    if seed_gradient {
        let g = Tensor::<B>::from_f64_slice(&grad, p.shape().clone(), p.dtype(), p.device())?;
        probs.copy_or_add_gradient_tensor(&g)?;
    }

    Ok(loss)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stoat_core::DType;
    use stoat_cpu::{CpuBackend, CpuDevice};

    type T = Tensor<CpuBackend>;

    fn probs_2x3(dev: &CpuDevice) -> WeightTensor<CpuBackend> {
        let t = T::from_f64_slice(
            &[0.7, 0.2, 0.1, 0.1, 0.8, 0.1],
            (2, 3),
            DType::F64,
            dev,
        )
        .unwrap();
        WeightTensor::from_tensor("probs", t)
    }

    #[test]
    fn hard_target_loss_value() {
        let dev = CpuDevice::default();
        let probs = probs_2x3(&dev);
        let truth = T::from_f64_slice(&[0.0, 1.0], 2, DType::I64, &dev).unwrap();
        let loss = cross_entropy_loss(&probs, &truth, 0.0, false).unwrap();
        let expected = -(0.7f64.ln() + 0.8f64.ln()) / 2.0;
        assert!((loss - expected).abs() < 1e-12);
    }

    #[test]
    fn gradient_seed_is_p_minus_t_over_batch() {
        let dev = CpuDevice::default();
        let probs = probs_2x3(&dev);
        let truth = T::from_f64_slice(&[0.0, 1.0], 2, DType::I64, &dev).unwrap();
        cross_entropy_loss(&probs, &truth, 0.0, true).unwrap();
        let g = probs.gradient().unwrap().unwrap().to_f64_vec().unwrap();
        let expect = [
            (0.7 - 1.0) / 2.0,
            0.2 / 2.0,
            0.1 / 2.0,
            0.1 / 2.0,
            (0.8 - 1.0) / 2.0,
            0.1 / 2.0,
        ];
        for (a, e) in g.iter().zip(expect.iter()) {
            assert!((a - e).abs() < 1e-12);
        }
    }

    #[test]
    fn second_seed_accumulates() {
        let dev = CpuDevice::default();
        let probs = probs_2x3(&dev);
        let truth = T::from_f64_slice(&[0.0, 1.0], 2, DType::I64, &dev).unwrap();
        cross_entropy_loss(&probs, &truth, 0.0, true).unwrap();
        let once = probs.gradient().unwrap().unwrap().to_f64_vec().unwrap();
        cross_entropy_loss(&probs, &truth, 0.0, true).unwrap();
        let twice = probs.gradient().unwrap().unwrap().to_f64_vec().unwrap();
        for (o, t) in once.iter().zip(twice.iter()) {
            assert!((t - 2.0 * o).abs() < 1e-12);
        }
    }

    #[test]
    fn smoothing_spreads_target_mass() {
        let dev = CpuDevice::default();
        let probs = probs_2x3(&dev);
        let truth = T::from_f64_slice(&[0.0, 1.0], 2, DType::I64, &dev).unwrap();
        let hard = cross_entropy_loss(&probs, &truth, 0.0, false).unwrap();
        let smooth = cross_entropy_loss(&probs, &truth, 0.3, false).unwrap();
        // Smoothed targets pay for off-class log-probs too.
        assert!(smooth > hard);
    }

    #[test]
    fn rejects_out_of_range_target() {
        let dev = CpuDevice::default();
        let probs = probs_2x3(&dev);
        let truth = T::from_f64_slice(&[5.0, 1.0], 2, DType::I64, &dev).unwrap();
        assert!(cross_entropy_loss(&probs, &truth, 0.0, false).is_err());
    }
}
