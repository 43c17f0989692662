// Nucleus (top-p) sampling with a repeat penalty.
//
// Per row: down-weight tokens the row has already generated, renormalize,
// keep the smallest descending-probability prefix whose cumulative mass
// reaches top_p, renormalize the prefix, draw one index. With top_p = 1 and
// penalty = 1 this is plain categorical sampling; as top_p → 0 only the
// argmax survives and the draw is deterministic.

use rand::Rng;

use stoat_core::backend::Backend;
use stoat_core::bail;
use stoat_core::error::Result;
use stoat_core::tensor::Tensor;

/// Sample one token index per row of a probability matrix.
///
/// - `probs`: [rows, vocab], each row a distribution
/// - `top_p`: nucleus mass in (0, 1]
/// - `repeat_penalty`: ≥ 1; already-generated token probabilities are
///   divided by it before the nucleus is formed
/// - `generated`: per row, the token ids produced so far (empty slice — or
///   an empty outer slice — disables the penalty)
pub fn top_p_sample<B: Backend, R: Rng>(
    probs: &Tensor<B>,
    top_p: f64,
    repeat_penalty: f64,
    generated: &[Vec<usize>],
    rng: &mut R,
) -> Result<Vec<usize>> {
    if probs.rank() != 2 {
        bail!("top_p_sample expects [rows, vocab] probabilities");
    }
    if !(0.0..=1.0).contains(&top_p) || top_p == 0.0 {
        bail!("top_p {top_p} outside (0, 1]");
    }
    if repeat_penalty < 1.0 {
        bail!("repeat_penalty {repeat_penalty} must be >= 1");
    }
    let (rows, vocab) = (probs.dims()[0], probs.dims()[1]);
    if !generated.is_empty() && generated.len() != rows {
        bail!(
            "generated history has {} rows, probabilities have {rows}",
            generated.len()
        );
    }

    let data = probs.contiguous()?.to_f64_vec()?;
    let mut picks = Vec::with_capacity(rows);

    for r in 0..rows {
        let mut row: Vec<f64> = data[r * vocab..(r + 1) * vocab].to_vec();

        // Multiplicative down-weighting of already-seen tokens.
        if repeat_penalty > 1.0 {
            if let Some(history) = generated.get(r) {
                for &tok in history {
                    if tok < vocab {
                        row[tok] /= repeat_penalty;
                    }
                }
            }
        }

        let total: f64 = row.iter().sum();
        if total <= 0.0 {
            bail!("top_p_sample: row {r} has no probability mass");
        }

        // Descending order; stable, so equal masses keep index order.
        let mut order: Vec<usize> = (0..vocab).collect();
        order.sort_by(|&a, &b| row[b].partial_cmp(&row[a]).unwrap_or(std::cmp::Ordering::Equal));

        // Smallest prefix reaching the nucleus mass.
        let target = top_p * total;
        let mut kept = 0usize;
        let mut mass = 0.0;
        for &idx in &order {
            kept += 1;
            mass += row[idx];
            if mass >= target {
                break;
            }
        }

        // Renormalized draw over the prefix.
        let draw = rng.gen::<f64>() * mass;
        let mut acc = 0.0;
        let mut chosen = order[kept - 1];
        for &idx in order.iter().take(kept) {
            acc += row[idx];
            if draw <= acc {
                chosen = idx;
                break;
            }
        }
        picks.push(chosen);
    }

    Ok(picks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use stoat_core::DType;
    use stoat_cpu::{CpuBackend, CpuDevice};

    type T = Tensor<CpuBackend>;

    #[test]
    fn tiny_top_p_is_deterministic_argmax() {
        let dev = CpuDevice::default();
        let probs =
            T::from_f64_slice(&[0.1, 0.6, 0.3, 0.5, 0.2, 0.3], (2, 3), DType::F64, &dev).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let picks = top_p_sample(&probs, 1e-6, 1.0, &[], &mut rng).unwrap();
            assert_eq!(picks, vec![1, 0]);
        }
    }

    #[test]
    fn full_nucleus_matches_distribution() {
        // With top_p = 1 and no penalty, empirical frequencies should track
        // the distribution.
        let dev = CpuDevice::default();
        let probs = T::from_f64_slice(&[0.8, 0.15, 0.05], (1, 3), DType::F64, &dev).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let mut counts = [0usize; 3];
        let n = 2000;
        for _ in 0..n {
            let picks = top_p_sample(&probs, 1.0, 1.0, &[], &mut rng).unwrap();
            counts[picks[0]] += 1;
        }
        let f0 = counts[0] as f64 / n as f64;
        assert!((f0 - 0.8).abs() < 0.05, "frequency {f0} far from 0.8");
        assert!(counts[2] > 0, "tail token never sampled at top_p = 1");
    }

    #[test]
    fn nucleus_cuts_the_tail() {
        // top_p = 0.5 keeps only the 0.6 token of [0.6, 0.25, 0.15].
        let dev = CpuDevice::default();
        let probs = T::from_f64_slice(&[0.6, 0.25, 0.15], (1, 3), DType::F64, &dev).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let picks = top_p_sample(&probs, 0.5, 1.0, &[], &mut rng).unwrap();
            assert_eq!(picks[0], 0);
        }
    }

    #[test]
    fn repeat_penalty_demotes_generated_tokens() {
        // Token 0 dominates, but a strong penalty on it flips the argmax.
        let dev = CpuDevice::default();
        let probs = T::from_f64_slice(&[0.6, 0.4], (1, 2), DType::F64, &dev).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let history = vec![vec![0usize]];
        for _ in 0..20 {
            let picks = top_p_sample(&probs, 1e-6, 10.0, &history, &mut rng).unwrap();
            assert_eq!(picks, vec![1]);
        }
    }

    #[test]
    fn rejects_invalid_arguments() {
        let dev = CpuDevice::default();
        let probs = T::from_f64_slice(&[1.0], (1, 1), DType::F64, &dev).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert!(top_p_sample(&probs, 0.0, 1.0, &[], &mut rng).is_err());
        assert!(top_p_sample(&probs, 1.5, 1.0, &[], &mut rng).is_err());
        assert!(top_p_sample(&probs, 1.0, 0.5, &[], &mut rng).is_err());
    }
}
