// Vector quantization — 1-D codebook construction and lookup.
//
// The codebook is built by Lloyd's refinement over the scalar samples:
// start with centroids spread over the sample range, repeatedly assign
// every sample to its nearest centroid and move each centroid to its
// cluster mean, until the mean squared distortion stops improving. The
// final distortion is reported so callers can gate lossy storage on it.
//
// Fewer than k distinct samples still yields exactly k entries (the
// distinct values, padded with duplicates), and reconstruction of those
// values is exact.

use stoat_core::{bail, Result};

const DEFAULT_ITERS: usize = 30;
const CONVERGENCE_EPS: f64 = 1e-10;

/// A fitted scalar codebook.
#[derive(Debug, Clone)]
pub struct VectorQuantizer {
    /// Representative values, sorted ascending. Length is exactly the k
    /// requested at fit time.
    codebook: Vec<f32>,
    /// Mean squared quantization error over the training samples.
    distortion: f64,
}

impl VectorQuantizer {
    /// Build a k-entry codebook from scalar samples.
    pub fn fit(samples: &[f32], k: usize) -> Result<Self> {
        Self::fit_with_iters(samples, k, DEFAULT_ITERS)
    }

    pub fn fit_with_iters(samples: &[f32], k: usize, iters: usize) -> Result<Self> {
        if k == 0 {
            bail!("codebook size must be at least 1");
        }
        if samples.is_empty() {
            bail!("cannot fit a codebook on zero samples");
        }

        let mut sorted: Vec<f64> = samples.iter().map(|&v| v as f64).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let mut distinct: Vec<f64> = Vec::with_capacity(k);
        for &v in &sorted {
            if distinct.last().is_none_or(|&last| v != last) {
                distinct.push(v);
            }
        }

        // Degenerate case: every distinct value gets its own entry, the
        // rest are duplicate padding. Reconstruction is exact.
        if distinct.len() <= k {
            let mut codebook: Vec<f32> = distinct.iter().map(|&v| v as f32).collect();
            while codebook.len() < k {
                codebook.push(*codebook.last().unwrap());
            }
            return Ok(VectorQuantizer {
                codebook,
                distortion: 0.0,
            });
        }

        // Seed centroids at evenly spaced ranks of the distinct values.
        // distinct.len() > k here, so the ranks never collide and every
        // centroid starts unique.
        let mut centroids: Vec<f64> = (0..k)
            .map(|i| distinct[i * (distinct.len() - 1) / (k - 1).max(1)])
            .collect();

        let mut last_distortion = f64::INFINITY;
        for _ in 0..iters {
            // Assignment: samples are sorted, so walk both lists once.
            let mut sums = vec![0.0f64; k];
            let mut counts = vec![0usize; k];
            let mut sq_err = 0.0f64;
            let mut c = 0usize;
            for &v in &sorted {
                // Samples and centroids are both sorted, so the nearest
                // centroid index only ever moves forward.
                while c + 1 < k && (centroids[c + 1] - v).abs() <= (centroids[c] - v).abs() {
                    c += 1;
                }
                sums[c] += v;
                counts[c] += 1;
                let d = v - centroids[c];
                sq_err += d * d;
            }

            // Update: move to cluster means; empty clusters keep their spot.
            for i in 0..k {
                if counts[i] > 0 {
                    centroids[i] = sums[i] / counts[i] as f64;
                }
            }
            centroids.sort_by(|a, b| a.total_cmp(b));

            let distortion = sq_err / sorted.len() as f64;
            if (last_distortion - distortion).abs() < CONVERGENCE_EPS {
                break;
            }
            last_distortion = distortion;
        }

        // Final distortion against the settled codebook.
        let codebook: Vec<f32> = centroids.iter().map(|&v| v as f32).collect();
        let quantizer = VectorQuantizer {
            codebook,
            distortion: 0.0,
        };
        let distortion = samples
            .iter()
            .map(|&v| {
                let d = v as f64 - quantizer.dequantize(quantizer.quantize(v)) as f64;
                d * d
            })
            .sum::<f64>()
            / samples.len() as f64;

        Ok(VectorQuantizer {
            distortion,
            ..quantizer
        })
    }

    /// Rebuild from a stored codebook (distortion unknown, reported as 0).
    pub fn from_codebook(codebook: Vec<f32>) -> Self {
        VectorQuantizer {
            codebook,
            distortion: 0.0,
        }
    }

    pub fn codebook(&self) -> &[f32] {
        &self.codebook
    }

    pub fn distortion(&self) -> f64 {
        self.distortion
    }

    /// Index of the nearest codebook entry. Binary search over the sorted
    /// codebook, then a neighbor comparison.
    pub fn quantize(&self, value: f32) -> usize {
        let n = self.codebook.len();
        let pos = self.codebook.partition_point(|&c| c < value);
        if pos == 0 {
            return 0;
        }
        if pos >= n {
            return n - 1;
        }
        let below = self.codebook[pos - 1];
        let above = self.codebook[pos];
        if (value - below).abs() <= (above - value).abs() {
            pos - 1
        } else {
            pos
        }
    }

    pub fn dequantize(&self, index: usize) -> f32 {
        self.codebook[index.min(self.codebook.len() - 1)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_on_few_distinct_values() {
        let samples = vec![1.0f32, -2.0, 1.0, 3.5, -2.0, 1.0];
        let vq = VectorQuantizer::fit(&samples, 16).unwrap();
        assert_eq!(vq.codebook().len(), 16);
        assert_eq!(vq.distortion(), 0.0);
        for &v in &[1.0f32, -2.0, 3.5] {
            assert_eq!(vq.dequantize(vq.quantize(v)), v);
        }
    }

    #[test]
    fn constant_input_is_lossless() {
        let samples = vec![1.0f32; 300];
        let vq = VectorQuantizer::fit(&samples, 256).unwrap();
        assert_eq!(vq.codebook().len(), 256);
        assert_eq!(vq.dequantize(vq.quantize(1.0)), 1.0);
        assert_eq!(vq.distortion(), 0.0);
    }

    #[test]
    fn distortion_shrinks_with_codebook_size() {
        let samples: Vec<f32> = (0..500).map(|i| ((i * 37) % 101) as f32 / 101.0).collect();
        let small = VectorQuantizer::fit(&samples, 4).unwrap();
        let large = VectorQuantizer::fit(&samples, 64).unwrap();
        assert!(large.distortion() < small.distortion());
    }

    #[test]
    fn quantize_picks_nearest() {
        let vq = VectorQuantizer::from_codebook(vec![-1.0, 0.0, 1.0]);
        assert_eq!(vq.quantize(-0.9), 0);
        assert_eq!(vq.quantize(-0.4), 1);
        assert_eq!(vq.quantize(0.6), 2);
        assert_eq!(vq.quantize(5.0), 2);
        assert_eq!(vq.quantize(-5.0), 0);
    }

    #[test]
    fn rejects_degenerate_inputs() {
        assert!(VectorQuantizer::fit(&[], 4).is_err());
        assert!(VectorQuantizer::fit(&[1.0], 0).is_err());
    }
}
