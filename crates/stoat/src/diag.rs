// Weight diagnostics with an explicit rate limiter.
//
// Training loops want to peek at weight statistics without flooding the
// log. The limiter state (last emission time) lives in this struct and is
// owned by whoever does the logging — there is no process-wide clock.

use std::time::{Duration, Instant};

use stoat_core::backend::Backend;
use stoat_core::error::Result;
use stoat_core::weight::WeightTensor;
use tracing::info;

/// Rate-limited logger for weight-tensor summaries.
pub struct WeightLogger {
    min_interval: Duration,
    last_emit: Option<Instant>,
}

impl WeightLogger {
    pub fn new(min_interval: Duration) -> Self {
        WeightLogger {
            min_interval,
            last_emit: None,
        }
    }

    /// Log min/max/mean of the tensor's weights unless one was emitted
    /// within the interval. Returns whether a line was emitted.
    pub fn maybe_log<B: Backend>(&mut self, wt: &WeightTensor<B>) -> Result<bool> {
        let now = Instant::now();
        if let Some(last) = self.last_emit {
            if now.duration_since(last) < self.min_interval {
                return Ok(false);
            }
        }

        let data = wt.weight()?.contiguous()?.to_f64_vec()?;
        let (mut min, mut max, mut sum) = (f64::INFINITY, f64::NEG_INFINITY, 0.0);
        for &v in &data {
            min = min.min(v);
            max = max.max(v);
            sum += v;
        }
        let mean = sum / data.len().max(1) as f64;
        info!(
            name = wt.name(),
            shape = %wt.shape(),
            min,
            max,
            mean,
            "weight summary"
        );

        self.last_emit = Some(now);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stoat_core::DType;
    use stoat_cpu::{CpuBackend, CpuDevice};

    #[test]
    fn second_call_inside_interval_is_suppressed() {
        let dev = CpuDevice::default();
        let wt = WeightTensor::<CpuBackend>::constant("w", (2, 2), 1.0, DType::F32, &dev, false)
            .unwrap();
        let mut logger = WeightLogger::new(Duration::from_secs(3600));
        assert!(logger.maybe_log(&wt).unwrap());
        assert!(!logger.maybe_log(&wt).unwrap());
    }

    #[test]
    fn zero_interval_always_logs() {
        let dev = CpuDevice::default();
        let wt = WeightTensor::<CpuBackend>::constant("w", 4, 0.5, DType::F32, &dev, false)
            .unwrap();
        let mut logger = WeightLogger::new(Duration::ZERO);
        assert!(logger.maybe_log(&wt).unwrap());
        assert!(logger.maybe_log(&wt).unwrap());
    }
}
