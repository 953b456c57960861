/// Sample-weighted running average of a loss over an epoch.
#[derive(Debug, Clone, Default)]
pub struct LossMeter {
    sum: f64,
    count: usize,
}

impl LossMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a batch-mean `value` computed over `n` samples.
    pub fn update(&mut self, value: f64, n: usize) {
        self.sum += value * n as f64;
        self.count += n;
    }

    /// Weighted mean of everything recorded so far, 0 when empty.
    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_average() {
        let mut meter = LossMeter::new();
        assert_eq!(meter.avg(), 0.0);

        meter.update(1.0, 2);
        meter.update(4.0, 1);
        assert!((meter.avg() - 2.0).abs() < 1e-12);

        meter.update(0.0, 0);
        assert!((meter.avg() - 2.0).abs() < 1e-12, "empty batch leaves the mean unchanged");
    }
}
