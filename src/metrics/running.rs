//! Running statistics without storing the individual values.

/// Online mean.
///
/// Incremental update, numerically stable for long streams.
#[derive(Debug, Clone, Default)]
pub struct RunningMean {
    mean: f64,
    count: usize,
}

impl RunningMean {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
    }

    /// Current mean; `0.0` before the first update.
    pub fn compute(&self) -> f64 {
        self.mean
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_of_batch_losses() {
        let mut losses = RunningMean::new();
        assert_eq!(losses.compute(), 0.0);
        for loss in [0.9, 0.6, 0.3] {
            losses.update(loss);
        }
        assert!((losses.compute() - 0.6).abs() < 1e-12);
        assert_eq!(losses.count(), 3);
    }

    #[test]
    fn unequal_batches_weigh_the_same() {
        let mut acc = RunningMean::new();
        acc.update(1.0);
        acc.update(0.0);
        assert!((acc.compute() - 0.5).abs() < 1e-12);
    }
}
