/// Fixed-capacity moving average over the most recent samples.
///
/// During warm-up only the samples inserted so far count toward the mean.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    samples: Vec<f64>,
    capacity: usize,
    next: usize,
}

impl MovingAverage {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
            next: 0,
        }
    }

    pub fn push(&mut self, sample: f64) {
        if self.samples.len() < self.capacity {
            self.samples.push(sample);
        } else {
            self.samples[self.next] = sample;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    /// `None` until the first sample arrives.
    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mean(values: &[f64]) -> f64 {
        values.iter().sum::<f64>() / values.len() as f64
    }

    #[test]
    fn empty_filter_has_no_average() {
        assert_eq!(MovingAverage::new(4).average(), None);
    }

    #[test]
    fn warm_up_averages_inserted_samples_only() {
        let mut f = MovingAverage::new(5);
        let samples = [10.0, 20.0, 60.0];
        for (k, s) in samples.iter().enumerate() {
            f.push(*s);
            assert_eq!(f.average(), Some(mean(&samples[..=k])));
        }
        assert_eq!(f.samples.len(), 3);
    }

    #[test]
    fn full_filter_averages_most_recent_capacity_samples() {
        let mut f = MovingAverage::new(3);
        let samples = [1.0, 2.0, 3.0, 4.0, 5.0, 100.0, 7.0];
        for (k, s) in samples.iter().enumerate() {
            f.push(*s);
            let start = (k + 1).saturating_sub(3);
            let window = &samples[start..=k];
            let avg = f.average().unwrap();
            assert!(
                (avg - mean(window)).abs() < 1e-9,
                "after {} samples: {avg} != {}",
                k + 1,
                mean(window)
            );
        }
        assert_eq!(f.samples.len(), 3);
    }

    #[test]
    fn zero_capacity_behaves_like_one() {
        let mut f = MovingAverage::new(0);
        f.push(4.0);
        f.push(9.0);
        assert_eq!(f.capacity, 1);
        assert_eq!(f.average(), Some(9.0));
    }
}
