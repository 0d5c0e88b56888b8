//! Fixed-capacity history of recent valid values for one sensor channel.

use statrs::statistics::{Data, Median};
use std::collections::VecDeque;

/// FIFO window of the last `capacity` valid values, oldest evicted first.
#[derive(Debug, Clone)]
pub struct RollingBaseline {
    values: VecDeque<f64>,
    capacity: usize,
}

impl RollingBaseline {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a value, evicting the oldest when full.
    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Values oldest first.
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().copied()
    }

    /// Central tendency of the window, `None` while empty.
    pub fn median(&self) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        let data = Data::new(self.values.iter().copied().collect::<Vec<f64>>());
        Some(data.median())
    }

    /// Relative distance of `value` from the median, scaled by at least `floor`.
    pub fn deviation(&self, value: f64, floor: f64) -> Option<f64> {
        let center = self.median()?;
        let diff = (value - center).abs();
        let scale = center.max(floor);
        Some(if scale > 0.0 { diff / scale } else { diff })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_eviction_at_capacity() {
        let mut baseline = RollingBaseline::new(30);
        for i in 1..=31 {
            baseline.push(f64::from(i));
        }

        assert_eq!(baseline.len(), 30);
        assert!(!baseline.iter().any(|v| v == 1.0));
        assert!(baseline.iter().any(|v| v == 31.0));
        assert_eq!(baseline.iter().next(), Some(2.0));
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let mut baseline = RollingBaseline::new(5);
        for i in 0..100 {
            baseline.push(f64::from(i));
            assert!(baseline.len() <= 5);
        }
        assert_eq!(baseline.iter().collect::<Vec<_>>(), vec![95.0, 96.0, 97.0, 98.0, 99.0]);
    }

    #[test]
    fn test_median_and_deviation() {
        let mut baseline = RollingBaseline::new(30);
        assert_eq!(baseline.median(), None);
        assert_eq!(baseline.deviation(5.0, 1.0), None);

        for v in [8.0, 10.0, 12.0] {
            baseline.push(v);
        }
        assert_eq!(baseline.median(), Some(10.0));
        assert!((baseline.deviation(15.0, 1.0).unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_deviation_uses_floor_near_zero() {
        let mut baseline = RollingBaseline::new(3);
        baseline.push(0.0);
        // median 0 -> scaled by the floor instead of dividing by zero
        assert_eq!(baseline.deviation(2.0, 1.0), Some(2.0));
        assert_eq!(baseline.deviation(2.0, 0.0), Some(2.0));
    }
}
