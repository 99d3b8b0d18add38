use std::collections::BTreeMap;

use tracing::info;

/// Power-of-two bucketed histogram of sizes.
pub struct Histogram {
    name: &'static str,
    buckets: BTreeMap<u32, usize>,
    count: usize,
    sum: usize,
    min: usize,
    max: usize,
}

impl Histogram {
    pub fn new(name: &'static str) -> Histogram {
        Histogram {
            name,
            buckets: BTreeMap::new(),
            count: 0,
            sum: 0,
            min: usize::MAX,
            max: 0,
        }
    }

    pub fn add_value(&mut self, value: usize) {
        let bucket = usize::BITS - value.leading_zeros();
        *self.buckets.entry(bucket).or_insert(0) += 1;
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn sum(&self) -> usize {
        self.sum
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }

    /// Number of values in `[2^(bucket-1), 2^bucket)`; bucket 0 holds zeros.
    pub fn bucket(&self, bucket: u32) -> usize {
        self.buckets.get(&bucket).copied().unwrap_or(0)
    }

    pub fn dump(&self) {
        if self.count == 0 {
            return;
        }
        info!(
            histogram = self.name,
            count = self.count,
            sum = self.sum,
            mean = self.mean(),
            min = self.min,
            max = self.max,
            "histogram"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buckets() {
        let mut histogram = Histogram::new("sizes");
        for value in [0, 1, 3, 4, 7, 64] {
            histogram.add_value(value);
        }
        assert_eq!(histogram.count(), 6);
        assert_eq!(histogram.sum(), 79);
        assert_eq!(histogram.bucket(0), 1);
        assert_eq!(histogram.bucket(1), 1);
        assert_eq!(histogram.bucket(2), 1);
        assert_eq!(histogram.bucket(3), 2);
        assert_eq!(histogram.bucket(7), 1);
        histogram.dump();
    }
}
