// Lock-free histogram of ack latencies in whole seconds.
use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Distribution {
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
}

impl Distribution {
    /// Values are clamped into `0..max_value`.
    pub(crate) fn new(max_value: usize) -> Self {
        Self {
            buckets: (0..max_value.max(1)).map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
        }
    }

    pub(crate) fn record(&self, value: u64) {
        let index = (value as usize).min(self.buckets.len() - 1);
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Smallest recorded value at or below which `percentile`% of samples fall.
    pub(crate) fn percentile(&self, percentile: f64) -> u64 {
        let count = self.count.load(Ordering::Relaxed);
        let target = ((percentile * count as f64) / 100.0).ceil() as u64;
        let mut seen = 0;
        for (value, bucket) in self.buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= target {
                return value as u64;
            }
        }
        (self.buckets.len() - 1) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_of_seeded_distribution_is_the_seed() {
        let distribution = Distribution::new(601);
        distribution.record(10);
        assert_eq!(distribution.percentile(99.9), 10);
    }

    #[test]
    fn percentile_tracks_slow_tail() {
        let distribution = Distribution::new(601);
        for _ in 0..99 {
            distribution.record(2);
        }
        distribution.record(45);
        assert_eq!(distribution.percentile(50.0), 2);
        assert_eq!(distribution.percentile(99.0), 2);
        assert_eq!(distribution.percentile(99.9), 45);
    }

    #[test]
    fn record_clamps_large_values() {
        let distribution = Distribution::new(601);
        distribution.record(10_000);
        assert_eq!(distribution.percentile(100.0), 600);
    }
}
