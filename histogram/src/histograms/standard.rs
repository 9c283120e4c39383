// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::{Bucket, Config, HistogramError};

/// A histogram which groups recorded values into buckets of similar values
/// and tracks counts for recorded values that fall into those ranges, with
/// the relative width of any bucket bounded by the configured precision.
///
/// This type is not thread-safe. See [`crate::AtomicHistogram`] for a variant
/// which may be concurrently modified.
#[derive(Clone)]
pub struct Histogram {
    pub(crate) config: Config,
    pub(crate) counts: Box<[u64]>,
    pub(crate) total_count: u64,
    pub(crate) min_non_zero: u64,
    pub(crate) max_value: u64,
    pub(crate) start_timestamp_ms: i64,
    pub(crate) end_timestamp_ms: i64,
}

impl Histogram {
    /// Create a new histogram which stores values from 1 to `max` while
    /// preserving `significant_digits` digits of precision.
    pub fn new(max: u64, significant_digits: u8) -> Result<Self, HistogramError> {
        Self::with_range(1, max, significant_digits)
    }

    /// Create a new histogram with a configurable floor below which values
    /// are indistinguishable from one another.
    pub fn with_range(
        lowest_discernible: u64,
        max: u64,
        significant_digits: u8,
    ) -> Result<Self, HistogramError> {
        Config::new(lowest_discernible, max, significant_digits).map(Self::from_config)
    }

    /// Create a new histogram from an already-derived bucket layout.
    pub fn from_config(config: Config) -> Self {
        Self {
            config,
            counts: vec![0; config.counts_len()].into_boxed_slice(),
            total_count: 0,
            min_non_zero: u64::MAX,
            max_value: 0,
            start_timestamp_ms: i64::MAX,
            end_timestamp_ms: 0,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Return the number of buckets stored within the histogram.
    pub fn buckets(&self) -> usize {
        self.counts.len()
    }

    /// Increment the bucket corresponding to the provided `value` by the
    /// provided `count`. Bucket counters saturate rather than wrap.
    pub fn increment(&mut self, value: u64, count: u64) -> Result<(), HistogramError> {
        if value > self.config.highest_trackable() {
            return Err(HistogramError::OutOfRange);
        }
        let index = self.config.index_for(value);
        self.counts[index] = self.counts[index].saturating_add(count);
        self.total_count = self.total_count.saturating_add(count);
        if value > self.max_value {
            self.max_value = value;
        }
        if value != 0 && value < self.min_non_zero {
            self.min_non_zero = value;
        }
        Ok(())
    }

    /// Increment the bucket for `value` and synthesize the samples a paced
    /// caller would have recorded had it not stalled for `value` time units:
    /// one additional count at each of `value - interval`,
    /// `value - 2 * interval`, ... while the result remains at or above
    /// `interval`. An `interval` of zero records only the value itself.
    pub fn increment_corrected(
        &mut self,
        value: u64,
        count: u64,
        interval: u64,
    ) -> Result<(), HistogramError> {
        self.increment(value, count)?;
        if interval == 0 || value <= interval {
            return Ok(());
        }
        let mut missing = value - interval;
        while missing >= interval {
            self.increment(missing, count)?;
            missing -= interval;
        }
        Ok(())
    }

    /// Clear all counts, tracked extremes, and timestamps.
    pub fn clear(&mut self) {
        for count in self.counts.iter_mut() {
            *count = 0;
        }
        self.total_count = 0;
        self.min_non_zero = u64::MAX;
        self.max_value = 0;
        self.start_timestamp_ms = i64::MAX;
        self.end_timestamp_ms = 0;
    }

    /// Return the total number of samples recorded.
    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    /// Return the largest recorded value, or zero if the histogram is empty.
    pub fn max(&self) -> u64 {
        self.max_value
    }

    /// Return the smallest recorded nonzero value, or zero if no nonzero
    /// values have been recorded.
    pub fn min_nonzero(&self) -> u64 {
        if self.min_non_zero == u64::MAX {
            0
        } else {
            self.min_non_zero
        }
    }

    /// Return the count recorded at values indistinguishable from `value`.
    pub fn count_at(&self, value: u64) -> Result<u64, HistogramError> {
        if value > self.config.highest_trackable() {
            return Err(HistogramError::OutOfRange);
        }
        Ok(self.counts[self.config.index_for(value)])
    }

    /// Return the total count recorded between `low` and `high`, inclusive
    /// of the full buckets containing each.
    pub fn count_between(&self, low: u64, high: u64) -> Result<u64, HistogramError> {
        if high > self.config.highest_trackable() {
            return Err(HistogramError::OutOfRange);
        }
        if low > high {
            return Ok(0);
        }
        let from = self.config.index_for(low);
        let to = self.config.index_for(high);
        Ok(self.counts[from..=to].iter().sum())
    }

    /// Return the value closest to the specified percentile. Percentile must
    /// be within the range 0.0 to 100.0. Returns an error if the histogram
    /// contains no samples.
    pub fn percentile(&self, percentile: f64) -> Result<u64, HistogramError> {
        if !(0.0..=100.0).contains(&percentile) {
            return Err(HistogramError::InvalidPercentile);
        }
        if self.total_count == 0 {
            return Err(HistogramError::Empty);
        }
        if percentile == 100.0 {
            return Ok(self.max_value);
        }
        let mut need = ((percentile / 100.0) * self.total_count as f64 + 0.5) as u64;
        need = need.clamp(1, self.total_count);

        let mut have = 0_u64;
        let mut highest_seen = 0_usize;
        for (index, count) in self.counts.iter().enumerate() {
            if *count > 0 {
                highest_seen = index;
                have += count;
                if have >= need {
                    return Ok(self.config.highest_equivalent(self.config.value_for(index)));
                }
            }
        }
        Ok(self.config.highest_equivalent(self.config.value_for(highest_seen)))
    }

    /// Return the mean of all recorded values, to bucket precision. Returns
    /// zero for an empty histogram.
    pub fn mean(&self) -> f64 {
        if self.total_count == 0 {
            return 0.0;
        }
        let mut sum = 0.0;
        for (index, count) in self.counts.iter().enumerate() {
            if *count > 0 {
                let value = self.config.median_equivalent(self.config.value_for(index));
                sum += *count as f64 * value as f64;
            }
        }
        sum / self.total_count as f64
    }

    /// Return the standard deviation of all recorded values, to bucket
    /// precision. Returns zero for an empty histogram.
    pub fn stddev(&self) -> f64 {
        if self.total_count == 0 {
            return 0.0;
        }
        let mean = self.mean();
        let mut sum = 0.0;
        for (index, count) in self.counts.iter().enumerate() {
            if *count > 0 {
                let value = self.config.median_equivalent(self.config.value_for(index));
                let deviation = value as f64 - mean;
                sum += *count as f64 * deviation * deviation;
            }
        }
        (sum / self.total_count as f64).sqrt()
    }

    /// Adds the other histogram to this histogram. Histograms with differing
    /// configurations are merged by value; the merge fails without modifying
    /// this histogram if the other holds counts beyond this histogram's
    /// range.
    pub fn add_assign(&mut self, other: &Self) -> Result<(), HistogramError> {
        if self.config == other.config {
            for (index, count) in other.counts.iter().enumerate() {
                self.counts[index] = self.counts[index].saturating_add(*count);
            }
            self.total_count = self.total_count.saturating_add(other.total_count);
            if other.max_value > self.max_value {
                self.max_value = other.max_value;
            }
            if other.min_non_zero < self.min_non_zero {
                self.min_non_zero = other.min_non_zero;
            }
        } else {
            if other.max_value > self.config.highest_trackable() {
                return Err(HistogramError::OutOfRange);
            }
            for (index, count) in other.counts.iter().enumerate() {
                if *count > 0 {
                    self.increment(other.config.value_for(index), *count)?;
                }
            }
        }
        if other.start_timestamp_ms < self.start_timestamp_ms {
            self.start_timestamp_ms = other.start_timestamp_ms;
        }
        if other.end_timestamp_ms > self.end_timestamp_ms {
            self.end_timestamp_ms = other.end_timestamp_ms;
        }
        Ok(())
    }

    /// Subtracts the other histogram from this histogram. Fails without
    /// modifying this histogram if any bucket would underflow or if the
    /// other holds counts beyond this histogram's range. Tracked extremes
    /// are re-derived from the surviving buckets afterwards.
    pub fn sub_assign(&mut self, other: &Self) -> Result<(), HistogramError> {
        if self.config == other.config {
            for (index, count) in other.counts.iter().enumerate() {
                if *count > self.counts[index] {
                    return Err(HistogramError::Underflow);
                }
            }
            for (index, count) in other.counts.iter().enumerate() {
                self.counts[index] -= count;
            }
            self.total_count = self.total_count.saturating_sub(other.total_count);
        } else {
            if other.max_value > self.config.highest_trackable() {
                return Err(HistogramError::OutOfRange);
            }
            // several of the other histogram's buckets may fold into one of
            // ours, so aggregate before validating
            let mut deltas = vec![0_u64; self.counts.len()];
            let mut removed = 0_u64;
            for (index, count) in other.counts.iter().enumerate() {
                if *count > 0 {
                    let target = self.config.index_for(other.config.value_for(index));
                    deltas[target] += count;
                    removed += count;
                }
            }
            for (index, delta) in deltas.iter().enumerate() {
                if *delta > self.counts[index] {
                    return Err(HistogramError::Underflow);
                }
            }
            for (index, delta) in deltas.iter().enumerate() {
                self.counts[index] -= delta;
            }
            self.total_count = self.total_count.saturating_sub(removed);
        }
        self.refresh_extremes();
        Ok(())
    }

    // re-derive min/max from occupied buckets; both become bucket-quantized
    fn refresh_extremes(&mut self) {
        self.max_value = 0;
        self.min_non_zero = u64::MAX;
        for (index, count) in self.counts.iter().enumerate() {
            if *count > 0 {
                let value = self.config.value_for(index);
                self.max_value = self.config.highest_equivalent(value);
                if value > 0 && value < self.min_non_zero {
                    self.min_non_zero = value;
                }
            }
        }
    }

    pub fn start_timestamp(&self) -> i64 {
        self.start_timestamp_ms
    }

    pub fn set_start_timestamp(&mut self, timestamp_ms: i64) {
        self.start_timestamp_ms = timestamp_ms;
    }

    pub fn end_timestamp(&self) -> i64 {
        self.end_timestamp_ms
    }

    pub fn set_end_timestamp(&mut self, timestamp_ms: i64) {
        self.end_timestamp_ms = timestamp_ms;
    }

    fn get_bucket(&self, index: usize) -> Option<Bucket> {
        if index >= self.counts.len() {
            return None;
        }
        let value = self.config.value_for(index);
        Some(Bucket {
            low: value,
            high: self.config.highest_equivalent(value),
            count: self.counts[index],
        })
    }
}

/// An iterator that allows walking through the buckets within a histogram.
pub struct Iter<'a> {
    inner: &'a Histogram,
    index: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = Bucket;

    fn next(&mut self) -> Option<Bucket> {
        let bucket = self.inner.get_bucket(self.index);
        self.index += 1;
        bucket
    }
}

impl<'a> IntoIterator for &'a Histogram {
    type Item = Bucket;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        Iter {
            inner: self,
            index: 0,
        }
    }
}
