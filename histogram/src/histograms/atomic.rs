// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::{Bucket, Config, Histogram, HistogramError};

/// A histogram which may be concurrently modified across threads because it
/// uses atomic counters. Recording is a relaxed fetch-add on the bucket
/// followed by one on the total; tracked extremes are maintained with
/// compare-exchange loops.
///
/// Queries performed while writers are active see a best-effort view: bucket
/// counts and the total may briefly disagree. Callers needing a consistent
/// view should quiesce writers first, which is what
/// `perfcommon-recorder` arranges with its phase flips.
#[derive(Debug)]
pub struct AtomicHistogram {
    pub(crate) config: Config,
    pub(crate) counts: Box<[AtomicU64]>,
    pub(crate) total_count: AtomicU64,
    pub(crate) min_non_zero: AtomicU64,
    pub(crate) max_value: AtomicU64,
    pub(crate) start_timestamp_ms: AtomicI64,
    pub(crate) end_timestamp_ms: AtomicI64,
    pub(crate) instance_id: u64,
}

impl AtomicHistogram {
    /// Create a new atomic histogram which stores values from 1 to `max`
    /// while preserving `significant_digits` digits of precision.
    pub fn new(max: u64, significant_digits: u8) -> Result<Self, HistogramError> {
        Self::with_range(1, max, significant_digits)
    }

    /// Create a new atomic histogram with a configurable floor below which
    /// values are indistinguishable from one another.
    pub fn with_range(
        lowest_discernible: u64,
        max: u64,
        significant_digits: u8,
    ) -> Result<Self, HistogramError> {
        Config::new(lowest_discernible, max, significant_digits)
            .map(|config| Self::with_instance_id(config, 0))
    }

    /// Create a new atomic histogram from an already-derived bucket layout.
    pub fn from_config(config: Config) -> Self {
        Self::with_instance_id(config, 0)
    }

    /// Create a new atomic histogram stamped with an owning instance id,
    /// used by recorders to reject foreign recycle buffers.
    pub fn with_instance_id(config: Config, instance_id: u64) -> Self {
        let mut counts = Vec::with_capacity(config.counts_len());
        counts.resize_with(config.counts_len(), || AtomicU64::new(0));
        Self {
            config,
            counts: counts.into_boxed_slice(),
            total_count: AtomicU64::new(0),
            min_non_zero: AtomicU64::new(u64::MAX),
            max_value: AtomicU64::new(0),
            start_timestamp_ms: AtomicI64::new(i64::MAX),
            end_timestamp_ms: AtomicI64::new(0),
            instance_id,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Return the id of the recorder instance which owns this histogram, or
    /// zero for a free-standing histogram.
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Return the number of buckets stored within the histogram.
    pub fn buckets(&self) -> usize {
        self.counts.len()
    }

    /// Increment the bucket corresponding to the provided `value` by the
    /// provided `count`.
    pub fn increment(&self, value: u64, count: u64) -> Result<(), HistogramError> {
        if value > self.config.highest_trackable() {
            return Err(HistogramError::OutOfRange);
        }
        let index = self.config.index_for(value);
        self.counts[index].fetch_add(count, Ordering::Relaxed);
        self.total_count.fetch_add(count, Ordering::Relaxed);
        self.track_extremes(value);
        Ok(())
    }

    /// Increment the bucket for `value` and synthesize the samples a paced
    /// caller would have recorded had it not stalled. See
    /// [`Histogram::increment_corrected`].
    pub fn increment_corrected(
        &self,
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

    fn track_extremes(&self, value: u64) {
        let mut max = self.max_value.load(Ordering::Relaxed);
        while value > max {
            match self.max_value.compare_exchange_weak(
                max,
                value,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => max = current,
            }
        }
        if value == 0 {
            return;
        }
        let mut min = self.min_non_zero.load(Ordering::Relaxed);
        while value < min {
            match self.min_non_zero.compare_exchange_weak(
                min,
                value,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => min = current,
            }
        }
    }

    /// Clear all counts, tracked extremes, and timestamps.
    pub fn clear(&self) {
        for count in self.counts.iter() {
            count.store(0, Ordering::Relaxed);
        }
        self.total_count.store(0, Ordering::Relaxed);
        self.min_non_zero.store(u64::MAX, Ordering::Relaxed);
        self.max_value.store(0, Ordering::Relaxed);
        self.start_timestamp_ms.store(i64::MAX, Ordering::Relaxed);
        self.end_timestamp_ms.store(0, Ordering::Relaxed);
    }

    /// Return the total number of samples recorded.
    pub fn total_count(&self) -> u64 {
        self.total_count.load(Ordering::Relaxed)
    }

    /// Return the largest recorded value, or zero if the histogram is empty.
    pub fn max(&self) -> u64 {
        self.max_value.load(Ordering::Relaxed)
    }

    /// Return the smallest recorded nonzero value, or zero if no nonzero
    /// values have been recorded.
    pub fn min_nonzero(&self) -> u64 {
        let min = self.min_non_zero.load(Ordering::Relaxed);
        if min == u64::MAX {
            0
        } else {
            min
        }
    }

    /// Return the count recorded at values indistinguishable from `value`.
    pub fn count_at(&self, value: u64) -> Result<u64, HistogramError> {
        if value > self.config.highest_trackable() {
            return Err(HistogramError::OutOfRange);
        }
        Ok(self.counts[self.config.index_for(value)].load(Ordering::Relaxed))
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
        Ok(self.counts[from..=to]
            .iter()
            .map(|count| count.load(Ordering::Relaxed))
            .sum())
    }

    /// Return the value closest to the specified percentile. Percentile must
    /// be within the range 0.0 to 100.0. Returns an error if the histogram
    /// contains no samples.
    pub fn percentile(&self, percentile: f64) -> Result<u64, HistogramError> {
        if !(0.0..=100.0).contains(&percentile) {
            return Err(HistogramError::InvalidPercentile);
        }
        let total = self.total_count.load(Ordering::Relaxed);
        if total == 0 {
            return Err(HistogramError::Empty);
        }
        if percentile == 100.0 {
            return Ok(self.max());
        }
        let mut need = ((percentile / 100.0) * total as f64 + 0.5) as u64;
        need = need.clamp(1, total);

        let mut have = 0_u64;
        let mut highest_seen = 0_usize;
        for (index, count) in self.counts.iter().enumerate() {
            let count = count.load(Ordering::Relaxed);
            if count > 0 {
                highest_seen = index;
                have += count;
                if have >= need {
                    return Ok(self.config.highest_equivalent(self.config.value_for(index)));
                }
            }
        }
        // reachable only when racing writers; report the highest occupied
        // bucket seen while walking
        Ok(self.config.highest_equivalent(self.config.value_for(highest_seen)))
    }

    /// Return the mean of all recorded values, to bucket precision. Returns
    /// zero for an empty histogram.
    pub fn mean(&self) -> f64 {
        let total = self.total_count.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        let mut sum = 0.0;
        for (index, count) in self.counts.iter().enumerate() {
            let count = count.load(Ordering::Relaxed);
            if count > 0 {
                let value = self.config.median_equivalent(self.config.value_for(index));
                sum += count as f64 * value as f64;
            }
        }
        sum / total as f64
    }

    /// Return the standard deviation of all recorded values, to bucket
    /// precision. Returns zero for an empty histogram.
    pub fn stddev(&self) -> f64 {
        let total = self.total_count.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        let mean = self.mean();
        let mut sum = 0.0;
        for (index, count) in self.counts.iter().enumerate() {
            let count = count.load(Ordering::Relaxed);
            if count > 0 {
                let value = self.config.median_equivalent(self.config.value_for(index));
                let deviation = value as f64 - mean;
                sum += count as f64 * deviation * deviation;
            }
        }
        (sum / total as f64).sqrt()
    }

    /// Adds the other histogram to this histogram. Histograms with differing
    /// configurations are merged by value; the merge fails without modifying
    /// this histogram if the other holds counts beyond this histogram's
    /// range.
    pub fn add_assign(&self, other: &Self) -> Result<(), HistogramError> {
        if self.config == other.config {
            for (index, count) in other.counts.iter().enumerate() {
                let count = count.load(Ordering::Relaxed);
                if count > 0 {
                    self.counts[index].fetch_add(count, Ordering::Relaxed);
                }
            }
            self.total_count
                .fetch_add(other.total_count.load(Ordering::Relaxed), Ordering::Relaxed);
            self.track_extremes(other.max());
            let min = other.min_nonzero();
            if min != 0 {
                self.track_extremes(min);
            }
        } else {
            if other.max() > self.config.highest_trackable() {
                return Err(HistogramError::OutOfRange);
            }
            for (index, count) in other.counts.iter().enumerate() {
                let count = count.load(Ordering::Relaxed);
                if count > 0 {
                    self.increment(other.config.value_for(index), count)?;
                }
            }
        }
        Ok(())
    }

    /// Convert this histogram to a non-atomic copy, including totals,
    /// extremes, and timestamps.
    ///
    /// Note: users needing a consistent copy should ensure that no other
    /// threads are writing to the histogram while this operation is
    /// in-progress.
    pub fn load(&self) -> Histogram {
        let mut result = Histogram::from_config(self.config);
        for (index, count) in self.counts.iter().enumerate() {
            result.counts[index] = count.load(Ordering::Relaxed);
        }
        result.total_count = self.total_count.load(Ordering::Relaxed);
        result.min_non_zero = self.min_non_zero.load(Ordering::Relaxed);
        result.max_value = self.max_value.load(Ordering::Relaxed);
        result.start_timestamp_ms = self.start_timestamp_ms.load(Ordering::Relaxed);
        result.end_timestamp_ms = self.end_timestamp_ms.load(Ordering::Relaxed);
        result
    }

    pub fn start_timestamp(&self) -> i64 {
        self.start_timestamp_ms.load(Ordering::Relaxed)
    }

    pub fn set_start_timestamp(&self, timestamp_ms: i64) {
        self.start_timestamp_ms.store(timestamp_ms, Ordering::Relaxed);
    }

    pub fn end_timestamp(&self) -> i64 {
        self.end_timestamp_ms.load(Ordering::Relaxed)
    }

    pub fn set_end_timestamp(&self, timestamp_ms: i64) {
        self.end_timestamp_ms.store(timestamp_ms, Ordering::Relaxed);
    }

    /// Shift all occupied slots up by `magnitudes` binary orders of
    /// magnitude, multiplying every recorded value by `2^magnitudes`.
    ///
    /// The caller must have quiesced writers and verified that
    /// `max() << magnitudes` remains trackable. Slots below the top half of
    /// bucket zero, other than the zero-value slot, must be empty; this holds
    /// for the double histogram mapping, which is the only caller.
    pub(crate) fn shift_left(&self, magnitudes: u32) {
        let half_count = self.config.sub_bucket_half_count() as usize;
        let offset = magnitudes as usize * half_count;
        for index in (half_count..self.counts.len()).rev() {
            let count = self.counts[index].load(Ordering::Relaxed);
            if count > 0 {
                debug_assert!(index + offset < self.counts.len());
                self.counts[index + offset].store(count, Ordering::Relaxed);
                self.counts[index].store(0, Ordering::Relaxed);
            }
        }
        let max = self.max_value.load(Ordering::Relaxed);
        if max > 0 {
            self.max_value.store(max << magnitudes, Ordering::Relaxed);
        }
        let min = self.min_non_zero.load(Ordering::Relaxed);
        if min != u64::MAX {
            self.min_non_zero.store(min << magnitudes, Ordering::Relaxed);
        }
    }

    /// Shift all occupied slots down by `magnitudes` binary orders of
    /// magnitude, dividing every recorded value by `2^magnitudes`.
    ///
    /// The caller must have quiesced writers and verified that
    /// `min_nonzero() >> magnitudes` stays within the top half of bucket
    /// zero, which keeps the slot translation exact.
    pub(crate) fn shift_right(&self, magnitudes: u32) {
        let half_count = self.config.sub_bucket_half_count() as usize;
        let offset = magnitudes as usize * half_count;
        for index in (half_count + offset)..self.counts.len() {
            let count = self.counts[index].load(Ordering::Relaxed);
            if count > 0 {
                self.counts[index - offset].store(count, Ordering::Relaxed);
                self.counts[index].store(0, Ordering::Relaxed);
            }
        }
        let max = self.max_value.load(Ordering::Relaxed);
        if max > 0 {
            self.max_value.store(max >> magnitudes, Ordering::Relaxed);
        }
        let min = self.min_non_zero.load(Ordering::Relaxed);
        if min != u64::MAX {
            self.min_non_zero.store(min >> magnitudes, Ordering::Relaxed);
        }
    }

    fn get_bucket(&self, index: usize) -> Option<Bucket> {
        if index >= self.counts.len() {
            return None;
        }
        let value = self.config.value_for(index);
        Some(Bucket {
            low: value,
            high: self.config.highest_equivalent(value),
            count: self.counts[index].load(Ordering::Relaxed),
        })
    }
}

/// An iterator that allows walking through the buckets within an atomic
/// histogram.
pub struct Iter<'a> {
    inner: &'a AtomicHistogram,
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

impl<'a> IntoIterator for &'a AtomicHistogram {
    type Item = Bucket;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        Iter {
            inner: self,
            index: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn concurrent_increments_are_counted_exactly() {
        let histogram = Arc::new(AtomicHistogram::new(1_000_000, 3).unwrap());
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let histogram = histogram.clone();
                std::thread::spawn(move || {
                    for _ in 0..100_000 {
                        histogram.increment(42, 1).unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(histogram.total_count(), 400_000);
        assert_eq!(histogram.count_at(42).unwrap(), 400_000);
        assert_eq!(histogram.max(), 42);
        assert_eq!(histogram.min_nonzero(), 42);
    }

    #[test]
    fn load_copies_exactly() {
        let histogram = AtomicHistogram::new(1_000_000, 3).unwrap();
        histogram.increment(1, 1).unwrap();
        histogram.increment(999_999, 3).unwrap();
        histogram.set_start_timestamp(100);
        histogram.set_end_timestamp(200);

        let copy = histogram.load();
        assert_eq!(copy.total_count(), 4);
        assert_eq!(copy.max(), 999_999);
        assert_eq!(copy.min_nonzero(), 1);
        assert_eq!(copy.start_timestamp(), 100);
        assert_eq!(copy.end_timestamp(), 200);
        assert_eq!(copy.count_at(999_999).unwrap(), 3);
    }

    #[test]
    fn clear_resets_all_state() {
        let histogram = AtomicHistogram::new(1_000_000, 3).unwrap();
        histogram.increment(500, 2).unwrap();
        histogram.clear();
        assert_eq!(histogram.total_count(), 0);
        assert_eq!(histogram.max(), 0);
        assert_eq!(histogram.min_nonzero(), 0);
        assert_eq!(histogram.percentile(50.0).unwrap_err(), HistogramError::Empty);
    }

    #[test]
    fn add_assign_matching_configs() {
        let a = AtomicHistogram::new(1_000_000, 3).unwrap();
        let b = AtomicHistogram::new(1_000_000, 3).unwrap();
        a.increment(100, 1).unwrap();
        b.increment(200, 2).unwrap();
        a.add_assign(&b).unwrap();
        assert_eq!(a.total_count(), 3);
        assert_eq!(a.max(), 200);
        assert_eq!(a.min_nonzero(), 100);
    }

    #[test]
    fn shift_left_then_right_round_trips() {
        let histogram = AtomicHistogram::new(1 << 40, 2).unwrap();
        let half = histogram.config().sub_bucket_half_count() as u64;
        // occupy only the upper halves, as the double mapping guarantees
        let values = [half, half + 3, half * 2, half * 700];
        for value in values {
            histogram.increment(value, 1).unwrap();
        }
        histogram.shift_left(3);
        assert_eq!(histogram.max(), half * 700 << 3);
        assert_eq!(histogram.min_nonzero(), half << 3);
        for value in values {
            assert_eq!(histogram.count_at(value << 3).unwrap(), 1);
        }
        histogram.shift_right(3);
        for value in values {
            assert_eq!(histogram.count_at(value).unwrap(), 1);
        }
        assert_eq!(histogram.total_count(), 4);
    }
}
