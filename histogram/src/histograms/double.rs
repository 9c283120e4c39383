// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;

use perfcommon_phaser::WriterReaderPhaser;

use crate::{AtomicHistogram, Config, HistogramError};

// reserved scale-word patterns; neither is the bit pattern of a usable
// power-of-two multiplier
const SCALE_UNSET: u64 = 0;
const SCALE_SHIFTING: u64 = u64::MAX;

const SHIFT_YIELD: Duration = Duration::from_micros(500);

/// A histogram of double-precision values spanning a configured ratio
/// between the largest and smallest values simultaneously trackable, with
/// the same bounded relative error as the integer histograms.
///
/// Values are scaled by a power-of-two multiplier into an embedded
/// [`AtomicHistogram`] covering `[1, S/2 * 2^(ceil(log2(ratio)) + 1)]`,
/// where `S` is the sub-bucket count. Every nonzero double maps to an
/// integer at or above `S/2`, which keeps the floor conversion within the
/// configured precision and makes window shifts exact slot translations.
///
/// The window places itself on the first nonzero record and slides
/// automatically when a record falls outside it. A slide drains in-flight
/// writers through an embedded [`WriterReaderPhaser`], translates the
/// occupied slots, and republishes the multiplier; writers racing the slide
/// spin until the new multiplier is published. Records that cannot fit in
/// the window together with already-recorded values fail with `OutOfRange`
/// and leave the histogram unchanged.
#[derive(Debug)]
pub struct AtomicDoubleHistogram {
    inner: AtomicHistogram,
    scale_bits: AtomicU64,
    ratio: u64,
    internal_ratio_magnitude: u32,
    phaser: WriterReaderPhaser,
}

impl AtomicDoubleHistogram {
    /// Create a new histogram able to track values across the provided
    /// ratio (at least 2) while preserving `significant_digits` digits of
    /// precision.
    pub fn new(ratio: u64, significant_digits: u8) -> Result<Self, HistogramError> {
        Self::with_instance_id(ratio, significant_digits, 0)
    }

    /// Create a new histogram stamped with an owning instance id, used by
    /// recorders to reject foreign recycle buffers.
    pub fn with_instance_id(
        ratio: u64,
        significant_digits: u8,
        instance_id: u64,
    ) -> Result<Self, HistogramError> {
        if ratio < 2 {
            return Err(HistogramError::InvalidConfig);
        }
        // one extra binary order of magnitude of headroom so a full-ratio
        // spread of values fits the window at once
        let internal_ratio_magnitude = 64 - (ratio - 1).leading_zeros() + 1;

        let largest_single_unit_resolution = 2 * 10_u64.pow(significant_digits.min(5) as u32);
        let sub_bucket_count_magnitude =
            64 - (largest_single_unit_resolution - 1).leading_zeros();
        let half_count_magnitude = sub_bucket_count_magnitude - 1;
        if half_count_magnitude + internal_ratio_magnitude > 62 {
            return Err(HistogramError::InvalidConfig);
        }
        let highest = (1_u64 << half_count_magnitude) << internal_ratio_magnitude;
        let config = Config::new(1, highest, significant_digits)?;

        Ok(Self {
            inner: AtomicHistogram::with_instance_id(config, instance_id),
            scale_bits: AtomicU64::new(SCALE_UNSET),
            ratio,
            internal_ratio_magnitude,
            phaser: WriterReaderPhaser::new(),
        })
    }

    /// Create an empty histogram with the same configuration as this one.
    /// The new histogram establishes its own window on first record.
    pub fn new_like(&self) -> Self {
        Self {
            inner: AtomicHistogram::with_instance_id(
                *self.inner.config(),
                self.inner.instance_id(),
            ),
            scale_bits: AtomicU64::new(SCALE_UNSET),
            ratio: self.ratio,
            internal_ratio_magnitude: self.internal_ratio_magnitude,
            phaser: WriterReaderPhaser::new(),
        }
    }

    /// Return the configured ratio between the largest and smallest values
    /// simultaneously trackable.
    pub fn ratio(&self) -> u64 {
        self.ratio
    }

    pub fn significant_digits(&self) -> u8 {
        self.inner.config().significant_digits()
    }

    pub fn instance_id(&self) -> u64 {
        self.inner.instance_id()
    }

    // smallest integer a nonzero double may map to
    fn lowest_tracking(&self) -> u64 {
        self.inner.config().sub_bucket_half_count() as u64
    }

    fn half_count_magnitude(&self) -> i32 {
        (self.inner.config().sub_bucket_count_magnitude() - 1) as i32
    }

    // exclusive upper bound of the integer window
    fn integer_bound(&self) -> u64 {
        self.lowest_tracking() << self.internal_ratio_magnitude
    }

    /// Increment the bucket corresponding to the provided `value` by the
    /// provided `count`, sliding the window first if the value falls
    /// outside it.
    pub fn increment(&self, value: f64, count: u64) -> Result<(), HistogramError> {
        if !value.is_finite() || value < 0.0 {
            return Err(HistogramError::OutOfRange);
        }
        loop {
            let bits = {
                let _section = self.phaser.writer_critical_section();
                if value == 0.0 {
                    // slot zero is scale-independent
                    return self.inner.increment(0, count);
                }
                let bits = self.scale_bits.load(Ordering::Acquire);
                if bits != SCALE_UNSET && bits != SCALE_SHIFTING {
                    let scaled = value * f64::from_bits(bits);
                    let integer_value = scaled as u64;
                    if integer_value >= self.lowest_tracking() && integer_value < self.integer_bound()
                    {
                        return self.inner.increment(integer_value, count);
                    }
                }
                bits
            };
            if bits == SCALE_SHIFTING {
                core::hint::spin_loop();
                continue;
            }
            self.adjust_window(value)?;
        }
    }

    /// Increment the bucket for `value` and synthesize the samples a paced
    /// caller would have recorded had it not stalled. See
    /// [`Histogram::increment_corrected`](crate::Histogram::increment_corrected).
    pub fn increment_corrected(
        &self,
        value: f64,
        count: u64,
        interval: f64,
    ) -> Result<(), HistogramError> {
        self.increment(value, count)?;
        if interval <= 0.0 {
            return Ok(());
        }
        let mut missing = value - interval;
        while missing >= interval {
            self.increment(missing, count)?;
            missing -= interval;
        }
        Ok(())
    }

    // Establish or slide the window so `value` fits, or fail with
    // `OutOfRange` when the occupied spread cannot follow. Runs under the
    // embedded phaser's reader lock; concurrent callers re-check and return
    // early when another adjuster already made room.
    fn adjust_window(&self, value: f64) -> Result<(), HistogramError> {
        let guard = self.phaser.reader_lock();
        let bits = self.scale_bits.load(Ordering::Acquire);

        if bits == SCALE_UNSET {
            let multiplier = checked_pow2(self.half_count_magnitude() - float_exponent(value))?;
            self.scale_bits
                .store(multiplier.to_bits(), Ordering::Release);
            return Ok(());
        }

        let multiplier = f64::from_bits(bits);
        let scaled = value * multiplier;
        let integer_value = scaled as u64;
        if integer_value >= self.lowest_tracking() && integer_value < self.integer_bound() {
            // another adjuster already made room
            return Ok(());
        }

        let current_exponent = float_exponent(multiplier);
        if scaled < self.lowest_tracking() as f64 {
            // window slides down: multiplier grows, recorded integers grow
            let new_exponent = self.half_count_magnitude() - float_exponent(value);
            let new_multiplier = checked_pow2(new_exponent)?;
            let magnitudes = (new_exponent - current_exponent) as u32;
            let max = self.inner.max();
            if max > self.inner.config().highest_trackable() >> magnitudes.min(63) {
                return Err(HistogramError::OutOfRange);
            }
            self.rescale(&guard, new_multiplier, |inner| inner.shift_left(magnitudes));
        } else {
            // window slides up: multiplier shrinks, recorded integers shrink
            let window_magnitude =
                self.half_count_magnitude() + self.internal_ratio_magnitude as i32;
            let magnitudes =
                (float_exponent(value) + 1 + current_exponent - window_magnitude) as u32;
            let new_multiplier = checked_pow2(current_exponent - magnitudes as i32)?;
            let min = self.inner.min_nonzero();
            if min != 0 && min >> magnitudes.min(63) < self.lowest_tracking() {
                return Err(HistogramError::OutOfRange);
            }
            self.rescale(&guard, new_multiplier, |inner| inner.shift_right(magnitudes));
        }
        Ok(())
    }

    fn rescale<F>(
        &self,
        guard: &perfcommon_phaser::PhaserReadGuard<'_>,
        new_multiplier: f64,
        shift: F,
    ) where
        F: FnOnce(&AtomicHistogram),
    {
        // writers that saw the old multiplier drain before slots move;
        // writers arriving later spin on the sentinel until the new
        // multiplier is published after the move
        self.scale_bits.store(SCALE_SHIFTING, Ordering::SeqCst);
        guard.flip_phase(SHIFT_YIELD);
        shift(&self.inner);
        self.scale_bits
            .store(new_multiplier.to_bits(), Ordering::SeqCst);
    }

    // the current multiplier, waiting out an in-progress slide; None until
    // the window has been established
    fn multiplier(&self) -> Option<f64> {
        loop {
            match self.scale_bits.load(Ordering::Acquire) {
                SCALE_UNSET => return None,
                SCALE_SHIFTING => core::hint::spin_loop(),
                bits => return Some(f64::from_bits(bits)),
            }
        }
    }

    fn to_double(&self, integer_value: u64) -> f64 {
        match self.multiplier() {
            Some(multiplier) => integer_value as f64 / multiplier,
            None => 0.0,
        }
    }

    /// Return the total number of samples recorded.
    pub fn total_count(&self) -> u64 {
        self.inner.total_count()
    }

    /// Return the largest recorded value, or zero if the histogram is empty.
    pub fn max(&self) -> f64 {
        self.to_double(self.inner.max())
    }

    /// Return the smallest recorded nonzero value, or zero if no nonzero
    /// values have been recorded.
    pub fn min_nonzero(&self) -> f64 {
        self.to_double(self.inner.min_nonzero())
    }

    /// Return the value closest to the specified percentile. Percentile must
    /// be within the range 0.0 to 100.0. Returns an error if the histogram
    /// contains no samples.
    pub fn percentile(&self, percentile: f64) -> Result<f64, HistogramError> {
        let integer_value = self.inner.percentile(percentile)?;
        Ok(self.to_double(integer_value))
    }

    /// Return the mean of all recorded values, to bucket precision.
    pub fn mean(&self) -> f64 {
        match self.multiplier() {
            Some(multiplier) => self.inner.mean() / multiplier,
            None => 0.0,
        }
    }

    /// Return the standard deviation of all recorded values, to bucket
    /// precision.
    pub fn stddev(&self) -> f64 {
        match self.multiplier() {
            Some(multiplier) => self.inner.stddev() / multiplier,
            None => 0.0,
        }
    }

    /// Return the count recorded at values indistinguishable from `value`.
    /// Values outside the current window have a count of zero.
    pub fn count_at(&self, value: f64) -> Result<u64, HistogramError> {
        if !value.is_finite() || value < 0.0 {
            return Err(HistogramError::OutOfRange);
        }
        if value == 0.0 {
            return self.inner.count_at(0);
        }
        let multiplier = match self.multiplier() {
            Some(multiplier) => multiplier,
            None => return Ok(0),
        };
        let integer_value = (value * multiplier) as u64;
        if integer_value < self.lowest_tracking() || integer_value >= self.integer_bound() {
            return Ok(0);
        }
        self.inner.count_at(integer_value)
    }

    /// Adds the other histogram to this histogram, re-recording its buckets
    /// by value. May slide this histogram's window; fails if the combined
    /// spread of values exceeds this histogram's ratio.
    pub fn add_assign(&self, other: &Self) -> Result<(), HistogramError> {
        let zeros = other.inner.count_at(0)?;
        if zeros > 0 {
            self.inner.increment(0, zeros)?;
        }
        let multiplier = match other.multiplier() {
            Some(multiplier) => multiplier,
            None => return Ok(()),
        };
        for bucket in &other.inner {
            if bucket.count() > 0 && bucket.low() > 0 {
                self.increment(bucket.low() as f64 / multiplier, bucket.count())?;
            }
        }
        Ok(())
    }

    /// Clear all counts, tracked extremes, and timestamps. The established
    /// window is kept, so a cleared histogram records at the same scale it
    /// did before.
    pub fn clear(&self) {
        self.inner.clear();
    }

    pub fn start_timestamp(&self) -> i64 {
        self.inner.start_timestamp()
    }

    pub fn set_start_timestamp(&self, timestamp_ms: i64) {
        self.inner.set_start_timestamp(timestamp_ms);
    }

    pub fn end_timestamp(&self) -> i64 {
        self.inner.end_timestamp()
    }

    pub fn set_end_timestamp(&self, timestamp_ms: i64) {
        self.inner.set_end_timestamp(timestamp_ms);
    }
}

// floor(log2(value)) for positive finite values
fn float_exponent(value: f64) -> i32 {
    let biased = ((value.to_bits() >> 52) & 0x7ff) as i32;
    if biased == 0 {
        // subnormal
        value.log2().floor() as i32
    } else {
        biased - 1023
    }
}

// 2^exponent, restricted to the normal range so the scale word is never
// zero, infinite, or subnormal
fn checked_pow2(exponent: i32) -> Result<f64, HistogramError> {
    if !(-1022..=1023).contains(&exponent) {
        return Err(HistogramError::OutOfRange);
    }
    Ok(2_f64.powi(exponent))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_within(actual: f64, expected: f64, tolerance: f64) {
        assert!(
            (actual - expected).abs() <= expected.abs() * tolerance,
            "{} not within {} of {}",
            actual,
            tolerance,
            expected
        );
    }

    #[test]
    fn float_exponents() {
        assert_eq!(float_exponent(1.0), 0);
        assert_eq!(float_exponent(1.5), 0);
        assert_eq!(float_exponent(2.0), 1);
        assert_eq!(float_exponent(0.5), -1);
        assert_eq!(float_exponent(1e-3), -10);
        assert_eq!(float_exponent(1e6), 19);
    }

    #[test]
    fn values_across_the_full_ratio_round_trip() {
        let h = AtomicDoubleHistogram::new(1_000_000_000, 2).unwrap();
        h.increment(1e-3, 1).unwrap();
        h.increment(1e6, 1).unwrap();
        assert_eq!(h.total_count(), 2);
        assert_within(h.percentile(25.0).unwrap(), 1e-3, 0.01);
        assert_within(h.percentile(100.0).unwrap(), 1e6, 0.01);
        assert_within(h.min_nonzero(), 1e-3, 0.01);
        assert_within(h.max(), 1e6, 0.01);
    }

    #[test]
    fn window_slides_down_for_smaller_values() {
        let h = AtomicDoubleHistogram::new(1_000_000_000, 2).unwrap();
        h.increment(1.0, 1).unwrap();
        // forces a shift of the existing contents
        h.increment(1e-6, 1).unwrap();
        assert_eq!(h.total_count(), 2);
        assert_within(h.percentile(100.0).unwrap(), 1.0, 0.01);
        assert_within(h.min_nonzero(), 1e-6, 0.01);
        assert!(h.count_at(1.0).unwrap() == 1);
        assert!(h.count_at(1e-6).unwrap() == 1);
    }

    #[test]
    fn larger_values_within_ratio_fit_the_headroom() {
        // the window's extra binary order of magnitude means values above
        // the established bottom never need a slide while within the ratio
        let h = AtomicDoubleHistogram::new(1_000_000, 2).unwrap();
        h.increment(1.0, 1).unwrap();
        h.increment(50_000.0, 1).unwrap();
        assert_eq!(h.total_count(), 2);
        assert_within(h.percentile(50.0).unwrap(), 1.0, 0.01);
        assert_within(h.percentile(100.0).unwrap(), 50_000.0, 0.01);
    }

    #[test]
    fn spread_beyond_ratio_fails_without_losing_state() {
        let h = AtomicDoubleHistogram::new(1_000, 2).unwrap();
        h.increment(1.0, 1).unwrap();
        assert_eq!(
            h.increment(1e9, 1).unwrap_err(),
            HistogramError::OutOfRange
        );
        assert_eq!(
            h.increment(1e-9, 1).unwrap_err(),
            HistogramError::OutOfRange
        );
        assert_eq!(h.total_count(), 1);
        assert_within(h.max(), 1.0, 0.01);
    }

    #[test]
    fn zero_values_survive_window_slides() {
        let h = AtomicDoubleHistogram::new(1_000_000, 3).unwrap();
        h.increment(0.0, 5).unwrap();
        h.increment(100.0, 1).unwrap();
        h.increment(0.5, 1).unwrap();
        assert_eq!(h.count_at(0.0).unwrap(), 5);
        assert_eq!(h.total_count(), 7);
        assert_eq!(h.percentile(0.0).unwrap(), 0.0);
    }

    #[test]
    fn invalid_values_fail() {
        let h = AtomicDoubleHistogram::new(1_000, 2).unwrap();
        assert!(h.increment(-1.0, 1).is_err());
        assert!(h.increment(f64::NAN, 1).is_err());
        assert!(h.increment(f64::INFINITY, 1).is_err());
        assert!(AtomicDoubleHistogram::new(1, 2).is_err());
    }

    #[test]
    fn corrected_increment_synthesizes_phantoms() {
        let h = AtomicDoubleHistogram::new(1_000_000, 3).unwrap();
        h.increment_corrected(10.0, 1, 1.0).unwrap();
        assert_eq!(h.total_count(), 10);
        assert_within(h.percentile(100.0).unwrap(), 10.0, 0.001);
        assert_within(h.percentile(5.0).unwrap(), 1.0, 0.001);
    }

    #[test]
    fn precision_holds_across_a_wide_spread() {
        let h = AtomicDoubleHistogram::new(1 << 40, 3).unwrap();
        let values = [1e-4, 3.9, 250.0, 8.1e4];
        for value in values {
            h.increment(value, 1).unwrap();
        }
        for value in values {
            assert!(h.count_at(value).unwrap() >= 1, "lost {}", value);
        }
        assert_within(h.mean(), values.iter().sum::<f64>() / 4.0, 0.01);
    }

    #[test]
    fn add_assign_re_records_by_value() {
        let a = AtomicDoubleHistogram::new(1_000_000, 3).unwrap();
        let b = AtomicDoubleHistogram::new(1_000_000, 3).unwrap();
        a.increment(2.0, 1).unwrap();
        b.increment(1_000.0, 2).unwrap();
        b.increment(0.0, 1).unwrap();
        a.add_assign(&b).unwrap();
        assert_eq!(a.total_count(), 4);
        assert_within(a.percentile(100.0).unwrap(), 1_000.0, 0.01);
        assert_eq!(a.count_at(0.0).unwrap(), 1);
    }
}
