// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use perfcommon_histogram::AtomicDoubleHistogram;
use perfcommon_phaser::WriterReaderPhaser;

use crate::{next_instance_id, wall_clock_ms, RecorderError, FLIP_YIELD};

// dynamic range provided by the digits-only constructor
const DEFAULT_RATIO: u64 = 1 << 40;

/// Records double-precision values into an active concurrent histogram while
/// a reader periodically takes consistent "delta since last read" snapshots.
///
/// The double-buffered histograms slide their value windows independently;
/// each snapshot carries its own scale, so aggregating across snapshots is
/// done by value rather than by bucket.
pub struct DoubleIntervalRecorder {
    active: ArcSwap<AtomicDoubleHistogram>,
    inactive: Mutex<Option<Arc<AtomicDoubleHistogram>>>,
    phaser: WriterReaderPhaser,
    ratio: u64,
    significant_digits: u8,
    instance_id: u64,
}

impl DoubleIntervalRecorder {
    /// Create a recorder covering a dynamic range of `2^40` between the
    /// smallest and largest values simultaneously trackable, with the
    /// provided precision.
    pub fn new(significant_digits: u8) -> Result<Self, RecorderError> {
        Self::with_ratio(DEFAULT_RATIO, significant_digits)
    }

    /// Create a recorder whose trackable values span the provided ratio (at
    /// least 2) between the largest and smallest.
    pub fn with_ratio(ratio: u64, significant_digits: u8) -> Result<Self, RecorderError> {
        let instance_id = next_instance_id();
        let active =
            AtomicDoubleHistogram::with_instance_id(ratio, significant_digits, instance_id)?;
        active.set_start_timestamp(wall_clock_ms());
        let inactive =
            AtomicDoubleHistogram::with_instance_id(ratio, significant_digits, instance_id)?;
        Ok(Self {
            active: ArcSwap::from_pointee(active),
            inactive: Mutex::new(Some(Arc::new(inactive))),
            phaser: WriterReaderPhaser::new(),
            ratio,
            significant_digits,
            instance_id,
        })
    }

    pub fn ratio(&self) -> u64 {
        self.ratio
    }

    pub fn significant_digits(&self) -> u8 {
        self.significant_digits
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Record a single occurrence of `value`.
    pub fn record(&self, value: f64) -> Result<(), RecorderError> {
        self.record_n(value, 1)
    }

    /// Record `count` occurrences of `value`.
    pub fn record_n(&self, value: f64, count: u64) -> Result<(), RecorderError> {
        let _section = self.phaser.writer_critical_section();
        self.active.load().increment(value, count)?;
        Ok(())
    }

    /// Record `value` and synthesize the samples a paced caller would have
    /// recorded had it not stalled for `value` time units.
    pub fn record_correct(&self, value: f64, interval: f64) -> Result<(), RecorderError> {
        let _section = self.phaser.writer_critical_section();
        self.active.load().increment_corrected(value, 1, interval)?;
        Ok(())
    }

    /// Return the histogram of values recorded since the previous snapshot
    /// (or since construction). Ownership of the returned buffer transfers
    /// to the caller; it may be donated back via
    /// [`interval_histogram_recycling`](Self::interval_histogram_recycling).
    pub fn interval_histogram(&self) -> Arc<AtomicDoubleHistogram> {
        self.sample(None)
    }

    /// Like [`interval_histogram`](Self::interval_histogram), but reuses a
    /// previously returned snapshot instead of allocating. Fails if the
    /// buffer came from another recorder or does not match this recorder's
    /// ratio and precision.
    pub fn interval_histogram_recycling(
        &self,
        recycle: Arc<AtomicDoubleHistogram>,
    ) -> Result<Arc<AtomicDoubleHistogram>, RecorderError> {
        if recycle.instance_id() != self.instance_id
            || recycle.ratio() != self.ratio
            || recycle.significant_digits() != self.significant_digits
        {
            return Err(RecorderError::Incompatible);
        }
        Ok(self.sample(Some(recycle)))
    }

    /// Discard everything recorded so far in both buffers. Records racing
    /// with the reset may be discarded with it.
    pub fn reset(&self) {
        log::debug!("resetting double interval recorder {}", self.instance_id);
        let first = self.sample(None);
        let second = self.sample(Some(first));
        *self.inactive.lock() = Some(second);
    }

    fn sample(&self, replacement: Option<Arc<AtomicDoubleHistogram>>) -> Arc<AtomicDoubleHistogram> {
        let mut inactive = self.inactive.lock();
        let replacement = replacement.or_else(|| inactive.take()).unwrap_or_else(|| {
            log::trace!(
                "allocating fresh double interval histogram for recorder {}",
                self.instance_id
            );
            Arc::new(self.active.load().new_like())
        });

        let read = self.phaser.reader_lock();
        replacement.clear();
        let now = wall_clock_ms();
        replacement.set_start_timestamp(now);
        let previous = self.active.swap(replacement);
        previous.set_end_timestamp(now);
        read.flip_phase(FLIP_YIELD);
        drop(read);

        *inactive = None;
        previous
    }
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
    fn records_appear_in_the_next_snapshot() {
        let recorder = DoubleIntervalRecorder::with_ratio(1_000_000_000, 2).unwrap();
        recorder.record(1e-3).unwrap();
        recorder.record(1e6).unwrap();
        let snapshot = recorder.interval_histogram();
        assert_eq!(snapshot.total_count(), 2);
        assert_within(snapshot.percentile(100.0).unwrap(), 1e6, 0.01);
        assert_within(snapshot.min_nonzero(), 1e-3, 0.01);
    }

    #[test]
    fn snapshots_are_deltas() {
        let recorder = DoubleIntervalRecorder::new(3).unwrap();
        recorder.record(1.5).unwrap();
        let first = recorder.interval_histogram();
        assert_eq!(first.total_count(), 1);

        recorder.record(2.5).unwrap();
        recorder.record(3.5).unwrap();
        let second = recorder.interval_histogram();
        assert_eq!(second.total_count(), 2);
    }

    #[test]
    fn recycled_buffers_keep_their_window_but_lose_their_counts() {
        let recorder = DoubleIntervalRecorder::with_ratio(1_000_000, 3).unwrap();
        recorder.record(100.0).unwrap();
        let first = recorder.interval_histogram();
        assert_eq!(first.total_count(), 1);

        recorder.record(200.0).unwrap();
        let second = recorder.interval_histogram_recycling(first).unwrap();
        assert_eq!(second.total_count(), 1);
        assert_within(second.percentile(100.0).unwrap(), 200.0, 0.01);
    }

    #[test]
    fn foreign_buffers_are_rejected() {
        let a = DoubleIntervalRecorder::with_ratio(1_000_000, 3).unwrap();
        let b = DoubleIntervalRecorder::with_ratio(1_000_000, 3).unwrap();
        let snapshot = a.interval_histogram();
        assert_eq!(
            b.interval_histogram_recycling(snapshot).unwrap_err(),
            RecorderError::Incompatible
        );
    }

    #[test]
    fn correction_is_applied_in_the_recorder() {
        let recorder = DoubleIntervalRecorder::with_ratio(1_000_000, 3).unwrap();
        recorder.record_correct(10.0, 1.0).unwrap();
        let snapshot = recorder.interval_histogram();
        assert_eq!(snapshot.total_count(), 10);
    }

    #[test]
    fn reset_discards_recorded_values() {
        let recorder = DoubleIntervalRecorder::new(2).unwrap();
        recorder.record(5.0).unwrap();
        recorder.reset();
        recorder.record(6.0).unwrap();
        let snapshot = recorder.interval_histogram();
        assert_eq!(snapshot.total_count(), 1);
    }

    #[test]
    fn spread_beyond_ratio_is_surfaced() {
        let recorder = DoubleIntervalRecorder::with_ratio(1_000, 2).unwrap();
        recorder.record(1.0).unwrap();
        assert_eq!(recorder.record(1e9).unwrap_err(), RecorderError::OutOfRange);
    }
}
