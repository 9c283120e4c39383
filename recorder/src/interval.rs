// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use perfcommon_histogram::{AtomicHistogram, Config, Histogram};
use perfcommon_phaser::WriterReaderPhaser;

use crate::{next_instance_id, wall_clock_ms, RecorderError, FLIP_YIELD};

/// Records integer values into an active concurrent histogram while a reader
/// periodically takes consistent "delta since last read" snapshots.
///
/// Recording is wait-free: a phaser entry, an atomic load of the active
/// histogram, the record itself, and a phaser exit. Snapshot calls swap the
/// double-buffered histograms under the phaser's reader lock and block only
/// until writers already mid-record have finished.
pub struct IntervalRecorder {
    active: ArcSwap<AtomicHistogram>,
    inactive: Mutex<Option<Arc<AtomicHistogram>>>,
    phaser: WriterReaderPhaser,
    config: Config,
    instance_id: u64,
}

impl IntervalRecorder {
    /// Create a recorder covering the full trackable range `[1, 2^63]` with
    /// the provided precision.
    pub fn new(significant_digits: u8) -> Result<Self, RecorderError> {
        Self::with_range(1, 1 << 63, significant_digits)
    }

    /// Create a recorder for values from 1 to `max`.
    pub fn with_max(max: u64, significant_digits: u8) -> Result<Self, RecorderError> {
        Self::with_range(1, max, significant_digits)
    }

    /// Create a recorder for values from `lowest_discernible` to `max`.
    pub fn with_range(
        lowest_discernible: u64,
        max: u64,
        significant_digits: u8,
    ) -> Result<Self, RecorderError> {
        let config = Config::new(lowest_discernible, max, significant_digits)?;
        let instance_id = next_instance_id();
        let active = AtomicHistogram::with_instance_id(config, instance_id);
        active.set_start_timestamp(wall_clock_ms());
        let inactive = AtomicHistogram::with_instance_id(config, instance_id);
        Ok(Self {
            active: ArcSwap::from_pointee(active),
            inactive: Mutex::new(Some(Arc::new(inactive))),
            phaser: WriterReaderPhaser::new(),
            config,
            instance_id,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Record a single occurrence of `value`.
    pub fn record(&self, value: u64) -> Result<(), RecorderError> {
        self.record_n(value, 1)
    }

    /// Record `count` occurrences of `value`.
    pub fn record_n(&self, value: u64, count: u64) -> Result<(), RecorderError> {
        let _section = self.phaser.writer_critical_section();
        self.active.load().increment(value, count)?;
        Ok(())
    }

    /// Record `value` and synthesize the samples a paced caller would have
    /// recorded had it not stalled for `value` time units. See
    /// [`Histogram::increment_corrected`].
    pub fn record_correct(&self, value: u64, interval: u64) -> Result<(), RecorderError> {
        let _section = self.phaser.writer_critical_section();
        self.active.load().increment_corrected(value, 1, interval)?;
        Ok(())
    }

    /// Return the histogram of values recorded since the previous snapshot
    /// (or since construction). Ownership of the returned buffer transfers
    /// to the caller; it may be donated back via
    /// [`interval_histogram_recycling`](Self::interval_histogram_recycling).
    pub fn interval_histogram(&self) -> Arc<AtomicHistogram> {
        self.sample(None)
    }

    /// Like [`interval_histogram`](Self::interval_histogram), but reuses a
    /// previously returned snapshot instead of allocating. Fails if the
    /// buffer came from another recorder or does not match this recorder's
    /// configuration.
    pub fn interval_histogram_recycling(
        &self,
        recycle: Arc<AtomicHistogram>,
    ) -> Result<Arc<AtomicHistogram>, RecorderError> {
        if recycle.instance_id() != self.instance_id || *recycle.config() != self.config {
            return Err(RecorderError::Incompatible);
        }
        Ok(self.sample(Some(recycle)))
    }

    /// Copy the interval histogram into `target`, reusing the recorder's
    /// spare buffer so the steady state allocates nothing. The target must
    /// share this recorder's configuration.
    pub fn interval_histogram_into(&self, target: &mut Histogram) -> Result<(), RecorderError> {
        if *target.config() != self.config {
            return Err(RecorderError::Incompatible);
        }
        let previous = self.sample(None);
        target.clear();
        target.add_assign(&previous.load())?;
        *self.inactive.lock() = Some(previous);
        Ok(())
    }

    /// Discard everything recorded so far in both buffers. Records racing
    /// with the reset may be discarded with it.
    pub fn reset(&self) {
        log::debug!("resetting interval recorder {}", self.instance_id);
        let first = self.sample(None);
        let second = self.sample(Some(first));
        *self.inactive.lock() = Some(second);
    }

    // Swap `replacement` (or the spare, or a fresh allocation) in as the
    // active histogram and return the quiesced previous active. The phase
    // flip guarantees that no writer which observed the old active pointer
    // is still recording into it when this returns.
    fn sample(&self, replacement: Option<Arc<AtomicHistogram>>) -> Arc<AtomicHistogram> {
        let mut inactive = self.inactive.lock();
        let replacement = replacement.or_else(|| inactive.take()).unwrap_or_else(|| {
            log::trace!(
                "allocating fresh interval histogram for recorder {}",
                self.instance_id
            );
            Arc::new(AtomicHistogram::with_instance_id(
                self.config,
                self.instance_id,
            ))
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
