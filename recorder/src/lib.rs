// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Interval sampling recorders.
//!
//! A recorder pairs two structurally identical concurrent histograms with a
//! [`WriterReaderPhaser`](perfcommon_phaser::WriterReaderPhaser). Any number
//! of threads record into the active histogram without ever taking a lock; a
//! reader asks for an interval histogram, which swaps the buffers, waits for
//! in-flight writers to drain, and hands back the now-quiesced previous
//! active histogram holding the delta since the previous snapshot.
//!
//! Every record call that returns before a snapshot is requested is counted
//! in exactly one returned snapshot. Returned snapshots may be donated back
//! on a later snapshot call to avoid allocation.

mod double;
mod error;
mod interval;

pub use double::DoubleIntervalRecorder;
pub use error::RecorderError;
pub use interval::IntervalRecorder;

pub use perfcommon_histogram::{
    AtomicDoubleHistogram, AtomicHistogram, Bucket, Config, Histogram,
};

use core::time::Duration;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

// granularity of the reader's wait while draining in-flight writers
pub(crate) const FLIP_YIELD: Duration = Duration::from_micros(500);

static INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

// process-wide monotonic id stamped into a recorder's histograms, used to
// reject recycle buffers that belong to another recorder
pub(crate) fn next_instance_id() -> u64 {
    INSTANCE_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn wall_clock_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}
