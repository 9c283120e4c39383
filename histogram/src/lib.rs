// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Histograms which track the distribution of recorded values with a bounded
//! relative error across many orders of magnitude, in fixed memory, with
//! constant-time recording.
//!
//! [`Histogram`] is the single-threaded integer variant, [`AtomicHistogram`]
//! may be shared across threads, and [`AtomicDoubleHistogram`] tracks
//! double-precision values across a configured dynamic range by sliding a
//! power-of-two window over an embedded integer histogram.

mod bucket;
mod config;
mod error;
mod histograms;

pub use bucket::*;
pub use config::*;
pub use error::*;
pub use histograms::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build() {
        let mut h = Histogram::new(10_000, 3).unwrap();
        assert_eq!(h.percentile(0.0), Err(HistogramError::Empty));
        h.increment(1, 1).unwrap();
        assert_eq!(h.percentile(0.0), Ok(1));
        assert_eq!(h.percentile(100.0), Ok(1));
        assert_eq!(h.increment(65535, 1), Err(HistogramError::OutOfRange));

        let h = AtomicHistogram::new(10_000, 3).unwrap();
        h.increment(1, 1).unwrap();
        assert_eq!(h.percentile(100.0), Ok(1));

        let h = AtomicDoubleHistogram::new(1_000_000, 3).unwrap();
        h.increment(1.0, 1).unwrap();
        assert_eq!(h.total_count(), 1);
    }
}
