// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use perfcommon_histogram::HistogramError;
use thiserror::Error;

/// Possible errors returned by operations on a recorder.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RecorderError {
    #[error("invalid configuration")]
    /// The configuration is invalid.
    InvalidConfig,
    #[error("histogram contains no samples")]
    /// The histogram contains no samples.
    Empty,
    #[error("invalid percentile")]
    /// The provided percentile is outside of the range 0.0 - 100.0 (inclusive)
    InvalidPercentile,
    #[error("value out of range")]
    /// The value is outside of the trackable range.
    OutOfRange,
    #[error("histogram is incompatible with this recorder")]
    /// The histogram was not produced by this recorder or does not match its
    /// configuration.
    Incompatible,
    #[error("subtraction would underflow a bucket")]
    /// Subtracting would make a bucket count negative.
    Underflow,
}

impl From<HistogramError> for RecorderError {
    fn from(other: HistogramError) -> Self {
        match other {
            HistogramError::InvalidConfig => Self::InvalidConfig,
            HistogramError::Empty => Self::Empty,
            HistogramError::InvalidPercentile => Self::InvalidPercentile,
            HistogramError::OutOfRange => Self::OutOfRange,
            HistogramError::Incompatible => Self::Incompatible,
            HistogramError::Underflow => Self::Underflow,
        }
    }
}
