// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use thiserror::Error;

/// Possible errors returned by operations on a histogram.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum HistogramError {
    #[error("invalid configuration")]
    /// The configuration is invalid. Significant digits must be in the range
    /// 0 - 5 and the trackable range must span at least one binary order of
    /// magnitude above the lowest discernible value.
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
    #[error("incompatible histogram")]
    /// The other histogram's configuration is incompatible with this one.
    Incompatible,
    #[error("subtraction would underflow a bucket")]
    /// Subtracting the other histogram would make a bucket count negative.
    Underflow,
}
