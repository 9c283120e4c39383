// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

mod atomic;
mod double;
mod standard;

pub use atomic::AtomicHistogram;
pub use double::AtomicDoubleHistogram;
pub use standard::Histogram;
