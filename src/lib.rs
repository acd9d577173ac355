//! A thread-safe Count-Min sketch for summarizing data streams.
//!
//! Count-Min is a *sublinear space* data structure for approximating item
//! frequencies, proposed by G. Cormode et al. in *An Improved Data Stream
//! Summary: The Count-Min Sketch and its Applications*. Estimates are
//! one-sided: they never undercount the true frequency but may overcount
//! due to hash collisions.
//!
//! The sketch is safe to share between threads. Every operation holds the
//! table lock for its full duration, so a reader always observes a state in
//! which any concurrent insert or merge has either fully happened or not
//! happened at all.
//!
//! ```
//! use minsketch::CountMinSketch;
//!
//! let sketch: CountMinSketch<String> = CountMinSketch::new(1024, 4).unwrap();
//!
//! sketch.insert(&"apple".to_string());
//! sketch.insert(&"apple".to_string());
//!
//! assert!(sketch.count(&"apple".to_string()) >= 2);
//! ```

use std::fmt;

mod sketch;

pub use sketch::CountMinSketch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountMinError {
    CounterOverflow,
    InvalidDimension,
    DimensionMismatch,
}

impl fmt::Display for CountMinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CountMinError::CounterOverflow => "counter overflow.".fmt(f),
            CountMinError::InvalidDimension => "invalid dimension.".fmt(f),
            CountMinError::DimensionMismatch => {
                "mismatched dimensions.".fmt(f)
            },
        }
    }
}

impl std::error::Error for CountMinError {}
