//! Metric primitives.
//!
//! Ring-buffer series, time-windowed sampled series, and counters used by the
//! statistical change-detection engine and by handlers that accumulate
//! observations over time.

mod counter;
mod name;
mod sampled;
mod series;

pub use counter::{ConcurrentCounter, ConcurrentWindowedCounter, Counter, WindowedCounter};
pub use name::Name;
pub use sampled::{Reducer, SampledSeries};
pub use series::{Series, SeriesRecorder};

/// Metric errors.
#[derive(Debug, thiserror::Error)]
pub enum MetricError {
    /// A series must hold at least one observation.
    #[error("series must be initialized with a capacity >= 1")]
    InvalidCapacity,

    /// A sampled series needs a non-zero aggregation window.
    #[error("sampled series window must be greater than zero")]
    InvalidWindow,
}
