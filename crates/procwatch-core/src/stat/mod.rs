//! Statistical change detection.
//!
//! Online estimators that consume numeric observations and raise an alarm
//! when the underlying distribution shifts beyond a control limit tied to a
//! target false-alarm rate. The engine is built from three layers:
//!
//! - a probability model ([`Pdf`]) describing the assumed distribution of
//!   the observations (log-normal for latencies, Poisson for counts),
//! - a [`TestStatistic`] applying an EWMA to the transformed observations
//!   and comparing it against upper/lower control limits, driven by a small
//!   state machine through bootstrap, testing, and alarm phases,
//! - a composite [`Test`] fanning a named metric out to several statistics
//!   (by default one EWMA and one Shewhart).

mod composite;
mod k;
pub mod kconst;
mod pdf;
mod state;
mod statistic;

pub use composite::Test;
pub use k::K;
pub use pdf::{sample_mean, sample_variance, LogNormal, Pdf, Poisson};
pub use state::EstimatorState;
pub use statistic::{control_limit, Direction, TestStatistic};

use crate::fsm::FsmError;
use crate::metric::MetricError;

/// Statistical engine errors.
#[derive(Debug, thiserror::Error)]
pub enum StatError {
    /// The transformed observation is NaN or infinite.
    #[error("transform({value}) is not defined")]
    UndefinedTransform {
        /// The raw observation that produced the undefined transform.
        value: f64,
    },

    /// No finite `k` exists for the requested error rate.
    #[error("cannot calculate k for error rate {error_rate}")]
    Calibration {
        /// The requested Type-I error rate.
        error_rate: f64,
    },

    /// Estimator state machine violation.
    #[error(transparent)]
    Fsm(#[from] FsmError),

    /// Series construction failure.
    #[error(transparent)]
    Metric(#[from] MetricError),
}
