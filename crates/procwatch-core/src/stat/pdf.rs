//! Probability models for the change-detection estimators.

use std::fmt;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{StatError, K};
use crate::metric::{Reducer, SampledSeries, Series, SeriesRecorder};

/// The assumed probability density function of the (possibly transformed)
/// observations.
///
/// For log-normal, observations are first transformed as `ln(obs)`, which is
/// then normally distributed. Count-like metrics (error rates, requests per
/// window) are better fit by a Poisson distribution.
pub trait Pdf: Send + fmt::Display {
    /// Transform a raw observation to the underlying tested distribution.
    fn transform(&self, obs: f64) -> f64;

    /// MLE of the (transformed) distribution mean over a sample.
    fn mean(&self, obs: &[f64]) -> f64;

    /// MLE of the distribution variance over a sample.
    fn variance(&self, obs: &[f64], mean: f64) -> f64;

    /// Bootstrap capacity of the series this model produces.
    fn capacity(&self) -> usize;

    /// Build the observation series appropriate for this distribution.
    ///
    /// # Errors
    ///
    /// Returns an error when the series cannot be constructed.
    fn new_series(&mut self) -> Result<Box<dyn SeriesRecorder>, StatError>;

    /// The control-limit multiplier for this distribution.
    ///
    /// # Errors
    ///
    /// Returns [`StatError::Calibration`] when no finite `k` exists.
    fn k(&self) -> Result<f64, StatError>;

    /// Tear down any background state owned by the series.
    fn close(&self) {}
}

/// MLE mean of a sample; `0` for an empty sample.
#[must_use]
pub fn sample_mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Unbiased sample variance; `0` for fewer than two observations.
#[must_use]
pub fn sample_variance(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let sum_sq: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    sum_sq / (values.len() - 1) as f64
}

/// Log-normal model for long-tail metrics such as latencies.
#[derive(Debug, Clone)]
pub struct LogNormal {
    capacity: usize,
    k: K,
}

impl LogNormal {
    /// A log-normal model bootstrapped from `capacity` observations with the
    /// given `k` strategy.
    #[must_use]
    pub const fn new(capacity: usize, k: K) -> Self {
        Self { capacity, k }
    }
}

impl Pdf for LogNormal {
    fn transform(&self, obs: f64) -> f64 {
        obs.ln()
    }

    fn mean(&self, obs: &[f64]) -> f64 {
        sample_mean(obs)
    }

    fn variance(&self, obs: &[f64], mean: f64) -> f64 {
        sample_variance(obs, mean)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn new_series(&mut self) -> Result<Box<dyn SeriesRecorder>, StatError> {
        Ok(Box::new(Series::new(self.capacity)?))
    }

    fn k(&self) -> Result<f64, StatError> {
        self.k.for_log_normal()
    }
}

impl fmt::Display for LogNormal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "log-normal")
    }
}

/// Poisson model for metrics countable over a sampling window, such as the
/// number of error responses per minute.
#[derive(Debug)]
pub struct Poisson {
    capacity: usize,
    window: Duration,
    reducer: Reducer,
    k: K,
    cancel: Option<CancellationToken>,
}

impl Poisson {
    /// A Poisson model that bootstraps from `capacity` samples, combining the
    /// observations within each `window` using `reducer`.
    #[must_use]
    pub const fn new(capacity: usize, window: Duration, reducer: Reducer, k: K) -> Self {
        Self {
            capacity,
            window,
            reducer,
            k,
            cancel: None,
        }
    }
}

impl Pdf for Poisson {
    fn transform(&self, obs: f64) -> f64 {
        obs
    }

    fn mean(&self, obs: &[f64]) -> f64 {
        sample_mean(obs)
    }

    fn variance(&self, _obs: &[f64], mean: f64) -> f64 {
        // The Poisson rate is both mean and variance; reuse the MLE of the
        // mean already calculated from the sample.
        mean
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn new_series(&mut self) -> Result<Box<dyn SeriesRecorder>, StatError> {
        let series = SampledSeries::new(self.capacity, self.window, self.reducer)?;
        self.cancel = Some(series.cancellation_token());
        Ok(Box::new(series))
    }

    fn k(&self) -> Result<f64, StatError> {
        self.k.for_poisson()
    }

    fn close(&self) {
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
    }
}

impl fmt::Display for Poisson {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "poisson")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_mean() {
        assert_eq!(sample_mean(&[1.0, 1.0, 1.0, 2.0, 2.0, 2.0]), 1.5);
        assert_eq!(sample_mean(&[]), 0.0);
    }

    #[test]
    fn test_sample_variance() {
        let values = [1.0, 1.0, 1.0, 2.0, 2.0, 2.0];
        assert!((sample_variance(&values, 1.5) - 0.3).abs() < 1e-12);
        assert_eq!(sample_variance(&[1.0], 1.0), 0.0);
    }

    #[test]
    fn test_log_normal_transform() {
        let pdf = LogNormal::new(50, K::Fixed(3.0));
        assert!((pdf.transform(std::f64::consts::E) - 1.0).abs() < 1e-12);
        assert!(pdf.transform(0.0).is_infinite());
        assert!(pdf.transform(-1.0).is_nan());
    }

    #[test]
    fn test_poisson_variance_is_mean() {
        let pdf = Poisson::new(50, Duration::from_secs(15), Reducer::Sum, K::Fixed(5.5));
        assert_eq!(pdf.variance(&[1.0, 2.0, 3.0], 2.0), 2.0);
        assert_eq!(pdf.transform(4.0), 4.0);
    }
}
