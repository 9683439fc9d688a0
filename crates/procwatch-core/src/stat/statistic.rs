//! EWMA test statistic.

use std::time::Duration;

use super::state::{new_machine, EstimatorState};
use super::{LogNormal, Pdf, Poisson, StatError, K};
use crate::fsm::Machine;
use crate::metric::{Reducer, SeriesRecorder};

/// Default EWMA smoothing factor.
pub const DEFAULT_LAMBDA: f64 = 0.25;

/// Default target Type-I error rate.
pub const DEFAULT_ERROR_RATE: f64 = 0.05;

/// Default bootstrap capacity.
pub const DEFAULT_BOOTSTRAP: usize = 50;

/// Default Poisson sampling window.
pub const DEFAULT_POISSON_WINDOW: Duration = Duration::from_secs(15);

/// Which control limit a test is directed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Upper control limit.
    Upper,
    /// Lower control limit.
    Lower,
}

/// The control limit for an EWMA with smoothing `lambda`.
///
/// `(lambda / (2 - lambda)) * variance` is the steady-state variance of the
/// EWMA; `k` preserves the target false-alarm rate across `lambda`.
#[must_use]
pub fn control_limit(
    mean: f64,
    variance: f64,
    lambda: f64,
    k: f64,
    direction: Direction,
) -> f64 {
    let estimator_variance = (lambda / (2.0 - lambda)) * variance;
    match direction {
        Direction::Upper => mean + k * estimator_variance.sqrt(),
        Direction::Lower => mean - k * estimator_variance.sqrt(),
    }
}

/// A named EWMA-style online estimator parameterised by a probability model.
///
/// With `lambda = 1` the statistic degenerates to a Shewhart test over the
/// individual observations. Once tripped, the alarm holds until an explicit
/// [`TestStatistic::transition`].
pub struct TestStatistic {
    name: String,
    lambda: f64,
    k: f64,
    current: f64,
    limit: f64,
    series: Box<dyn SeriesRecorder>,
    fsm: Machine<EstimatorState>,
    pdf: Box<dyn Pdf>,
}

impl TestStatistic {
    /// Create an EWMA test statistic over the given probability model.
    ///
    /// # Errors
    ///
    /// Fails when the model cannot build its series or has no finite `k`.
    pub fn ewma(
        name: impl Into<String>,
        lambda: f64,
        mut pdf: Box<dyn Pdf>,
    ) -> Result<Self, StatError> {
        let series = pdf.new_series()?;
        let k = pdf.k()?;
        Ok(Self {
            name: name.into(),
            lambda,
            k,
            current: 0.0,
            limit: 0.0,
            series,
            fsm: new_machine(),
            pdf,
        })
    }

    /// Default log-normal EWMA: `lambda 0.25`, 5% error rate, bootstrap 50.
    ///
    /// # Errors
    ///
    /// Fails when the calibration constants produce no finite `k`.
    pub fn default_log_normal_ewma() -> Result<Self, StatError> {
        Self::ewma(
            "ewma",
            DEFAULT_LAMBDA,
            Box::new(LogNormal::new(
                DEFAULT_BOOTSTRAP,
                K::ErrorRate(DEFAULT_ERROR_RATE),
            )),
        )
    }

    /// Default log-normal Shewhart: `lambda 1.0`, 5% error rate, bootstrap
    /// 50.
    ///
    /// # Errors
    ///
    /// Fails when the calibration constants produce no finite `k`.
    pub fn default_log_normal_shewhart() -> Result<Self, StatError> {
        Self::ewma(
            "shewhart",
            1.0,
            Box::new(LogNormal::new(
                DEFAULT_BOOTSTRAP,
                K::ErrorRate(DEFAULT_ERROR_RATE),
            )),
        )
    }

    /// Default Poisson EWMA: bootstrap 50 over 15-second sum windows.
    ///
    /// Must be created from within a Tokio runtime (the sampled series owns
    /// a background ticker).
    ///
    /// # Errors
    ///
    /// Fails when the calibration constants produce no finite `k`.
    pub fn default_poisson_ewma() -> Result<Self, StatError> {
        Self::ewma(
            "ewma",
            DEFAULT_LAMBDA,
            Box::new(Poisson::new(
                DEFAULT_BOOTSTRAP,
                DEFAULT_POISSON_WINDOW,
                Reducer::Sum,
                K::ErrorRate(DEFAULT_ERROR_RATE),
            )),
        )
    }

    /// Default Poisson Shewhart: bootstrap 50 over 15-second sum windows.
    ///
    /// # Errors
    ///
    /// Fails when the calibration constants produce no finite `k`.
    pub fn default_poisson_shewhart() -> Result<Self, StatError> {
        Self::ewma(
            "shewhart",
            1.0,
            Box::new(Poisson::new(
                DEFAULT_BOOTSTRAP,
                DEFAULT_POISSON_WINDOW,
                Reducer::Sum,
                K::ErrorRate(DEFAULT_ERROR_RATE),
            )),
        )
    }

    /// Estimator name, used as the `strategy` metadata value.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current value of the test statistic.
    #[must_use]
    pub const fn value(&self) -> f64 {
        self.current
    }

    /// Current control limit.
    #[must_use]
    pub const fn limit(&self) -> f64 {
        self.limit
    }

    /// Current estimator state.
    #[must_use]
    pub fn state(&self) -> EstimatorState {
        self.fsm.state()
    }

    /// Whether the statistic has exceeded the upper or lower control limit.
    ///
    /// Stays true until the estimator is explicitly transitioned.
    #[must_use]
    pub fn has_alarmed(&self) -> bool {
        matches!(
            self.fsm.state(),
            EstimatorState::UclTrip | EstimatorState::LclTrip
        )
    }

    /// Record a raw observation.
    ///
    /// The observation is transformed by the probability model, appended to
    /// the series, and folded into the statistic according to the current
    /// estimator state. Limits are not published until the bootstrap series
    /// is full with strictly positive mean and variance.
    ///
    /// # Errors
    ///
    /// Returns [`StatError::UndefinedTransform`] when the transformed
    /// observation is not finite, or an FSM error on an internal transition
    /// violation.
    pub fn record(&mut self, raw: f64) -> Result<(), StatError> {
        let obs = self.pdf.transform(raw);
        if !obs.is_finite() {
            return Err(StatError::UndefinedTransform { value: raw });
        }
        self.series.record(obs);

        let mut state = self.fsm.state();
        if state == EstimatorState::Reset {
            // Restart toward a steady, non-alarmed condition: next phase is
            // bootstrapping the upper limit with a fresh baseline.
            self.fsm.transition(EstimatorState::UclInitial)?;
            if self.series.count() > 0 {
                self.series.reset();
                self.series.record(obs);
            }
            state = EstimatorState::UclInitial;
        }

        match state {
            EstimatorState::UclInitial => self.bootstrap(Direction::Upper)?,
            EstimatorState::LclInitial => self.bootstrap(Direction::Lower)?,
            EstimatorState::TestingUcl => {
                self.fold(obs);
                if self.current >= self.limit {
                    self.fsm.transition(EstimatorState::UclTrip)?;
                }
            },
            EstimatorState::TestingLcl => {
                self.fold(obs);
                if self.current <= self.limit {
                    self.fsm.transition(EstimatorState::LclTrip)?;
                }
            },
            // Alarmed states hold until an explicit transition.
            EstimatorState::UclTrip | EstimatorState::LclTrip | EstimatorState::Reset => {},
        }
        Ok(())
    }

    /// Attempt to move the estimator to the given state, optionally forcing
    /// the series to collect a new baseline first.
    ///
    /// # Errors
    ///
    /// Returns an FSM error when the transition is not allowed.
    pub fn transition(
        &mut self,
        to: EstimatorState,
        reset_series: bool,
    ) -> Result<(), StatError> {
        if reset_series {
            self.series.reset();
        }
        self.fsm.transition(to)?;
        Ok(())
    }

    /// Tear down background state owned by the probability model.
    pub fn close(&self) {
        self.pdf.close();
    }

    fn fold(&mut self, obs: f64) {
        self.current = self.lambda * obs + (1.0 - self.lambda) * self.current;
    }

    fn bootstrap(&mut self, direction: Direction) -> Result<(), StatError> {
        if self.series.count() < self.pdf.capacity() as u64 {
            return Ok(());
        }
        let values = self.series.values();
        let mean = self.pdf.mean(&values);
        let variance = self.pdf.variance(&values, mean);
        if mean > 0.0 && variance > 0.0 {
            let testing = match direction {
                Direction::Upper => EstimatorState::TestingUcl,
                Direction::Lower => EstimatorState::TestingLcl,
            };
            self.fsm.transition(testing)?;
            self.current = mean;
            self.limit = control_limit(mean, variance, self.lambda, self.k, direction);
        }
        Ok(())
    }
}

impl std::fmt::Debug for TestStatistic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestStatistic")
            .field("name", &self.name)
            .field("lambda", &self.lambda)
            .field("k", &self.k)
            .field("current", &self.current)
            .field("limit", &self.limit)
            .field("state", &self.fsm.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::{LogNormalRng, Sampler};

    fn log_normal_ewma(capacity: usize, lambda: f64, k: f64) -> TestStatistic {
        TestStatistic::ewma(
            "ewma",
            lambda,
            Box::new(LogNormal::new(capacity, K::Fixed(k))),
        )
        .unwrap()
    }

    #[test]
    fn test_control_limit_symmetry() {
        let (mean, variance, lambda, k) = (1.5, 0.3, 0.25, 3.0);
        let ucl = control_limit(mean, variance, lambda, k, Direction::Upper);
        let lcl = control_limit(mean, variance, lambda, k, Direction::Lower);

        assert!((ucl - 2.12105).abs() < 1e-5);
        assert!((lcl - 0.87894).abs() < 1e-5);
        assert!(((ucl - mean) + (lcl - mean)).abs() < 1e-12);
    }

    #[test]
    fn test_undefined_transform_rejected() {
        let mut est = log_normal_ewma(10, 0.25, 3.0);
        // ln of a non-positive observation is undefined.
        assert!(matches!(
            est.record(0.0),
            Err(StatError::UndefinedTransform { .. })
        ));
        assert!(matches!(
            est.record(-3.0),
            Err(StatError::UndefinedTransform { .. })
        ));
    }

    #[test]
    fn test_no_limit_until_bootstrap_full() {
        let mut est = log_normal_ewma(10, 0.25, 3.0);
        for _ in 0..9 {
            est.record(100.0).unwrap();
        }
        assert_eq!(est.state(), EstimatorState::UclInitial);
        assert_eq!(est.limit(), 0.0);
    }

    #[test]
    fn test_bootstrap_requires_positive_variance() {
        let mut est = log_normal_ewma(10, 0.25, 3.0);
        // Identical observations leave the sample variance at zero, so the
        // estimator must keep bootstrapping.
        for _ in 0..20 {
            est.record(100.0).unwrap();
        }
        assert_eq!(est.state(), EstimatorState::UclInitial);
    }

    #[test]
    fn test_shift_trips_upper_limit() {
        let mut rng = LogNormalRng::with_seed(5.2983, 1.0, 42);
        let mut est = log_normal_ewma(50, 0.25, 5.27);

        for i in 0..100 {
            est.record(rng.sample()).unwrap();
            if i == 51 {
                assert_eq!(est.state(), EstimatorState::TestingUcl);
            }
        }
        assert!(!est.has_alarmed());

        // Shift the distribution mean well past the control limit.
        let mut shifted = LogNormalRng::with_seed(8.0, 1.0, 43);
        let mut post_shift = 0;
        while !est.has_alarmed() {
            est.record(shifted.sample()).unwrap();
            post_shift += 1;
            assert!(post_shift <= 200, "estimator failed to alarm after shift");
        }
        assert_eq!(est.state(), EstimatorState::UclTrip);
    }

    #[test]
    fn test_default_ewma_detects_distribution_shift() {
        let mut est = TestStatistic::default_log_normal_ewma().unwrap();
        let mut background = LogNormalRng::with_seed(5.2983, 1.0, 101);
        for i in 1..=100u32 {
            est.record(background.sample()).unwrap();
            if i == 51 {
                assert_eq!(est.state(), EstimatorState::TestingUcl);
            }
        }
        assert!(!est.has_alarmed());

        let mut shifted = LogNormalRng::with_seed(8.0, 1.0, 102);
        let mut post_shift = 0;
        while !est.has_alarmed() {
            est.record(shifted.sample()).unwrap();
            post_shift += 1;
            assert!(post_shift <= 200, "no alarm within 200 post-shift samples");
        }
    }

    #[test]
    fn test_alarm_is_sticky() {
        let mut rng = LogNormalRng::with_seed(5.2983, 1.0, 7);
        let mut est = log_normal_ewma(50, 0.25, 5.27);
        for _ in 0..60 {
            est.record(rng.sample()).unwrap();
        }
        let mut shifted = LogNormalRng::with_seed(9.0, 1.0, 8);
        for _ in 0..200 {
            est.record(shifted.sample()).unwrap();
        }
        assert!(est.has_alarmed());

        // Background-level observations do not clear the alarm.
        for _ in 0..50 {
            est.record(rng.sample()).unwrap();
        }
        assert!(est.has_alarmed());
    }

    #[test]
    fn test_reset_restarts_bootstrap() {
        let mut rng = LogNormalRng::with_seed(5.2983, 1.0, 11);
        let mut est = log_normal_ewma(50, 0.25, 5.27);
        for _ in 0..60 {
            est.record(rng.sample()).unwrap();
        }
        assert_eq!(est.state(), EstimatorState::TestingUcl);

        est.transition(EstimatorState::Reset, false).unwrap();
        est.record(rng.sample()).unwrap();
        // The series was restarted with the single re-recorded observation.
        assert_eq!(est.state(), EstimatorState::UclInitial);
    }

    #[test]
    fn test_trip_then_lower_limit_path() {
        let mut rng = LogNormalRng::with_seed(5.2983, 1.0, 21);
        let mut est = log_normal_ewma(50, 0.25, 5.27);
        for _ in 0..60 {
            est.record(rng.sample()).unwrap();
        }
        let mut shifted = LogNormalRng::with_seed(9.0, 1.0, 22);
        for _ in 0..200 {
            est.record(shifted.sample()).unwrap();
        }
        assert_eq!(est.state(), EstimatorState::UclTrip);

        // Point the estimator at the lower limit with a fresh baseline of
        // the shifted process.
        est.transition(EstimatorState::LclInitial, true).unwrap();
        for _ in 0..60 {
            est.record(shifted.sample()).unwrap();
        }
        assert_eq!(est.state(), EstimatorState::TestingLcl);

        // The process correcting itself downward trips the lower limit.
        let mut corrected = LogNormalRng::with_seed(2.0, 1.0, 23);
        let mut post = 0;
        while !est.has_alarmed() {
            est.record(corrected.sample()).unwrap();
            post += 1;
            assert!(post <= 200, "estimator failed to trip the lower limit");
        }
        assert_eq!(est.state(), EstimatorState::LclTrip);
    }
}
