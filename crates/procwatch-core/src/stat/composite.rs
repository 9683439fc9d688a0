//! Composite test over multiple statistics.

use std::collections::BTreeMap;

use super::state::EstimatorState;
use super::{StatError, TestStatistic};
use crate::metric::Name;

/// Binds a named metric to one or more test statistics.
///
/// Default composites run an EWMA and a Shewhart test in parallel: the EWMA
/// detects small sustained shifts, the Shewhart test large excursions. The
/// composite alarms when any sub-statistic alarms; manual transitions fan
/// out to every sub-statistic.
pub struct Test {
    name: Name,
    sub: Vec<TestStatistic>,
}

impl Test {
    /// A log-normal composite with the default EWMA and Shewhart statistics.
    ///
    /// # Errors
    ///
    /// Fails when a default statistic cannot be constructed.
    pub fn log_normal(name: Name) -> Result<Self, StatError> {
        Ok(Self {
            name,
            sub: vec![
                TestStatistic::default_log_normal_ewma()?,
                TestStatistic::default_log_normal_shewhart()?,
            ],
        })
    }

    /// A Poisson composite with the default EWMA and Shewhart statistics.
    ///
    /// Must be created from within a Tokio runtime (the sampled series own
    /// background tickers).
    ///
    /// # Errors
    ///
    /// Fails when a default statistic cannot be constructed.
    pub fn poisson(name: Name) -> Result<Self, StatError> {
        Ok(Self {
            name,
            sub: vec![
                TestStatistic::default_poisson_ewma()?,
                TestStatistic::default_poisson_shewhart()?,
            ],
        })
    }

    /// A composite over custom statistics.
    #[must_use]
    pub fn with_statistics(name: Name, sub: Vec<TestStatistic>) -> Self {
        Self { name, sub }
    }

    /// The metric name.
    #[must_use]
    pub fn name(&self) -> String {
        self.name.to_string()
    }

    /// Record a raw observation into every sub-statistic.
    ///
    /// # Errors
    ///
    /// Returns the first error any sub-statistic produces.
    pub fn record(&mut self, obs: f64) -> Result<(), StatError> {
        for statistic in &mut self.sub {
            statistic.record(obs)?;
        }
        Ok(())
    }

    /// Attempt to force every sub-statistic to the given state.
    ///
    /// # Errors
    ///
    /// Returns the first transition error.
    pub fn transition(&mut self, to: EstimatorState, reset_series: bool) -> Result<(), StatError> {
        for statistic in &mut self.sub {
            statistic.transition(to, reset_series)?;
        }
        Ok(())
    }

    /// Whether any sub-statistic is in an alarmed condition.
    #[must_use]
    pub fn has_alarmed(&self) -> bool {
        self.sub.iter().any(TestStatistic::has_alarmed)
    }

    /// The states of every sub-statistic, in order.
    #[must_use]
    pub fn states(&self) -> Vec<EstimatorState> {
        self.sub.iter().map(TestStatistic::state).collect()
    }

    /// Current values and limits of every sub-statistic, keyed as
    /// `<name>[... strategy=<sub> type=estimator value=current|limit]` with
    /// user metadata interpolated in sorted order.
    ///
    /// Suitable for plotting a spark line of each statistic against its
    /// testing limit.
    #[must_use]
    pub fn metric(&self) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        for statistic in &self.sub {
            let mut value_name = self.name.clone();
            value_name.add_metadata([
                ("strategy", statistic.name()),
                ("type", "estimator"),
                ("value", "current"),
            ]);

            let mut limit_name = self.name.clone();
            limit_name.add_metadata([
                ("strategy", statistic.name()),
                ("type", "estimator"),
                ("value", "limit"),
            ]);

            out.insert(value_name.to_string(), statistic.value());
            out.insert(limit_name.to_string(), statistic.limit());
        }
        out
    }

    /// Tear down background state owned by the sub-statistics.
    pub fn close(&self) {
        for statistic in &self.sub {
            statistic.close();
        }
    }
}

impl std::fmt::Debug for Test {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Test")
            .field("name", &self.name.to_string())
            .field("states", &self.states())
            .finish_non_exhaustive()
    }
}
