//! Calibration constants for the error-rate K strategy.
//!
//! Simulation of a stochastic process under the null hypothesis is used to
//! experimentally determine `k` values for a desired Type-I error rate of a
//! long-running statistic. A Monte-Carlo run fits the observed error rate to
//! `ln(error) = a + b * k` over a grid of `k` values; the fitted `(a, b)`
//! pairs below are embedded per distribution.
//!
//! Regenerate with `cargo xtask calibrate`.

/// Log-normal intercept `a` of the `ln(error) = a + b * k` fit.
pub const LOG_NORMAL_A: f64 = 17.0165;

/// Log-normal slope `b` of the `ln(error) = a + b * k` fit.
pub const LOG_NORMAL_B: f64 = -3.7986;

/// Poisson intercept `a` of the `ln(error) = a + b * k` fit.
pub const POISSON_A: f64 = 14.0543;

/// Poisson slope `b` of the `ln(error) = a + b * k` fit.
pub const POISSON_B: f64 = -3.1009;
