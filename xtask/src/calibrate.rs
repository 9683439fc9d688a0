//! Monte-Carlo calibration of the error-rate K constants.
//!
//! Runs the estimator against a stationary process (the null hypothesis)
//! over a grid of fixed `k` values and measures the long-run Type-I error
//! rate at each point. A least-squares fit of `ln(error) = a + b * k` over
//! the grid yields the `(a, b)` pair embedded in
//! `procwatch_core::stat::kconst`. Paste the printed constants into that
//! module to adopt a new calibration.

use std::fmt;
use std::time::Instant;

use anyhow::{bail, Result};
use procwatch_core::metric::{Series, SeriesRecorder};
use procwatch_core::rng::{LogNormalRng, PoissonRng, Sampler};
use procwatch_core::stat::{Pdf, StatError, TestStatistic, K};

use crate::Distribution;

/// Baseline mean of the simulated log-normal process (log scale).
const LOG_NORMAL_MEAN: f64 = 5.0;

/// Baseline standard deviation of the simulated log-normal process.
const LOG_NORMAL_STDEV: f64 = 1.0;

/// Baseline rate of the simulated Poisson process.
const POISSON_RATE: f64 = 20.0;

/// Grid of k values to simulate, matching the region the error-rate
/// strategy interpolates over.
const K_GRID_START: f64 = 5.0;
const K_GRID_END: f64 = 7.0;
const K_GRID_STEP: f64 = 0.1;

/// A Poisson model fed pre-sampled window counts.
///
/// Calibration draws whole window counts directly from the RNG, so the
/// time-based sampled series of the production model is replaced with a
/// plain ring.
#[derive(Debug)]
struct PresampledPoisson {
    capacity: usize,
    k: K,
}

impl Pdf for PresampledPoisson {
    fn transform(&self, obs: f64) -> f64 {
        obs
    }

    fn mean(&self, obs: &[f64]) -> f64 {
        procwatch_core::stat::sample_mean(obs)
    }

    fn variance(&self, _obs: &[f64], mean: f64) -> f64 {
        mean
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn new_series(&mut self) -> Result<Box<dyn SeriesRecorder>, StatError> {
        Ok(Box::new(Series::new(self.capacity)?))
    }

    fn k(&self) -> Result<f64, StatError> {
        self.k.for_poisson()
    }
}

impl fmt::Display for PresampledPoisson {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "poisson")
    }
}

pub fn run(
    distribution: Distribution,
    trials: usize,
    run: usize,
    capacity: usize,
    lambda: f64,
) -> Result<()> {
    let started = Instant::now();
    let mut points = Vec::new();

    let mut k = K_GRID_START;
    while k <= K_GRID_END + 1e-9 {
        let errors = (0..trials)
            .filter(|_| trial_alarms(distribution, k, capacity, lambda, run))
            .count();
        let error_rate = errors as f64 / trials as f64;
        println!("k={k:.1} errors={errors} p={error_rate:.5}");
        if error_rate > 0.0 {
            points.push((k, error_rate.ln()));
        }
        k += K_GRID_STEP;
    }

    let Some((a, b)) = fit_line(&points) else {
        bail!("not enough non-zero error rates to fit; increase --trials");
    };

    let name = match distribution {
        Distribution::LogNormal => "LOG_NORMAL",
        Distribution::Poisson => "POISSON",
    };
    println!();
    println!("// ln(error) = a + b * k over k in [{K_GRID_START}, {K_GRID_END}]");
    println!("pub const {name}_A: f64 = {a:.4};");
    println!("pub const {name}_B: f64 = {b:.4};");
    println!();
    println!("elapsed: {:?}", started.elapsed());
    Ok(())
}

/// One trial under the null hypothesis; true if the estimator false-alarms.
fn trial_alarms(
    distribution: Distribution,
    k: f64,
    capacity: usize,
    lambda: f64,
    run: usize,
) -> bool {
    let (mut estimator, mut sampler): (TestStatistic, Box<dyn Sampler>) = match distribution {
        Distribution::LogNormal => (
            TestStatistic::ewma(
                "ewma",
                lambda,
                Box::new(procwatch_core::stat::LogNormal::new(capacity, K::Fixed(k))),
            )
            .expect("estimator construction"),
            Box::new(LogNormalRng::new(LOG_NORMAL_MEAN, LOG_NORMAL_STDEV)),
        ),
        Distribution::Poisson => (
            TestStatistic::ewma(
                "ewma",
                lambda,
                Box::new(PresampledPoisson {
                    capacity,
                    k: K::Fixed(k),
                }),
            )
            .expect("estimator construction"),
            Box::new(PoissonRng::new(POISSON_RATE)),
        ),
    };

    for _ in 0..capacity + run {
        if estimator.record(sampler.sample()).is_err() {
            // A zero draw has an undefined log transform; skip it.
            continue;
        }
        if estimator.has_alarmed() {
            return true;
        }
    }
    false
}

/// Least-squares fit of `y = a + b * x`.
fn fit_line(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let sum_x: f64 = points.iter().map(|(x, _)| x).sum();
    let sum_y: f64 = points.iter().map(|(_, y)| y).sum();
    let sum_xx: f64 = points.iter().map(|(x, _)| x * x).sum();
    let sum_xy: f64 = points.iter().map(|(x, y)| x * y).sum();

    let denom = n * sum_xx - sum_x * sum_x;
    if denom.abs() < f64::EPSILON {
        return None;
    }
    let b = (n * sum_xy - sum_x * sum_y) / denom;
    let a = (sum_y - b * sum_x) / n;
    Some((a, b))
}
