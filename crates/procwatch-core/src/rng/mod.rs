//! Random-number generators for calibration and estimator tests.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A source of random observations from a fixed distribution.
pub trait Sampler {
    /// Draw the next observation.
    fn sample(&mut self) -> f64;
}

/// Generates log-normally distributed observations.
///
/// `mean` and `stdev` parameterise the underlying normal distribution; the
/// returned values are `exp` of normal draws produced with the Box-Muller
/// transform.
#[derive(Debug)]
pub struct LogNormalRng {
    mean: f64,
    stdev: f64,
    rng: StdRng,
    spare: Option<f64>,
}

impl LogNormalRng {
    /// A generator seeded from the operating system.
    #[must_use]
    pub fn new(mean: f64, stdev: f64) -> Self {
        Self {
            mean,
            stdev,
            rng: StdRng::from_entropy(),
            spare: None,
        }
    }

    /// A deterministically seeded generator for reproducible runs.
    #[must_use]
    pub fn with_seed(mean: f64, stdev: f64, seed: u64) -> Self {
        Self {
            mean,
            stdev,
            rng: StdRng::seed_from_u64(seed),
            spare: None,
        }
    }

    fn standard_normal(&mut self) -> f64 {
        if let Some(z) = self.spare.take() {
            return z;
        }
        // Box-Muller: two uniform draws yield two independent normals.
        let u1: f64 = self.rng.gen_range(f64::MIN_POSITIVE..1.0);
        let u2: f64 = self.rng.gen_range(0.0..1.0);
        let radius = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f64::consts::PI * u2;
        self.spare = Some(radius * theta.sin());
        radius * theta.cos()
    }
}

impl Sampler for LogNormalRng {
    fn sample(&mut self) -> f64 {
        (self.standard_normal() * self.stdev + self.mean).exp()
    }
}

/// Generates Poisson distributed observations using Knuth's algorithm.
#[derive(Debug)]
pub struct PoissonRng {
    lambda: f64,
    rng: StdRng,
}

impl PoissonRng {
    /// A generator seeded from the operating system.
    #[must_use]
    pub fn new(lambda: f64) -> Self {
        Self {
            lambda,
            rng: StdRng::from_entropy(),
        }
    }

    /// A deterministically seeded generator for reproducible runs.
    #[must_use]
    pub fn with_seed(lambda: f64, seed: u64) -> Self {
        Self {
            lambda,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Sampler for PoissonRng {
    fn sample(&mut self) -> f64 {
        let l = (-self.lambda).exp();
        let mut k: u64 = 0;
        let mut p = 1.0;
        while p > l {
            k += 1;
            p *= self.rng.gen::<f64>();
        }
        (k - 1) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_normal_sample_statistics() {
        let mut rng = LogNormalRng::with_seed(5.0, 1.0, 1);
        let n = 20_000;
        let mean_ln: f64 = (0..n).map(|_| rng.sample().ln()).sum::<f64>() / f64::from(n);
        assert!((mean_ln - 5.0).abs() < 0.05, "mean_ln = {mean_ln}");
    }

    #[test]
    fn test_log_normal_samples_are_positive() {
        let mut rng = LogNormalRng::with_seed(0.0, 2.0, 2);
        for _ in 0..1000 {
            assert!(rng.sample() > 0.0);
        }
    }

    #[test]
    fn test_poisson_sample_statistics() {
        let mut rng = PoissonRng::with_seed(4.0, 3);
        let n = 20_000;
        let mean: f64 = (0..n).map(|_| rng.sample()).sum::<f64>() / f64::from(n);
        assert!((mean - 4.0).abs() < 0.1, "mean = {mean}");
    }

    #[test]
    fn test_seeded_generators_are_reproducible() {
        let mut a = LogNormalRng::with_seed(5.0, 1.0, 9);
        let mut b = LogNormalRng::with_seed(5.0, 1.0, 9);
        for _ in 0..100 {
            assert_eq!(a.sample(), b.sample());
        }
    }
}
