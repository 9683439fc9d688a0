//! Development automation tasks for procwatch.
//!
//! # Usage
//!
//! ```bash
//! cargo xtask <command> [options]
//! ```
//!
//! # Commands
//!
//! - `calibrate` - Monte-Carlo calibration of the error-rate K constants

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

mod calibrate;

/// Development automation for procwatch.
#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Development automation tasks for procwatch", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available xtask commands.
#[derive(Subcommand)]
enum Commands {
    /// Simulate the null hypothesis to fit `ln(error) = a + b * k` and
    /// print the constants embedded in `stat::kconst`.
    Calibrate {
        /// Which distribution to calibrate.
        #[arg(long, value_enum, default_value_t = Distribution::LogNormal)]
        distribution: Distribution,

        /// Independent trials per grid point.
        #[arg(long, default_value_t = 1_000)]
        trials: usize,

        /// Post-bootstrap observations per trial.
        #[arg(long, default_value_t = 100_000)]
        run: usize,

        /// Bootstrap capacity of the simulated estimator.
        #[arg(long, default_value_t = 100)]
        capacity: usize,

        /// EWMA smoothing factor.
        #[arg(long, default_value_t = 0.25)]
        lambda: f64,
    },
}

/// Distribution under calibration.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Distribution {
    /// Log-normal observations (latency-like metrics).
    LogNormal,
    /// Poisson window counts (rate-like metrics).
    Poisson,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Calibrate {
            distribution,
            trials,
            run,
            capacity,
            lambda,
        } => calibrate::run(distribution, trials, run, capacity, lambda),
    }
}
