//! # procwatch-core
//!
//! Core library for procwatch - a process-supervisor agent that wraps a user
//! command, monitors its lifecycle, log output, and resource usage, and ships
//! structured telemetry reports to a remote collector.
//!
//! This crate provides the reusable building blocks; the agent binary lives
//! in `procwatch-agent`.
//!
//! ## Features
//!
//! - **State machines**: typed transition graphs with optional fail-stop and
//!   nonce-guarded transitions
//! - **Metrics**: ring-buffer series, time-windowed sampled series, counters
//! - **Event bus**: topic-addressed broadcast publish/subscribe with
//!   cooperative shutdown
//! - **Change detection**: EWMA and Shewhart test statistics over log-normal
//!   and Poisson models, calibrated to a target false-alarm rate
//! - **Wire types**: the collector report message and its frame codec
//!
//! ## Example
//!
//! ```rust,no_run
//! use procwatch_core::metric::Name;
//! use procwatch_core::stat::Test;
//!
//! # fn main() -> Result<(), procwatch_core::stat::StatError> {
//! let mut latency = Test::log_normal(Name::new("disk_latency", None))?;
//! latency.record(42.0)?;
//! if latency.has_alarmed() {
//!     // raise an alert
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod bus;
pub mod fsm;
pub mod metric;
pub mod proto;
pub mod rng;
pub mod stat;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::bus::{Event, EventBus, Topic};
    pub use crate::fsm::Machine;
    pub use crate::metric::{Name, Series};
    pub use crate::stat::{EstimatorState, Test, TestStatistic, K};
}
