//! # procwatch-agent
//!
//! The procwatch agent wraps an arbitrary user command, executes it as a
//! child process, and continuously monitors its lifecycle, log output, and
//! resource usage. Structured telemetry reports are shipped to a remote
//! collector when the run finishes, when warning thresholds are crossed, or
//! when output rules match.
//!
//! The binary entry point lives in `main.rs`; this library exposes the
//! agent's components for integration tests and embedding.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod cli;
pub mod command;
pub mod config;
pub mod errors;
pub mod logs;
pub mod memory;
pub mod report;
pub mod supervisor;
pub mod watch;

/// Agent-level errors surfaced to the caller of `exec`.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The user command could not be prepared for execution.
    #[error("could not prepare command: {0}")]
    Wrap(#[source] std::io::Error),

    /// The child process could not be spawned.
    #[error("failed to start process: {0}")]
    Spawn(#[source] std::io::Error),

    /// The child process could not be awaited.
    #[error("failed to wait on process: {0}")]
    Wait(#[source] std::io::Error),

    /// A signal handler could not be registered.
    #[error("failed to register signal handler: {0}")]
    Signal(#[source] std::io::Error),
}
