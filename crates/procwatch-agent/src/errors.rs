//! Crash-report side channel.
//!
//! Runtime observational failures (failed report sends, marshalling
//! problems) are contained rather than propagated; they flow to an
//! [`ErrorReporter`] so maintainers can improve the agent. The concrete
//! back-channel is an external collaborator; the default implementation
//! logs locally. Suppression is an explicit constructor argument, not
//! global state.

use std::fmt::Display;

/// Receives unhandled runtime errors.
///
/// Implementations must never surface private data; only the error text
/// itself is reported.
pub trait ErrorReporter: Send + Sync {
    /// Report one contained error.
    fn report(&self, error: &dyn Display);
}

/// Reporter that logs errors through `tracing`, honoring the
/// `--no-error-reports` suppression flag.
#[derive(Debug, Clone)]
pub struct LogReporter {
    enabled: bool,
}

impl LogReporter {
    /// Create a reporter; `enabled` is false when error reports are
    /// suppressed by configuration.
    #[must_use]
    pub const fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl ErrorReporter for LogReporter {
    fn report(&self, error: &dyn Display) {
        if self.enabled {
            tracing::error!(error = %error, "unhandled runtime error");
        } else {
            tracing::debug!(error = %error, "unhandled runtime error (reporting suppressed)");
        }
    }
}
