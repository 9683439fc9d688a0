//! Monotonic and time-windowed counters.

use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// A monotonically increasing counter.
///
/// The start time and window are only meaningful for counters produced by a
/// [`WindowedCounter`] history; a plain counter carries a zero window.
#[derive(Debug, Clone)]
pub struct Counter {
    start: DateTime<Utc>,
    window: Duration,
    value: u64,
}

impl Counter {
    /// Create a new counter starting now.
    #[must_use]
    pub fn new() -> Self {
        Self::windowed(Duration::ZERO)
    }

    fn windowed(window: Duration) -> Self {
        Self {
            start: Utc::now(),
            window,
            value: 0,
        }
    }

    /// Current value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.value
    }

    /// Increase the counter by `n`.
    pub fn add(&mut self, n: u64) {
        self.value += n;
    }

    /// Set the counter back to zero.
    pub fn reset(&mut self) {
        self.value = 0;
    }

    /// When this counter started.
    #[must_use]
    pub const fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// The window this counter covered; zero for non-windowed counters.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    fn closed(&self, now: DateTime<Utc>) -> bool {
        if self.window.is_zero() {
            return false;
        }
        let end = self.start + chrono::Duration::from_std(self.window).unwrap_or_default();
        now > end
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// A counter that tracks counts per fixed time window.
///
/// When an observation arrives after the current window has closed, the
/// current counter rotates into history and a fresh window begins. Windows
/// that elapse without any observation are never recorded, so the history
/// may have gaps in the timeline.
#[derive(Debug, Clone)]
pub struct WindowedCounter {
    history: Vec<Counter>,
    current: Counter,
}

impl WindowedCounter {
    /// Create a windowed counter with the given window size.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            history: Vec::new(),
            current: Counter::windowed(window),
        }
    }

    /// Value observed in the most recent window, or `0` if the current
    /// window has already closed without a new observation.
    #[must_use]
    pub fn value(&self) -> u64 {
        if self.current.closed(Utc::now()) {
            0
        } else {
            self.current.value()
        }
    }

    /// Add `n` to the current window, rotating first if it has closed.
    pub fn add(&mut self, n: u64) {
        if self.current.closed(Utc::now()) {
            let window = self.current.window();
            let closed = std::mem::replace(&mut self.current, Counter::windowed(window));
            if closed.value() > 0 {
                self.history.push(closed);
            }
        }
        self.current.add(n);
    }

    /// Closed windows, excluding the currently open one. A closed current
    /// window with observations is included.
    #[must_use]
    pub fn history(&self) -> Vec<Counter> {
        let mut out = self.history.clone();
        if self.current.closed(Utc::now()) && self.current.value() > 0 {
            out.push(self.current.clone());
        }
        out
    }

    /// All windows including the currently open one.
    #[must_use]
    pub fn history_inclusive(&self) -> Vec<Counter> {
        let mut out = self.history.clone();
        out.push(self.current.clone());
        out
    }

    /// Discard history and start a fresh zero-valued window.
    pub fn reset(&mut self) {
        let window = self.current.window();
        self.history.clear();
        self.current = Counter::windowed(window);
    }
}

/// A [`Counter`] safe for concurrent use.
#[derive(Debug, Default)]
pub struct ConcurrentCounter {
    inner: RwLock<Counter>,
}

impl ConcurrentCounter {
    /// Create a new concurrent counter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Counter::new()),
        }
    }

    /// Current value.
    #[must_use]
    pub fn value(&self) -> u64 {
        self.inner.read().expect("lock poisoned").value()
    }

    /// Increase the counter by `n`.
    pub fn add(&self, n: u64) {
        self.inner.write().expect("lock poisoned").add(n);
    }

    /// Set the counter back to zero.
    pub fn reset(&self) {
        self.inner.write().expect("lock poisoned").reset();
    }
}

/// A [`WindowedCounter`] safe for concurrent use.
#[derive(Debug)]
pub struct ConcurrentWindowedCounter {
    inner: RwLock<WindowedCounter>,
}

impl ConcurrentWindowedCounter {
    /// Create a new concurrent windowed counter.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            inner: RwLock::new(WindowedCounter::new(window)),
        }
    }

    /// Value observed in the most recent window.
    #[must_use]
    pub fn value(&self) -> u64 {
        self.inner.read().expect("lock poisoned").value()
    }

    /// Add `n` to the current window.
    pub fn add(&self, n: u64) {
        self.inner.write().expect("lock poisoned").add(n);
    }

    /// Closed windows, excluding the currently open one.
    #[must_use]
    pub fn history(&self) -> Vec<Counter> {
        self.inner.read().expect("lock poisoned").history()
    }

    /// All windows including the currently open one.
    #[must_use]
    pub fn history_inclusive(&self) -> Vec<Counter> {
        self.inner.read().expect("lock poisoned").history_inclusive()
    }

    /// Discard history and start a fresh window.
    pub fn reset(&self) {
        self.inner.write().expect("lock poisoned").reset();
    }
}
