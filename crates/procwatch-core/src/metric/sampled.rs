//! Time-windowed sampled series.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::series::{Series, SeriesRecorder};
use super::MetricError;

/// Aggregation applied to the observations buffered within one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reducer {
    /// Arithmetic mean of the window.
    Average,
    /// Sum of the window.
    Sum,
    /// Minimum of the window.
    Min,
    /// Maximum of the window.
    Max,
}

impl Reducer {
    /// Reduce a window of observations to a single sample.
    #[must_use]
    pub fn apply(self, obs: &[f64]) -> f64 {
        if obs.is_empty() {
            return 0.0;
        }
        match self {
            Self::Average => obs.iter().sum::<f64>() / obs.len() as f64,
            Self::Sum => obs.iter().sum(),
            Self::Min => obs.iter().copied().fold(f64::INFINITY, f64::min),
            Self::Max => obs.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

#[derive(Debug)]
struct Shared {
    series: Series,
    pending: Vec<f64>,
}

/// A [`Series`] fed by a background ticker.
///
/// Observations are buffered as they arrive; every elapsed window the ticker
/// task records exactly one sample into the underlying series - the reducer
/// applied to the buffered observations, or `0` if none arrived. The ticker
/// runs until [`SampledSeries::close`] is called or the value is dropped; the
/// cancellation signal is checked before each tick is processed.
///
/// Must be created from within a Tokio runtime.
#[derive(Debug)]
pub struct SampledSeries {
    shared: Arc<Mutex<Shared>>,
    cancel: CancellationToken,
}

impl SampledSeries {
    /// Create a sampled series and start its ticker.
    ///
    /// # Errors
    ///
    /// Returns [`MetricError::InvalidCapacity`] for a zero capacity and
    /// [`MetricError::InvalidWindow`] for a zero window.
    pub fn new(
        capacity: usize,
        window: Duration,
        reducer: Reducer,
    ) -> Result<Self, MetricError> {
        if window.is_zero() {
            return Err(MetricError::InvalidWindow);
        }
        let shared = Arc::new(Mutex::new(Shared {
            series: Series::new(capacity)?,
            pending: Vec::new(),
        }));
        let cancel = CancellationToken::new();

        tokio::spawn(tick_loop(
            Arc::clone(&shared),
            cancel.clone(),
            window,
            reducer,
        ));

        Ok(Self { shared, cancel })
    }

    /// Stop the background ticker. Safe to call more than once.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Cancellation token shared with the ticker task.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for SampledSeries {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl SeriesRecorder for SampledSeries {
    fn record(&mut self, obs: f64) {
        self.shared
            .lock()
            .expect("lock poisoned")
            .pending
            .push(obs);
    }

    fn values(&self) -> Vec<f64> {
        self.shared.lock().expect("lock poisoned").series.values()
    }

    fn count(&self) -> u64 {
        self.shared.lock().expect("lock poisoned").series.count()
    }

    fn reset(&mut self) {
        let mut shared = self.shared.lock().expect("lock poisoned");
        shared.series.reset();
        shared.pending.clear();
    }
}

async fn tick_loop(
    shared: Arc<Mutex<Shared>>,
    cancel: CancellationToken,
    window: Duration,
    reducer: Reducer,
) {
    let mut interval = tokio::time::interval(window);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick of a tokio interval fires immediately; consume it so the
    // first sample covers a full window.
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            _ = interval.tick() => {
                let mut shared = shared.lock().expect("lock poisoned");
                if shared.pending.is_empty() {
                    shared.series.record(0.0);
                } else {
                    let sample = reducer.apply(&shared.pending);
                    shared.series.record(sample);
                    shared.pending.clear();
                }
            }
        }
    }
}
