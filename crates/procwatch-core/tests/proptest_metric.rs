//! Property tests for the metric primitives.

use procwatch_core::metric::{Series, SeriesRecorder, WindowedCounter};
use proptest::prelude::*;
use std::time::Duration;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// A series always holds the last `capacity` observations in
    /// chronological order.
    #[test]
    fn series_keeps_last_capacity_observations(
        capacity in 1usize..64,
        observations in prop::collection::vec(-1e12f64..1e12, 0..256),
    ) {
        let mut series = Series::new(capacity).unwrap();
        for &obs in &observations {
            series.record(obs);
        }

        let expected: Vec<f64> = observations
            .iter()
            .copied()
            .skip(observations.len().saturating_sub(capacity))
            .collect();
        prop_assert_eq!(series.values(), expected);
        prop_assert_eq!(series.count(), observations.len() as u64);
    }

    /// The retained window never exceeds the configured capacity.
    #[test]
    fn series_never_exceeds_capacity(
        capacity in 1usize..32,
        observations in prop::collection::vec(any::<f64>().prop_filter("finite", |v| v.is_finite()), 0..128),
    ) {
        let mut series = Series::new(capacity).unwrap();
        for &obs in &observations {
            series.record(obs);
            prop_assert!(series.values().len() <= capacity);
        }
    }

    /// Reset always produces an empty series regardless of prior history.
    #[test]
    fn series_reset_is_total(
        capacity in 1usize..32,
        observations in prop::collection::vec(-1e6f64..1e6, 0..64),
    ) {
        let mut series = Series::new(capacity).unwrap();
        for &obs in &observations {
            series.record(obs);
        }
        series.reset();
        prop_assert!(series.values().is_empty());
        prop_assert_eq!(series.count(), 0);
    }

    /// Every observation added to a windowed counter is accounted for:
    /// the inclusive history always sums to the grand total, and the closed
    /// history plus the open-window value never loses a count.
    #[test]
    fn windowed_counter_conserves_totals(
        adds in prop::collection::vec(1u64..1000, 1..32),
    ) {
        // A generous window keeps everything in the open counter; totals
        // must still be conserved.
        let mut counter = WindowedCounter::new(Duration::from_secs(3600));
        let mut total = 0u64;
        for &n in &adds {
            counter.add(n);
            total += n;
        }

        let inclusive: u64 = counter.history_inclusive().iter().map(|c| c.value()).sum();
        let closed: u64 = counter.history().iter().map(|c| c.value()).sum();
        prop_assert_eq!(inclusive, total);
        prop_assert_eq!(closed + counter.value(), total);
    }

    /// History never records an empty window.
    #[test]
    fn windowed_counter_history_has_no_empty_windows(
        adds in prop::collection::vec(1u64..100, 0..16),
    ) {
        let mut counter = WindowedCounter::new(Duration::from_nanos(1));
        for &n in &adds {
            counter.add(n);
            std::thread::sleep(Duration::from_micros(10));
        }
        for window in counter.history() {
            prop_assert!(window.value() > 0);
        }
    }
}
