//! Log-derived metric watching.
//!
//! A watcher task subscribes to the log topic, extracts numeric features
//! from JSON fields of each scanned line, and feeds them to the statistical
//! change-detection engine. When a composite test trips, the watcher
//! publishes an alarm event on the alarm topic; undefined observations and
//! decode failures go to the error topic and never stop the watcher.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use procwatch_core::bus::{Event, EventBus, Topic};
use procwatch_core::metric::Name;
use procwatch_core::stat::{StatError, Test};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::command::extract_json_field;
use crate::logs::{log_topic, LogEvent, LOG_LINE_EVENT};

/// Event type tag for estimator alarms.
pub const ALARM_EVENT: &str = "metric_alarm";

/// The topic carrying [`AlarmEvent`]s.
#[must_use]
pub fn alarm_topic() -> Topic {
    Topic::new("alarm")
}

/// Payload of a `metric_alarm` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmEvent {
    /// The metric that tripped.
    pub metric: String,
    /// Estimator states at the time of the alarm.
    pub states: Vec<String>,
    /// Current estimator values and limits, keyed by metric name.
    pub values: std::collections::BTreeMap<String, f64>,
    /// When the alarm tripped.
    pub timestamp: DateTime<Utc>,
}

/// What a watcher extracts and tests: a dotted JSON field path bound to a
/// composite test.
pub struct MetricWatch {
    /// Dotted JSON field path the feature is extracted from.
    pub field: String,
    /// The composite test consuming the feature.
    pub test: Test,
}

impl MetricWatch {
    /// Watch a latency-like field with the default log-normal composite.
    ///
    /// # Errors
    ///
    /// Fails when the default statistics cannot be constructed.
    pub fn log_normal(name: impl Into<String>, field: impl Into<String>) -> Result<Self, StatError> {
        Ok(Self {
            field: field.into(),
            test: Test::log_normal(Name::new(name, None))?,
        })
    }

    /// Watch a count-like field with the default Poisson composite.
    ///
    /// Must be created from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails when the default statistics cannot be constructed.
    pub fn poisson(name: impl Into<String>, field: impl Into<String>) -> Result<Self, StatError> {
        Ok(Self {
            field: field.into(),
            test: Test::poisson(Name::new(name, None))?,
        })
    }
}

/// Consumes log-line events and drives the change-detection estimators.
///
/// Estimator state is private to the watcher task; the rest of the system
/// observes it only through alarm events.
pub struct MetricWatcher {
    task: JoinHandle<()>,
}

impl MetricWatcher {
    /// Subscribe to the log topic and start watching.
    #[must_use]
    pub fn spawn(bus: Arc<EventBus>, watches: Vec<MetricWatch>) -> Self {
        let (mut stream, handle) = bus.subscribe([log_topic()]);

        let task = tokio::spawn(async move {
            let mut watches = watches;
            let mut alarmed = vec![false; watches.len()];

            while let Some(event) = stream.recv().await {
                if event.kind() != LOG_LINE_EVENT {
                    continue;
                }
                let log: LogEvent = match event.decode() {
                    Ok(log) => log,
                    Err(e) => {
                        bus.dispatch_error(&e);
                        continue;
                    },
                };

                for (watch, alarmed) in watches.iter_mut().zip(alarmed.iter_mut()) {
                    let projection = extract_json_field(&log.line, &watch.field);
                    let Ok(value) = projection.trim().parse::<f64>() else {
                        continue;
                    };
                    if let Err(e) = watch.test.record(value) {
                        // A rejected observation (undefined transform) is
                        // contained; the run continues.
                        bus.dispatch_error(&e);
                        continue;
                    }

                    if watch.test.has_alarmed() && !*alarmed {
                        *alarmed = true;
                        let payload = AlarmEvent {
                            metric: watch.test.name(),
                            states: watch
                                .test
                                .states()
                                .iter()
                                .map(ToString::to_string)
                                .collect(),
                            values: watch.test.metric(),
                            timestamp: Utc::now(),
                        };
                        warn!(metric = %payload.metric, "metric alarm tripped");
                        match Event::new(ALARM_EVENT, &payload) {
                            Ok(event) => bus.dispatch(event, [alarm_topic()]),
                            Err(e) => bus.dispatch_error(&e),
                        }
                    }
                }
            }

            // The stream closes when the bus shuts down.
            for watch in &watches {
                watch.test.close();
            }
            handle.finished();
        });

        Self { task }
    }

    /// Wait for the watcher to finish (the bus must be shut down first).
    pub async fn wait(self) {
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use procwatch_core::stat::{LogNormal, TestStatistic, K};

    use super::*;

    fn tight_watch(field: &str) -> MetricWatch {
        // A tiny bootstrap and low k so a handful of lines trips the test.
        let statistic = TestStatistic::ewma(
            "ewma",
            1.0,
            Box::new(LogNormal::new(5, K::Fixed(0.5))),
        )
        .unwrap();
        MetricWatch {
            field: field.to_string(),
            test: Test::with_statistics(
                Name::new("request_latency", None),
                vec![statistic],
            ),
        }
    }

    fn log_event(line: &str) -> Event {
        Event::new(
            LOG_LINE_EVENT,
            &LogEvent {
                timestamp: Utc::now(),
                line: line.to_string(),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_watcher_publishes_alarm_on_shift() {
        let bus = Arc::new(EventBus::new());
        let (mut alarms, subscription) = bus.subscribe([alarm_topic()]);
        let watcher = MetricWatcher::spawn(Arc::clone(&bus), vec![tight_watch("latency_ms")]);

        // Bootstrap with varied background, then shift by orders of
        // magnitude.
        for i in 0..5 {
            let line = format!(r#"{{"latency_ms":{}}}"#, 100 + i * 7);
            bus.dispatch(log_event(&line), [log_topic()]);
        }
        for _ in 0..20 {
            bus.dispatch(log_event(r#"{"latency_ms":100000}"#), [log_topic()]);
        }

        let alarm = tokio::time::timeout(Duration::from_secs(5), alarms.recv())
            .await
            .expect("alarm within deadline")
            .unwrap();
        assert_eq!(alarm.kind(), ALARM_EVENT);
        let payload: AlarmEvent = alarm.decode().unwrap();
        assert_eq!(payload.metric, "request_latency");
        assert!(payload
            .values
            .contains_key("request_latency[strategy=ewma type=estimator value=current]"));

        subscription.finished();
        bus.shutdown(Duration::from_secs(5)).await.unwrap();
        watcher.wait().await;
    }

    #[tokio::test]
    async fn test_watcher_ignores_non_numeric_and_missing_fields() {
        let bus = Arc::new(EventBus::new());
        let (mut alarms, subscription) = bus.subscribe([alarm_topic()]);
        let watcher = MetricWatcher::spawn(Arc::clone(&bus), vec![tight_watch("latency_ms")]);

        bus.dispatch(log_event("not json"), [log_topic()]);
        bus.dispatch(log_event(r#"{"latency_ms":"soon"}"#), [log_topic()]);
        bus.dispatch(log_event(r#"{"other":1}"#), [log_topic()]);

        let outcome = tokio::time::timeout(Duration::from_millis(200), alarms.recv()).await;
        assert!(outcome.is_err(), "no alarm from unusable lines");

        subscription.finished();
        bus.shutdown(Duration::from_secs(5)).await.unwrap();
        watcher.wait().await;
    }

    #[tokio::test]
    async fn test_alarm_publishes_once_per_episode() {
        let bus = Arc::new(EventBus::new());
        let (mut alarms, subscription) = bus.subscribe([alarm_topic()]);
        let watcher = MetricWatcher::spawn(Arc::clone(&bus), vec![tight_watch("v")]);

        for i in 0..5 {
            let line = format!(r#"{{"v":{}}}"#, 50 + i * 3);
            bus.dispatch(log_event(&line), [log_topic()]);
        }
        for _ in 0..40 {
            bus.dispatch(log_event(r#"{"v":100000}"#), [log_topic()]);
        }

        let first = tokio::time::timeout(Duration::from_secs(5), alarms.recv())
            .await
            .expect("first alarm")
            .unwrap();
        assert_eq!(first.kind(), ALARM_EVENT);

        // The alarm is sticky; further observations do not republish.
        let second = tokio::time::timeout(Duration::from_millis(200), alarms.recv()).await;
        assert!(second.is_err());

        subscription.finished();
        bus.shutdown(Duration::from_secs(5)).await.unwrap();
        watcher.wait().await;
    }
}
