//! Log processing.
//!
//! Scans a set of log sources (the child's stdout and stderr, or the
//! agent's own stdin when run at the end of a pipe), mirrors each line to
//! the configured sinks, maintains a bounded history per source, hands every
//! line to a synchronous hook in source order, and publishes a `log_line`
//! event on the log topic. Scanner and sink failures are reported on the
//! error topic and never stop the supervisor.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use procwatch_core::bus::{Event, EventBus, Topic};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::task::JoinHandle;

/// Event type tag for scanned log lines.
pub const LOG_LINE_EVENT: &str = "log_line";

/// The topic carrying [`LogEvent`]s.
#[must_use]
pub fn log_topic() -> Topic {
    Topic::new("log")
}

/// Log processor errors.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// The wait deadline elapsed before every source reached end-of-stream.
    #[error("deadline elapsed before log sources finished")]
    WaitTimeout,

    /// A sink could not be opened.
    #[error("could not open log sink {path}: {source}")]
    Sink {
        /// Sink path.
        path: String,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },
}

/// Payload of a `log_line` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    /// When the line was scanned.
    pub timestamp: DateTime<Utc>,
    /// The line, without its trailing newline.
    pub line: String,
}

/// Where log lines come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// The supervised child's stdout.
    ChildStdout,
    /// The supervised child's stderr.
    ChildStderr,
    /// The agent's own stdin, when running at the end of a pipe.
    AgentStdin,
}

/// Where mirrored log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkKind {
    /// The agent's stdout.
    AgentStdout,
    /// The agent's stderr.
    AgentStderr,
    /// An append-only file.
    File(PathBuf),
}

/// Options overriding default log routing.
///
/// Options apply in a fixed priority order no matter how they are passed,
/// so combinations behave predictably. History capacity is fixed when the
/// queues are constructed and the command binding is applied next, before
/// any of these options; suppressions then run output-side before
/// input-side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOption {
    /// Do not mirror lines to the agent's stdout.
    SuppressStdoutOutput,
    /// Do not mirror lines to the agent's stderr.
    SuppressStderrOutput,
    /// Do not mirror lines anywhere.
    SuppressAllOutput,
    /// Do not scan the child's stdout.
    SuppressStdoutInput,
    /// Do not scan the child's stderr.
    SuppressStderrInput,
    /// Additionally mirror lines to an append-only file.
    FileSink(PathBuf),
}

impl LogOption {
    fn priority(&self) -> u8 {
        match self {
            Self::FileSink(_) => 0,
            Self::SuppressStdoutOutput => 1,
            Self::SuppressStderrOutput => 2,
            Self::SuppressAllOutput => 3,
            Self::SuppressStdoutInput => 4,
            Self::SuppressStderrInput => 5,
        }
    }
}

/// A bounded FIFO of recent log lines.
///
/// On overflow the oldest line is evicted, one per insertion.
#[derive(Debug)]
pub struct HistoryQueue {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl HistoryQueue {
    /// Create a queue retaining at most `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append a line, evicting the oldest if the queue is full.
    pub fn add(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock().expect("lock poisoned");
        if lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Copy of the retained lines, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .expect("lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Number of retained lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.lock().expect("lock poisoned").len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard every retained line.
    pub fn clear(&self) {
        self.lines.lock().expect("lock poisoned").clear();
    }
}

/// Synchronous per-line hook, called in source order before the line event
/// is published. The supervisor installs the rule matcher here.
pub type LineHook = Arc<dyn Fn(SourceKind, &str) + Send + Sync>;

/// What the processor scans: a forked child's pipes, or the agent's stdin.
pub enum LogBinding {
    /// Scan a child's stdout and stderr, mirroring to the agent's stdout
    /// and stderr respectively.
    Child {
        /// The child's stdout pipe.
        stdout: ChildStdout,
        /// The child's stderr pipe.
        stderr: ChildStderr,
        /// History queue receiving stdout lines.
        stdout_history: Arc<HistoryQueue>,
        /// History queue receiving stderr lines.
        stderr_history: Arc<HistoryQueue>,
    },
    /// Scan the agent's stdin, mirroring to its stdout. Stderr information
    /// is lost in a pipe.
    Stdin {
        /// History queue receiving stdin lines.
        history: Arc<HistoryQueue>,
    },
}

struct SourceSpec {
    kind: SourceKind,
    history: Arc<HistoryQueue>,
    reader: Box<dyn AsyncRead + Send + Unpin>,
    sinks: Vec<SinkKind>,
}

/// Processes configured log sources until they reach end-of-stream.
pub struct LogProcessor {
    tasks: Vec<JoinHandle<()>>,
}

impl LogProcessor {
    /// Start scanning. One task per source runs until end-of-stream.
    pub fn spawn(
        bus: Arc<EventBus>,
        binding: LogBinding,
        options: Vec<LogOption>,
        hook: Option<LineHook>,
    ) -> Self {
        let mut options = options;
        options.sort_by_key(LogOption::priority);

        // The command binding determines the default sources and sinks.
        let mut sources: Vec<SourceSpec> = match binding {
            LogBinding::Child {
                stdout,
                stderr,
                stdout_history,
                stderr_history,
            } => vec![
                SourceSpec {
                    kind: SourceKind::ChildStdout,
                    history: stdout_history,
                    reader: Box::new(stdout),
                    sinks: vec![SinkKind::AgentStdout],
                },
                SourceSpec {
                    kind: SourceKind::ChildStderr,
                    history: stderr_history,
                    reader: Box::new(stderr),
                    sinks: vec![SinkKind::AgentStderr],
                },
            ],
            LogBinding::Stdin { history } => vec![SourceSpec {
                kind: SourceKind::AgentStdin,
                history,
                reader: Box::new(tokio::io::stdin()),
                sinks: vec![SinkKind::AgentStdout],
            }],
        };

        for option in options {
            match option {
                LogOption::FileSink(path) => {
                    for source in &mut sources {
                        source.sinks.push(SinkKind::File(path.clone()));
                    }
                },
                LogOption::SuppressStdoutOutput => {
                    for source in &mut sources {
                        source.sinks.retain(|s| *s != SinkKind::AgentStdout);
                    }
                },
                LogOption::SuppressStderrOutput => {
                    for source in &mut sources {
                        source.sinks.retain(|s| *s != SinkKind::AgentStderr);
                    }
                },
                LogOption::SuppressAllOutput => {
                    for source in &mut sources {
                        source.sinks.clear();
                    }
                },
                LogOption::SuppressStdoutInput => {
                    sources.retain(|s| s.kind != SourceKind::ChildStdout);
                },
                LogOption::SuppressStderrInput => {
                    sources.retain(|s| s.kind != SourceKind::ChildStderr);
                },
            }
        }

        let tasks = sources
            .into_iter()
            .map(|source| {
                let bus = Arc::clone(&bus);
                let hook = hook.clone();
                tokio::spawn(scan_source(bus, source, hook))
            })
            .collect();

        Self { tasks }
    }

    /// Wait until every source reaches end-of-stream and its sinks are
    /// closed.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::WaitTimeout`] when `deadline` elapses first.
    pub async fn wait(&mut self, deadline: Option<Duration>) -> Result<(), LogError> {
        let tasks = std::mem::take(&mut self.tasks);
        let join_all = async {
            for task in tasks {
                // Individual scanner panics are contained; a cancelled or
                // panicked task still counts as closed.
                let _ = task.await;
            }
        };
        match deadline {
            Some(deadline) => tokio::time::timeout(deadline, join_all)
                .await
                .map_err(|_| LogError::WaitTimeout),
            None => {
                join_all.await;
                Ok(())
            },
        }
    }
}

enum SinkWriter {
    Stdout(tokio::io::Stdout),
    Stderr(tokio::io::Stderr),
    File(tokio::fs::File),
}

impl SinkWriter {
    async fn open(kind: &SinkKind) -> Result<Self, LogError> {
        match kind {
            SinkKind::AgentStdout => Ok(Self::Stdout(tokio::io::stdout())),
            SinkKind::AgentStderr => Ok(Self::Stderr(tokio::io::stderr())),
            SinkKind::File(path) => {
                let file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .map_err(|source| LogError::Sink {
                        path: path.display().to_string(),
                        source,
                    })?;
                Ok(Self::File(file))
            },
        }
    }

    async fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Stdout(w) => {
                w.write_all(line).await?;
                w.write_all(b"\n").await?;
                w.flush().await
            },
            Self::Stderr(w) => {
                w.write_all(line).await?;
                w.write_all(b"\n").await?;
                w.flush().await
            },
            Self::File(w) => {
                w.write_all(line).await?;
                w.write_all(b"\n").await
            },
        }
    }

    async fn close(&mut self) {
        let result = match self {
            Self::Stdout(w) => w.flush().await,
            Self::Stderr(w) => w.flush().await,
            Self::File(w) => w.shutdown().await,
        };
        // Closing a console stream cannot meaningfully fail mid-teardown.
        drop(result);
    }
}

async fn scan_source(bus: Arc<EventBus>, source: SourceSpec, hook: Option<LineHook>) {
    let mut sinks = Vec::with_capacity(source.sinks.len());
    for kind in &source.sinks {
        match SinkWriter::open(kind).await {
            Ok(sink) => sinks.push(sink),
            Err(e) => bus.dispatch_error(&e),
        }
    }

    let mut reader = BufReader::new(source.reader);
    let mut buf = Vec::with_capacity(4096);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while buf.last().is_some_and(|b| *b == b'\n' || *b == b'\r') {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();

                source.history.add(line.clone());
                if let Some(hook) = &hook {
                    hook(source.kind, &line);
                }

                let payload = LogEvent {
                    timestamp: Utc::now(),
                    line: line.clone(),
                };
                match Event::new(LOG_LINE_EVENT, &payload) {
                    Ok(event) => bus.dispatch(event, [log_topic()]),
                    Err(e) => bus.dispatch_error(&e),
                }

                for sink in &mut sinks {
                    if let Err(e) = sink.write_line(line.as_bytes()).await {
                        bus.dispatch_error(&e);
                    }
                }
            },
            Err(e) => {
                // The stream is unusable after a read error; report and
                // treat as end-of-stream.
                bus.dispatch_error(&e);
                break;
            },
        }
    }

    for sink in &mut sinks {
        sink.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_queue_evicts_one_line_per_overflow() {
        let q = HistoryQueue::new(3);
        for line in ["a", "b", "c", "d", "e"] {
            q.add(line.to_string());
        }
        assert_eq!(q.snapshot(), vec!["c", "d", "e"]);
    }

    #[test]
    fn test_history_queue_zero_capacity() {
        let q = HistoryQueue::new(0);
        q.add("line".to_string());
        assert!(q.is_empty());
    }

    #[test]
    fn test_history_queue_clear() {
        let q = HistoryQueue::new(2);
        q.add("a".to_string());
        q.clear();
        assert!(q.snapshot().is_empty());
    }

    #[test]
    fn test_option_priority_order() {
        let mut options = vec![
            LogOption::SuppressStderrInput,
            LogOption::SuppressAllOutput,
            LogOption::SuppressStdoutOutput,
        ];
        options.sort_by_key(LogOption::priority);
        assert_eq!(
            options,
            vec![
                LogOption::SuppressStdoutOutput,
                LogOption::SuppressAllOutput,
                LogOption::SuppressStderrInput,
            ]
        );
    }

    #[tokio::test]
    async fn test_scan_child_output() {
        use std::process::Stdio;

        let bus = Arc::new(EventBus::new());
        let (mut events, _handle) = bus.subscribe([log_topic()]);

        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "echo one; echo two"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();

        let stdout_history = Arc::new(HistoryQueue::new(10));
        let stderr_history = Arc::new(HistoryQueue::new(10));
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let hook_seen = Arc::clone(&seen);
        let hook: LineHook = Arc::new(move |_, line| {
            hook_seen.lock().expect("lock poisoned").push(line.to_string());
        });

        let mut logs = LogProcessor::spawn(
            Arc::clone(&bus),
            LogBinding::Child {
                stdout: child.stdout.take().unwrap(),
                stderr: child.stderr.take().unwrap(),
                stdout_history: Arc::clone(&stdout_history),
                stderr_history: Arc::clone(&stderr_history),
            },
            vec![LogOption::SuppressAllOutput],
            Some(hook),
        );

        child.wait().await.unwrap();
        logs.wait(Some(Duration::from_secs(5))).await.unwrap();

        // Source order is preserved in the hook and history.
        assert_eq!(stdout_history.snapshot(), vec!["one", "two"]);
        assert_eq!(*seen.lock().expect("lock poisoned"), vec!["one", "two"]);
        assert!(stderr_history.is_empty());

        // Each line was published on the log topic. Bus delivery order is
        // not guaranteed across dispatches, so compare as a set.
        let mut lines = Vec::new();
        for _ in 0..2 {
            let event = events.recv().await.unwrap();
            assert_eq!(event.kind(), LOG_LINE_EVENT);
            lines.push(event.decode::<LogEvent>().unwrap().line);
        }
        lines.sort();
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_wait_timeout_when_source_stays_open() {
        let bus = Arc::new(EventBus::new());

        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "sleep 5"])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .unwrap();

        let mut logs = LogProcessor::spawn(
            bus,
            LogBinding::Child {
                stdout: child.stdout.take().unwrap(),
                stderr: child.stderr.take().unwrap(),
                stdout_history: Arc::new(HistoryQueue::new(4)),
                stderr_history: Arc::new(HistoryQueue::new(4)),
            },
            vec![LogOption::SuppressAllOutput],
            None,
        );

        let result = logs.wait(Some(Duration::from_millis(100))).await;
        assert!(matches!(result, Err(LogError::WaitTimeout)));

        child.kill().await.unwrap();
    }
}
