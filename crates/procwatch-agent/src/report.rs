//! Report dispatching.
//!
//! Converts a snapshot of command state plus a reason into a wire
//! [`Report`] and delivers it to the collector in a background task.
//! Delivery retries with capped exponential backoff and jitter for up to
//! one hour; a terminal failure goes to the crash reporter, never to the
//! user. Each reason carries its own gate, and the warning reasons latch so
//! a `(warn reason, command)` pair produces at most one report per run.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use procwatch_core::proto::{Ack, FrameCodec, KillReason, Report, ReportReason};
use prost::Message;
use rand::Rng;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::command::{Command, RuleMatch};
use crate::errors::ErrorReporter;

/// Overall budget for delivering one report.
pub const SEND_BUDGET: Duration = Duration::from_secs(3600);

/// Deadline for a single connect-and-send attempt.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Report delivery errors. These stay inside the dispatcher; only the
/// crash reporter ever sees them.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    /// Transport failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Framing failure.
    #[error(transparent)]
    Frame(#[from] procwatch_core::proto::FrameError),

    /// The collector's acknowledgment did not decode.
    #[error("invalid acknowledgment: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The collector host is not a valid TLS server name.
    #[error("invalid collector server name: {0}")]
    InvalidServerName(String),

    /// The collector refused the report or closed without acknowledging.
    #[error("collector did not accept the report")]
    Rejected,

    /// The attempt deadline elapsed.
    #[error("send attempt timed out")]
    AttemptTimeout,

    /// The dispatcher was cancelled mid-retry.
    #[error("send cancelled")]
    Cancelled,

    /// The one-hour delivery budget elapsed.
    #[error("timeout on background report send: reason={0}")]
    BudgetElapsed(ReportReason),
}

/// Capped exponential backoff with jitter between delivery attempts.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Ceiling for the delay.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub multiplier: f64,
    /// Random jitter range as a fraction of the delay.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the given 1-based attempt, with jitter applied.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        #[allow(clippy::cast_possible_wrap)] // attempt count stays small
        let base = self.initial_delay.as_secs_f64()
            * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((capped * jitter).max(0.0))
    }
}

/// The rule-rate predicate: at least `quantity` matches within `period` of
/// now, or, when `period` is zero, at least `quantity` matches in total.
#[must_use]
pub fn calc_alert_rate(matches: &[RuleMatch], quantity: usize, period: Duration) -> bool {
    let in_period = if period.is_zero() {
        matches.len()
    } else {
        let now = Utc::now();
        let period = chrono::Duration::from_std(period).unwrap_or(chrono::Duration::MAX);
        matches.iter().filter(|m| now - m.time <= period).count()
    };
    in_period >= quantity
}

/// Client for the collector's `Create(Report) -> Ack` exchange.
#[derive(Debug)]
pub struct CollectorClient {
    host: String,
    port: u16,
    use_tls: bool,
}

impl CollectorClient {
    /// A client for the given endpoint.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, use_tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            use_tls,
        }
    }

    /// One delivery attempt: connect, send the report, read the ack.
    ///
    /// # Errors
    ///
    /// Any transport, framing, or acknowledgment failure.
    pub async fn send(&self, report: &Report) -> Result<(), ReportError> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port)).await?;
        if self.use_tls {
            let server_name = rustls::pki_types::ServerName::try_from(self.host.clone())
                .map_err(|_| ReportError::InvalidServerName(self.host.clone()))?;
            let tls = tls_connector().connect(server_name, tcp).await?;
            exchange(tls, report).await
        } else {
            exchange(tcp, report).await
        }
    }
}

fn tls_connector() -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

async fn exchange<S>(stream: S, report: &Report) -> Result<(), ReportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, FrameCodec::new());
    framed.send(Bytes::from(report.encode_to_vec())).await?;

    let frame = framed.next().await.ok_or(ReportError::Rejected)??;
    let ack = Ack::decode(&frame[..])?;
    if ack.success {
        Ok(())
    } else {
        Err(ReportError::Rejected)
    }
}

/// Dispatches reports to the collector in background tasks.
pub struct ReportDispatcher {
    command: Arc<Mutex<Command>>,
    client: Arc<CollectorClient>,
    reporter: Arc<dyn ErrorReporter>,
    backoff: BackoffPolicy,
    send_budget: Duration,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReportDispatcher {
    /// A dispatcher for the given command; endpoint and gates come from the
    /// command's configuration.
    #[must_use]
    pub fn new(command: Arc<Mutex<Command>>, reporter: Arc<dyn ErrorReporter>) -> Self {
        let client = {
            let cmd = command.lock().expect("lock poisoned");
            CollectorClient::new(cmd.config.host.clone(), cmd.config.port, cmd.config.use_tls)
        };
        Self {
            command,
            client: Arc::new(client),
            reporter,
            backoff: BackoffPolicy::default(),
            send_budget: SEND_BUDGET,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Override the backoff policy and delivery budget.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy, send_budget: Duration) -> Self {
        self.backoff = backoff;
        self.send_budget = send_budget;
        self
    }

    /// Dispatch a report for `reason` if its gate allows it.
    ///
    /// Builds the report under the command mutex, then delivers it in a
    /// background task. `Alert` and `AlertRate` clear the accumulated rule
    /// matches only once delivery is confirmed; the warning latches are set
    /// here, at the dispatch decision, so retries cannot duplicate them.
    pub fn dispatch(&self, reason: ReportReason) {
        let (report, clear_matches) = {
            let mut cmd = self.command.lock().expect("lock poisoned");
            if !gate(&mut cmd, reason) {
                tracing::debug!(reason = %reason, "report gated off");
                return;
            }
            cmd.report_reason = Some(reason);
            let report = build_report(&cmd, reason, self.reporter.as_ref());
            let clear = matches!(reason, ReportReason::Alert | ReportReason::AlertRate);
            (report, clear)
        };

        tracing::info!(reason = %reason, "dispatching report");
        let command = Arc::clone(&self.command);
        let client = Arc::clone(&self.client);
        let reporter = Arc::clone(&self.reporter);
        let backoff = self.backoff.clone();
        let budget = self.send_budget;
        let cancel = self.cancel.clone();

        let task = tokio::spawn(async move {
            let send = send_with_backoff(&client, &report, &backoff, &cancel);
            match tokio::time::timeout(budget, send).await {
                Ok(Ok(())) => {
                    tracing::debug!(reason = %reason, "report delivered");
                    if clear_matches {
                        command
                            .lock()
                            .expect("lock poisoned")
                            .rule_matches
                            .clear();
                    }
                },
                Ok(Err(e)) => reporter.report(&e),
                Err(_) => reporter.report(&ReportError::BudgetElapsed(reason)),
            }
        });
        self.tasks.lock().expect("lock poisoned").push(task);
    }

    /// Cancel in-flight deliveries.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Block until every dispatched background send has terminated, whether
    /// by success, cancellation, or final failure.
    pub async fn wait(&self) {
        loop {
            let tasks = {
                let mut tasks = self.tasks.lock().expect("lock poisoned");
                std::mem::take(&mut *tasks)
            };
            if tasks.is_empty() {
                return;
            }
            for task in tasks {
                // Panics inside a send task are contained here.
                let _ = task.await;
            }
        }
    }
}

fn gate(cmd: &mut Command, reason: ReportReason) -> bool {
    match reason {
        ReportReason::Success => cmd.config.notify_on_success,
        ReportReason::Failure => cmd.config.notify_on_failure,
        ReportReason::Killed | ReportReason::FileNotCreated | ReportReason::Alert => true,
        ReportReason::AlertRate => calc_alert_rate(
            &cmd.rule_matches,
            cmd.config.rule_quantity,
            cmd.config.rule_period,
        ),
        ReportReason::MemoryWarning => !std::mem::replace(&mut cmd.mem_warn_sent, true),
        ReportReason::TimeWarning => !std::mem::replace(&mut cmd.time_warn_sent, true),
        ReportReason::Start => cmd.config.daemon,
        ReportReason::Unspecified => false,
    }
}

async fn send_with_backoff(
    client: &CollectorClient,
    report: &Report,
    backoff: &BackoffPolicy,
    cancel: &CancellationToken,
) -> Result<(), ReportError> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let result = tokio::time::timeout(ATTEMPT_TIMEOUT, client.send(report))
            .await
            .unwrap_or(Err(ReportError::AttemptTimeout));
        match result {
            Ok(()) => return Ok(()),
            Err(e) => {
                let delay = backoff.delay_for_attempt(attempt);
                tracing::debug!(
                    attempt,
                    delay = ?delay,
                    error = %e,
                    "report send failed, backing off"
                );
                tokio::select! {
                    () = cancel.cancelled() => return Err(ReportError::Cancelled),
                    () = tokio::time::sleep(delay) => {},
                }
            },
        }
    }
}

/// Convert command state into the wire report.
///
/// Marshalling failures of the opaque JSON fields are reported to the crash
/// reporter and leave the field empty; the report itself still goes out.
fn build_report(cmd: &Command, reason: ReportReason, reporter: &dyn ErrorReporter) -> Report {
    Report {
        id: cmd.config.id.clone(),
        hostname: cmd.config.hostname.clone(),
        stdout: cmd.stdout.snapshot(),
        stderr: cmd.stderr.snapshot(),
        success: cmd.success,
        max_memory: cmd.max_memory,
        killed: cmd.killed,
        kill_reason: cmd.kill_reason.unwrap_or(KillReason::Unspecified) as i32,
        created: marshal(&cmd.created, reporter),
        report_reason: reason as i32,
        start: cmd.start.map(|t| t.timestamp()).unwrap_or_default(),
        finish: cmd.finish.map(|t| t.timestamp()).unwrap_or_default(),
        duration: humantime::format_duration(cmd.duration).to_string(),
        exit_code: cmd.exit_code,
        exit_code_valid: cmd.exit_code_valid,
        messages: cmd.messages.clone(),
        matches: marshal(&cmd.rule_matches, reporter),
        user_command: cmd.user_command.join(" "),
        config: marshal(&cmd.config, reporter),
        created_at: Utc::now().timestamp(),
    }
}

fn marshal<T: Serialize>(value: &T, reporter: &dyn ErrorReporter) -> Vec<u8> {
    match serde_json::to_vec(value) {
        Ok(bytes) => bytes,
        Err(e) => {
            // The report continues even if this conversion fails.
            reporter.report(&e);
            Vec::new()
        },
    }
}
