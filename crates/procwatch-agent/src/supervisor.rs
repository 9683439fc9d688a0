//! The supervisor control loop.
//!
//! One controller composes child-process lifecycle, signal handling,
//! kill/warn timers, periodic memory sampling, and log scanning into a
//! single select loop. Exactly one handler concludes the loop with a
//! terminal report reason; shutdown then proceeds in order: scanners
//! drained, terminal report dispatched, dispatcher waited, bus shut down,
//! cleanup callbacks run.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use procwatch_core::bus::EventBus;
use procwatch_core::proto::{KillReason, ReportReason};
use tokio::process::Child;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

use crate::command::{match_rules, wrap_complex_command, Cleanup, Command, FileArtifact};
use crate::config::Config;
use crate::errors::{ErrorReporter, LogReporter};
use crate::logs::{LineHook, LogBinding, LogProcessor, SourceKind};
use crate::memory::sample_memory;
use crate::report::ReportDispatcher;
use crate::AgentError;

/// How long to wait for scanners to drain after the child terminates.
const SCANNER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for a killed child to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for event-bus shutdown during teardown.
const BUS_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Memory sampling cadence for ordinary runs.
const MEMORY_TICK: Duration = Duration::from_secs(1);

/// Memory sampling cadence in daemon mode.
const MEMORY_TICK_DAEMON: Duration = Duration::from_secs(30);

/// The event that concluded the control loop.
enum Terminal {
    Finished(std::process::ExitStatus),
    Signaled(Signal),
    TimedOut,
    OutOfMemory,
}

/// Supervises one run of the user command.
pub struct Supervisor {
    command: Arc<Mutex<Command>>,
    bus: Arc<EventBus>,
    dispatcher: Arc<ReportDispatcher>,
    reporter: Arc<dyn ErrorReporter>,
}

impl Supervisor {
    /// Create a supervisor for the given user command.
    #[must_use]
    pub fn new(user_command: Vec<String>, config: Config) -> Self {
        let reporter: Arc<dyn ErrorReporter> =
            Arc::new(LogReporter::new(config.error_reports));
        let command = Arc::new(Mutex::new(Command::new(user_command, config)));
        let dispatcher = Arc::new(ReportDispatcher::new(
            Arc::clone(&command),
            Arc::clone(&reporter),
        ));
        Self {
            command,
            bus: Arc::new(EventBus::new()),
            dispatcher,
            reporter,
        }
    }

    /// Create a supervisor around an existing command record and
    /// dispatcher, e.g. one with a shortened delivery budget.
    #[must_use]
    pub fn with_dispatcher(
        command: Arc<Mutex<Command>>,
        dispatcher: Arc<ReportDispatcher>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            command,
            bus: Arc::new(EventBus::new()),
            dispatcher,
            reporter,
        }
    }

    /// Shared command state.
    #[must_use]
    pub fn command(&self) -> Arc<Mutex<Command>> {
        Arc::clone(&self.command)
    }

    /// The in-process event bus carrying log-line and error events.
    #[must_use]
    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    /// Execute and supervise the user command until completion.
    ///
    /// Returns the exit code the agent process should finish with: `0` for
    /// a successful run, the child's exit code for an ordinary failure, `1`
    /// otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error when the command cannot be prepared, spawned, or
    /// awaited, or when signal handlers cannot be registered. Runtime
    /// observational failures are contained and reported instead.
    pub async fn exec(&self) -> Result<i32, AgentError> {
        let (config, user_command) = {
            let cmd = self.command.lock().expect("lock poisoned");
            (cmd.config.clone(), cmd.user_command.clone())
        };

        let (argv, cleanup) = wrap_complex_command(&config.shell, &user_command)
            .map_err(AgentError::Wrap)?;
        let mut cleanups: Vec<Cleanup> = cleanup.into_iter().collect();

        let result = self.run_child(&config, &argv).await;
        run_cleanups(&mut cleanups);
        result
    }

    async fn run_child(&self, config: &Config, argv: &[String]) -> Result<i32, AgentError> {
        let mut child = tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(AgentError::Spawn)?;
        let pid = child.id();
        {
            let mut cmd = self.command.lock().expect("lock poisoned");
            cmd.start = Some(Utc::now());
        }
        debug!(pid, command = argv.join(" "), "process started");

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => (out, err),
            _ => {
                return Err(AgentError::Spawn(std::io::Error::other(
                    "child pipes unavailable",
                )))
            },
        };
        let (stdout_history, stderr_history) = {
            let cmd = self.command.lock().expect("lock poisoned");
            (Arc::clone(&cmd.stdout), Arc::clone(&cmd.stderr))
        };
        let mut logs = LogProcessor::spawn(
            Arc::clone(&self.bus),
            LogBinding::Child {
                stdout,
                stderr,
                stdout_history,
                stderr_history,
            },
            Vec::new(),
            Some(self.line_hook(config)),
        );

        if config.daemon {
            self.dispatcher.dispatch(ReportReason::Start);
        }

        let mut sigint = signal(SignalKind::interrupt()).map_err(AgentError::Signal)?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(AgentError::Signal)?;

        let kill_timer = maybe_sleep(config.kill_timeout);
        let warn_timer = maybe_sleep(config.warn_timeout);
        tokio::pin!(kill_timer, warn_timer);
        let kill_armed = config.kill_timeout.is_some();
        let mut warn_armed = config.warn_timeout.is_some();

        // Memory inspection is Linux-only; the sampler is never armed
        // elsewhere.
        let memory_armed = cfg!(target_os = "linux") && pid.is_some();
        let cadence = if config.daemon {
            MEMORY_TICK_DAEMON
        } else {
            MEMORY_TICK
        };
        let mut memory_tick = tokio::time::interval(cadence);
        memory_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let terminal = loop {
            tokio::select! {
                status = child.wait() => {
                    break Terminal::Finished(status.map_err(AgentError::Wait)?);
                },
                _ = sigint.recv() => break Terminal::Signaled(Signal::SIGINT),
                _ = sigterm.recv() => break Terminal::Signaled(Signal::SIGTERM),
                () = &mut kill_timer, if kill_armed => break Terminal::TimedOut,
                () = &mut warn_timer, if warn_armed => {
                    warn_armed = false;
                    self.dispatcher.dispatch(ReportReason::TimeWarning);
                },
                _ = memory_tick.tick(), if memory_armed => {
                    if let Some(pid) = pid {
                        if self.check_memory(pid) {
                            break Terminal::OutOfMemory;
                        }
                    }
                },
            }
        };

        let reason = self
            .conclude(terminal, &mut child, &mut logs, config)
            .await?;
        self.dispatcher.dispatch(reason);
        self.dispatch_deferred_alerts(config);

        self.dispatcher.wait().await;
        if let Err(e) = self.bus.shutdown(BUS_SHUTDOWN_TIMEOUT).await {
            self.reporter.report(&e);
        }

        let cmd = self.command.lock().expect("lock poisoned");
        Ok(exit_code_for(&cmd))
    }

    /// Apply the terminal handler for the event that ended the loop. The
    /// terminal report is only dispatched after the scanners have closed.
    async fn conclude(
        &self,
        terminal: Terminal,
        child: &mut Child,
        logs: &mut LogProcessor,
        config: &Config,
    ) -> Result<ReportReason, AgentError> {
        let reason = match terminal {
            Terminal::Finished(status) => {
                self.drain_scanners(logs).await;
                let mut cmd = self.command.lock().expect("lock poisoned");
                cmd.mark_finished();
                match status.code() {
                    Some(code) => {
                        cmd.exit_code = code;
                        cmd.exit_code_valid = true;
                        cmd.success = status.success();
                    },
                    None => cmd.success = false,
                }

                let mut reason = if cmd.success {
                    ReportReason::Success
                } else {
                    ReportReason::Failure
                };
                for path in &config.creates {
                    match std::fs::metadata(path) {
                        Ok(meta) => cmd.created.push(FileArtifact {
                            path: path.clone(),
                            size: meta.len(),
                            modified: meta.modified().map(Into::into).unwrap_or_else(|_| Utc::now()),
                        }),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                            reason = ReportReason::FileNotCreated;
                            cmd.success = false;
                            cmd.messages
                                .push(format!("file not created: {}", path.display()));
                        },
                        Err(_) => {},
                    }
                }

                info!(
                    stdout_lines = cmd.stdout.len(),
                    stderr_lines = cmd.stderr.len(),
                    duration = %humantime::format_duration(cmd.duration),
                    max_memory = cmd.max_memory,
                    reason = %reason,
                    "process finished"
                );
                reason
            },
            Terminal::Signaled(sig) => {
                {
                    let mut cmd = self.command.lock().expect("lock poisoned");
                    cmd.mark_finished();
                    cmd.killed = true;
                    cmd.kill_reason = Some(KillReason::Signal);
                }
                if let Some(pid) = child.id() {
                    #[allow(clippy::cast_possible_wrap)] // PIDs fit in i32
                    if let Err(e) = nix::sys::signal::kill(Pid::from_raw(pid as i32), sig) {
                        warn!(error = %e, "could not forward signal to child");
                    }
                }
                info!(signal = sig.as_str(), "process received signal");
                reap(child).await;
                self.drain_scanners(logs).await;
                ReportReason::Killed
            },
            Terminal::TimedOut => {
                {
                    let mut cmd = self.command.lock().expect("lock poisoned");
                    cmd.mark_finished();
                    cmd.killed = true;
                    cmd.kill_reason = Some(KillReason::Timeout);
                }
                info!("process exceeded its kill timeout");
                kill_child(child);
                reap(child).await;
                self.drain_scanners(logs).await;
                ReportReason::Killed
            },
            Terminal::OutOfMemory => {
                {
                    let mut cmd = self.command.lock().expect("lock poisoned");
                    cmd.mark_finished();
                    cmd.killed = true;
                    cmd.kill_reason = Some(KillReason::Memory);
                }
                info!("process exceeded its memory kill threshold");
                kill_child(child);
                reap(child).await;
                self.drain_scanners(logs).await;
                ReportReason::Killed
            },
        };
        Ok(reason)
    }

    /// The synchronous per-line hook: rule matching in source order,
    /// immediate alert dispatch in daemon mode.
    fn line_hook(&self, config: &Config) -> LineHook {
        let command = Arc::clone(&self.command);
        let dispatcher = Arc::clone(&self.dispatcher);
        let rules = config.rules.clone();
        let daemon = config.daemon;
        let rate_alerting = config.rule_quantity > 0;

        Arc::new(move |_source: SourceKind, line: &str| {
            let matches = match_rules(line, &rules);
            if matches.is_empty() {
                return;
            }
            command
                .lock()
                .expect("lock poisoned")
                .rule_matches
                .extend(matches);

            if daemon {
                let reason = if rate_alerting {
                    ReportReason::AlertRate
                } else {
                    ReportReason::Alert
                };
                dispatcher.dispatch(reason);
            }
        })
    }

    /// Outside daemon mode rule matches accumulate for the whole run and
    /// produce one alert report at termination.
    fn dispatch_deferred_alerts(&self, config: &Config) {
        if config.daemon {
            return;
        }
        let has_matches = !self
            .command
            .lock()
            .expect("lock poisoned")
            .rule_matches
            .is_empty();
        if has_matches {
            let reason = if config.rule_quantity > 0 {
                ReportReason::AlertRate
            } else {
                ReportReason::Alert
            };
            self.dispatcher.dispatch(reason);
        }
    }

    /// Sample the child's memory; returns true when the kill threshold was
    /// crossed.
    fn check_memory(&self, pid: u32) -> bool {
        let mem = sample_memory(pid);
        let (warn, kill) = {
            let mut cmd = self.command.lock().expect("lock poisoned");
            if mem > cmd.max_memory {
                cmd.max_memory = mem;
            }
            (
                cmd.config.memory_warn.is_some_and(|limit| mem >= limit),
                cmd.config.memory_kill.is_some_and(|limit| mem >= limit),
            )
        };
        if warn {
            self.dispatcher.dispatch(ReportReason::MemoryWarning);
        }
        kill
    }

    async fn drain_scanners(&self, logs: &mut LogProcessor) {
        if let Err(e) = logs.wait(Some(SCANNER_DRAIN_TIMEOUT)).await {
            self.reporter.report(&e);
        }
    }

    /// Scan the agent's own stdin at the end of a pipe until end-of-stream,
    /// then report completion.
    ///
    /// # Errors
    ///
    /// Infallible today; the signature leaves room for sink configuration
    /// failures.
    pub async fn exec_piped(&self) -> Result<i32, AgentError> {
        let config = {
            let mut cmd = self.command.lock().expect("lock poisoned");
            cmd.start = Some(Utc::now());
            cmd.config.clone()
        };
        let history = {
            let cmd = self.command.lock().expect("lock poisoned");
            Arc::clone(&cmd.stdout)
        };

        let mut logs = LogProcessor::spawn(
            Arc::clone(&self.bus),
            LogBinding::Stdin { history },
            Vec::new(),
            Some(self.line_hook(&config)),
        );
        if config.daemon {
            self.dispatcher.dispatch(ReportReason::Start);
        }

        if let Err(e) = logs.wait(None).await {
            self.reporter.report(&e);
        }
        {
            let mut cmd = self.command.lock().expect("lock poisoned");
            cmd.mark_finished();
            cmd.success = true;
        }
        self.dispatcher.dispatch(ReportReason::Success);
        self.dispatch_deferred_alerts(&config);

        self.dispatcher.wait().await;
        if let Err(e) = self.bus.shutdown(BUS_SHUTDOWN_TIMEOUT).await {
            self.reporter.report(&e);
        }
        Ok(0)
    }
}

async fn maybe_sleep(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

fn kill_child(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "could not kill child process");
    }
}

async fn reap(child: &mut Child) {
    let _ = tokio::time::timeout(REAP_TIMEOUT, child.wait()).await;
}

fn run_cleanups(cleanups: &mut Vec<Cleanup>) {
    for cleanup in cleanups.drain(..) {
        if let Err(e) = cleanup() {
            warn!(error = %e, "cleanup failed");
        }
    }
}

fn exit_code_for(cmd: &Command) -> i32 {
    if cmd.success {
        0
    } else if cmd.exit_code_valid && cmd.exit_code != 0 {
        cmd.exit_code
    } else {
        1
    }
}
