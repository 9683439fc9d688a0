//! Agent configuration.
//!
//! An immutable [`Config`] snapshot is constructed once at startup from the
//! command line and optional configuration file, then shared read-only with
//! every component. The builder collects every validation failure instead of
//! stopping at the first, so a user sees all configuration problems at once.

use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

/// Default collector endpoint.
pub const DEFAULT_HOST: &str = "collector.procwatch.dev";

/// Default collector port.
pub const DEFAULT_PORT: u16 = 443;

/// Default number of retained log lines per stream.
pub const DEFAULT_HISTORY: usize = 30;

/// Configuration errors, surfaced to the user as startup failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No monitor id was supplied.
    #[error("id is required, use procwatch -i <id>; an email address works for anonymous reporting when the collector allows it")]
    MissingId,

    /// A rule regex failed to compile.
    #[error("invalid rule regex: {0}")]
    InvalidRegex(#[from] regex::Error),

    /// A JSON rule was not in `field:regex` form.
    #[error("invalid format for json rule, expected field:regex in {0}")]
    InvalidJsonRule(String),

    /// A memory threshold could not be parsed.
    #[error("could not parse memory limit: {0}")]
    InvalidMemory(String),

    /// A duration could not be parsed.
    #[error("unrecognized duration: {0}")]
    InvalidDuration(String),

    /// A numeric option could not be parsed.
    #[error("could not convert {key} to an integer: {value}")]
    InvalidInteger {
        /// Option name.
        key: String,
        /// Rejected value.
        value: String,
    },

    /// The collector host was not `host:port`.
    #[error("unknown host, use host:port")]
    InvalidHost(String),

    /// No shell could be determined for complex commands.
    #[error("could not determine default shell, set with --shell <full path to shell>")]
    MissingShell,

    /// A configuration file could not be read or parsed.
    #[error("could not read config file {path}: {reason}")]
    File {
        /// Path to the file.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A configuration file key is not a known option.
    #[error("unknown configuration key: {0}")]
    UnknownKey(String),
}

/// A log-scanning rule: a regex, optionally scoped to a JSON field path.
///
/// Without a field the regex runs over the raw line. With a field, the line
/// is decoded as JSON and the regex runs over the text projection of that
/// field; nested fields are selected with a dotted path.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Dotted JSON field path, or `None` to match the raw line.
    pub field: Option<String>,
    /// Compiled expression.
    pub regex: Regex,
}

impl Serialize for Rule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Rule", 2)?;
        state.serialize_field("field", &self.field)?;
        state.serialize_field("regex", self.regex.as_str())?;
        state.end()
    }
}

/// Immutable configuration snapshot for one supervised run.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Monitor identifier connecting reports to notification channels.
    pub id: String,

    /// Log-scanning rules.
    pub rules: Vec<Rule>,

    /// Rule matches required within `rule_period` to trigger a rate alert;
    /// zero disables rate alerting in favor of per-match alerts.
    pub rule_quantity: usize,

    /// Sliding window for the rate alert; zero counts all matches.
    #[serde(with = "humantime_serde")]
    pub rule_period: Duration,

    /// Hostname reported to the collector.
    pub hostname: String,

    /// Send a warning report when run time exceeds this duration.
    #[serde(with = "humantime_serde::option")]
    pub warn_timeout: Option<Duration>,

    /// Kill the process when run time exceeds this duration.
    #[serde(with = "humantime_serde::option")]
    pub kill_timeout: Option<Duration>,

    /// Send a warning report when resident memory exceeds this many
    /// kilobytes.
    pub memory_warn: Option<u64>,

    /// Kill the process when resident memory exceeds this many kilobytes.
    pub memory_kill: Option<u64>,

    /// The supervised process is long-running: send a start report, sample
    /// memory less aggressively, and emit alerts immediately.
    pub daemon: bool,

    /// Files the process is expected to create; their absence is reported.
    pub creates: Vec<PathBuf>,

    /// Lines of stdout retained for reports.
    pub stdout_history: usize,

    /// Lines of stderr retained for reports.
    pub stderr_history: usize,

    /// Whether to report successful completion.
    pub notify_on_success: bool,

    /// Whether to report failure exits.
    pub notify_on_failure: bool,

    /// Shell used to run complex commands.
    pub shell: PathBuf,

    /// Collector host.
    pub host: String,

    /// Collector port.
    pub port: u16,

    /// Whether to secure the collector connection with TLS.
    pub use_tls: bool,

    /// Whether unhandled runtime errors may be reported to the maintainers'
    /// crash channel.
    pub error_reports: bool,
}

/// Builder that accumulates options and validation errors.
#[derive(Debug)]
pub struct ConfigBuilder {
    id: Option<String>,
    rules: Vec<Rule>,
    rule_quantity: usize,
    rule_period: Duration,
    warn_timeout: Option<Duration>,
    kill_timeout: Option<Duration>,
    memory_warn: Option<u64>,
    memory_kill: Option<u64>,
    daemon: bool,
    creates: Vec<PathBuf>,
    stdout_history: usize,
    stderr_history: usize,
    notify_on_success: bool,
    notify_on_failure: bool,
    shell: Option<PathBuf>,
    host: String,
    port: u16,
    use_tls: bool,
    error_reports: bool,
    errors: Vec<ConfigError>,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    /// Start from the documented defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: None,
            rules: Vec::new(),
            rule_quantity: 0,
            rule_period: Duration::ZERO,
            warn_timeout: None,
            kill_timeout: None,
            memory_warn: None,
            memory_kill: None,
            daemon: false,
            creates: Vec::new(),
            stdout_history: DEFAULT_HISTORY,
            stderr_history: DEFAULT_HISTORY,
            notify_on_success: true,
            notify_on_failure: true,
            shell: None,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            use_tls: true,
            error_reports: true,
            errors: Vec::new(),
        }
    }

    /// Monitor id used to connect reports with notification channels.
    pub fn id(&mut self, id: &str) -> &mut Self {
        self.id = Some(id.to_string());
        self
    }

    /// Add a rule that reports on a regex match in stdout or stderr.
    pub fn rule(&mut self, regex: &str) -> &mut Self {
        match Regex::new(regex) {
            Ok(regex) => self.rules.push(Rule { field: None, regex }),
            Err(e) => self.errors.push(ConfigError::InvalidRegex(e)),
        }
        self
    }

    /// Add a rule that matches against a field of JSON-decoded output.
    /// Nested fields are selected by a dotted path.
    pub fn json_rule(&mut self, field: &str, regex: &str) -> &mut Self {
        match Regex::new(regex) {
            Ok(regex) => self.rules.push(Rule {
                field: Some(field.to_string()),
                regex,
            }),
            Err(e) => self.errors.push(ConfigError::InvalidRegex(e)),
        }
        self
    }

    /// Add a `field:regex` JSON rule in its combined command-line form.
    pub fn json_rule_spec(&mut self, spec: &str) -> &mut Self {
        match spec.split_once(':') {
            Some((field, regex)) if !field.is_empty() => self.json_rule(field, regex),
            _ => {
                self.errors
                    .push(ConfigError::InvalidJsonRule(spec.to_string()));
                self
            },
        }
    }

    /// Report when at least this many rule matches occur within the rule
    /// period.
    pub fn rule_quantity(&mut self, value: &str) -> &mut Self {
        match value.parse::<usize>() {
            Ok(quantity) => self.rule_quantity = quantity,
            Err(_) => self.errors.push(ConfigError::InvalidInteger {
                key: "rule-quantity".to_string(),
                value: value.to_string(),
            }),
        }
        self
    }

    /// Sliding window for the rule-rate predicate, in humantime form.
    pub fn rule_period(&mut self, value: &str) -> &mut Self {
        match humantime::parse_duration(value) {
            Ok(period) => self.rule_period = period,
            Err(_) => self
                .errors
                .push(ConfigError::InvalidDuration(value.to_string())),
        }
        self
    }

    /// Lines of stdout to retain and send with reports.
    pub fn stdout_history(&mut self, value: &str) -> &mut Self {
        match value.parse::<usize>() {
            Ok(lines) => self.stdout_history = lines,
            Err(_) => self.errors.push(ConfigError::InvalidInteger {
                key: "stdout-history".to_string(),
                value: value.to_string(),
            }),
        }
        self
    }

    /// Lines of stderr to retain and send with reports.
    pub fn stderr_history(&mut self, value: &str) -> &mut Self {
        match value.parse::<usize>() {
            Ok(lines) => self.stderr_history = lines,
            Err(_) => self.errors.push(ConfigError::InvalidInteger {
                key: "stderr-history".to_string(),
                value: value.to_string(),
            }),
        }
        self
    }

    /// Do not report successful completion. Success reports feed deadman's
    /// switch notifications and completion history, so this is opt-out.
    pub fn no_notify_on_success(&mut self) -> &mut Self {
        self.notify_on_success = false;
        self
    }

    /// Do not report failure exits. Useful when the process does not use
    /// standard exit codes and failure reports are false positives.
    pub fn no_notify_on_failure(&mut self) -> &mut Self {
        self.notify_on_failure = false;
        self
    }

    /// Mark the process as long-running.
    pub fn daemon(&mut self) -> &mut Self {
        self.daemon = true;
        self
    }

    /// Warn when memory exceeds this threshold (`N`, `NK`, `NM`, `NG`).
    pub fn memory_warn(&mut self, value: &str) -> &mut Self {
        match parse_memory(value) {
            Ok(kb) => self.memory_warn = Some(kb),
            Err(e) => self.errors.push(e),
        }
        self
    }

    /// Kill the process when memory exceeds this threshold.
    pub fn memory_kill(&mut self, value: &str) -> &mut Self {
        match parse_memory(value) {
            Ok(kb) => self.memory_kill = Some(kb),
            Err(e) => self.errors.push(e),
        }
        self
    }

    /// Warn when run time exceeds this duration.
    pub fn timeout_warn(&mut self, value: &str) -> &mut Self {
        match humantime::parse_duration(value) {
            Ok(timeout) => self.warn_timeout = Some(timeout),
            Err(_) => self
                .errors
                .push(ConfigError::InvalidDuration(value.to_string())),
        }
        self
    }

    /// Kill the process when run time exceeds this duration.
    pub fn timeout_kill(&mut self, value: &str) -> &mut Self {
        match humantime::parse_duration(value) {
            Ok(timeout) => self.kill_timeout = Some(timeout),
            Err(_) => self
                .errors
                .push(ConfigError::InvalidDuration(value.to_string())),
        }
        self
    }

    /// Report when this file is not created by the end of the process.
    pub fn creates(&mut self, path: &str) -> &mut Self {
        self.creates.push(PathBuf::from(path));
        self
    }

    /// Collector endpoint as `host:port` for private reporting servers.
    pub fn host(&mut self, host_port: &str) -> &mut Self {
        match host_port.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => match port.parse::<u16>() {
                Ok(port) => {
                    self.host = host.to_string();
                    self.port = port;
                },
                Err(_) => self
                    .errors
                    .push(ConfigError::InvalidHost(host_port.to_string())),
            },
            _ => self
                .errors
                .push(ConfigError::InvalidHost(host_port.to_string())),
        }
        self
    }

    /// Allow a non-TLS collector connection. Only sensible on a private
    /// internal network.
    pub fn insecure(&mut self) -> &mut Self {
        self.use_tls = false;
        self
    }

    /// Suppress the crash-report side channel. Only the error text and a
    /// stack trace are ever sent; no command output or config data.
    pub fn no_error_reports(&mut self) -> &mut Self {
        self.error_reports = false;
        self
    }

    /// Shell used to execute complex commands.
    pub fn shell(&mut self, shell: &str) -> &mut Self {
        self.shell = Some(PathBuf::from(shell));
        self
    }

    /// Validate and produce the immutable configuration.
    ///
    /// # Errors
    ///
    /// Returns every accumulated validation error.
    pub fn build(mut self) -> Result<Config, Vec<ConfigError>> {
        let shell = match self.shell.take() {
            Some(shell) => Some(shell),
            None => match std::env::var_os("SHELL") {
                Some(shell) if !shell.is_empty() => Some(PathBuf::from(shell)),
                _ => {
                    self.errors.push(ConfigError::MissingShell);
                    None
                },
            },
        };
        if self.id.as_deref().is_none_or(str::is_empty) {
            self.errors.push(ConfigError::MissingId);
        }
        if !self.errors.is_empty() {
            return Err(self.errors);
        }

        Ok(Config {
            id: self.id.unwrap_or_default(),
            rules: self.rules,
            rule_quantity: self.rule_quantity,
            rule_period: self.rule_period,
            hostname: hostname(),
            warn_timeout: self.warn_timeout,
            kill_timeout: self.kill_timeout,
            memory_warn: self.memory_warn,
            memory_kill: self.memory_kill,
            daemon: self.daemon,
            creates: self.creates,
            stdout_history: self.stdout_history,
            stderr_history: self.stderr_history,
            notify_on_success: self.notify_on_success,
            notify_on_failure: self.notify_on_failure,
            shell: shell.unwrap_or_default(),
            host: self.host,
            port: self.port,
            use_tls: self.use_tls,
            error_reports: self.error_reports,
        })
    }

    /// Record an externally detected configuration error.
    pub fn push_error(&mut self, error: ConfigError) -> &mut Self {
        self.errors.push(error);
        self
    }
}

/// Parse a memory threshold with decimal unit suffixes.
///
/// Values are kilobytes: `K` = 1, `M` = 1000, `G` = 1 000 000. A bare
/// integer is taken as kilobytes.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidMemory`] for anything else.
pub fn parse_memory(value: &str) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::InvalidMemory(value.to_string());
    let (digits, multiplier) = match value.strip_suffix(['K', 'M', 'G']) {
        Some(digits) => match value.as_bytes()[value.len() - 1] {
            b'K' => (digits, 1),
            b'M' => (digits, 1000),
            _ => (digits, 1_000_000),
        },
        None => (value, 1),
    };
    let base: u64 = digits.parse().map_err(|_| invalid())?;
    Ok(base * multiplier)
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default()
}

mod humantime_serde {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub mod option {
        use std::time::Duration;

        use serde::Serializer;

        pub fn serialize<S>(
            duration: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(duration) => super::serialize(duration, serializer),
                None => serializer.serialize_none(),
            }
        }
    }
}
