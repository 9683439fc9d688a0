//! Command-line surface and configuration-file loading.
//!
//! The flag set maps one-to-one onto [`ConfigBuilder`] options. A TOML
//! configuration file supplies the same keys; scalar values apply once,
//! arrays repeat the option. Flags given on the command line override file
//! values.

use std::path::{Path, PathBuf};

use clap::Parser;

use crate::config::{Config, ConfigBuilder, ConfigError};

/// Wrap a command and report its lifecycle, output rules, and resource
/// usage to a collector.
#[derive(Parser, Debug)]
#[command(name = "procwatch")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "For unknown flag errors, add a flag separator (--) between \
                  the flags for procwatch and your command. Example:\n\n  \
                  procwatch -i id -c config.toml -- mycommand --otherflag"
)]
pub struct Cli {
    /// Identifier for this monitor (required)
    #[arg(short = 'i', long)]
    pub id: Option<String>,

    /// Use a TOML configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Report when this regex matches a line of output (repeatable)
    #[arg(long = "rule", value_name = "REGEX")]
    pub rule: Vec<String>,

    /// Report when a regex matches a field of JSON output, as field:regex;
    /// nested fields use a dotted path (repeatable)
    #[arg(long = "rule-json", value_name = "FIELD:REGEX")]
    pub rule_json: Vec<String>,

    /// Report when at least this many rule matches occur within the rule
    /// period
    #[arg(long, value_name = "N")]
    pub rule_quantity: Option<String>,

    /// Sliding window for the rule-rate report (e.g. 10m, 1h)
    #[arg(long, value_name = "DURATION")]
    pub rule_period: Option<String>,

    /// Number of lines of stdout to send with the report
    #[arg(long, value_name = "N")]
    pub stdout_history: Option<String>,

    /// Number of lines of stderr to send with the report
    #[arg(long, value_name = "N")]
    pub stderr_history: Option<String>,

    /// Do not send a report on successful completion
    #[arg(long)]
    pub no_notify_on_success: bool,

    /// Do not send a report on failure
    #[arg(long)]
    pub no_notify_on_failure: bool,

    /// Designate a long-running process; reports are sent immediately
    /// instead of at process exit
    #[arg(long)]
    pub daemon: bool,

    /// Send a report when memory use exceeds this value (e.g. 100M)
    #[arg(long, value_name = "N[K|M|G]")]
    pub memory_warn: Option<String>,

    /// Kill the process and report when memory use exceeds this value
    #[arg(long, value_name = "N[K|M|G]")]
    pub memory_kill: Option<String>,

    /// Send a report if the process runs longer than this (e.g. 32m)
    #[arg(long, value_name = "DURATION")]
    pub timeout_warn: Option<String>,

    /// Kill the process and report if it runs longer than this
    #[arg(long, value_name = "DURATION")]
    pub timeout_kill: Option<String>,

    /// Report if this file is not created by the end of the process
    /// (repeatable)
    #[arg(long, value_name = "PATH")]
    pub creates: Vec<String>,

    /// Send reports to a private collector as host:port
    #[arg(long, value_name = "HOST:PORT")]
    pub host: Option<String>,

    /// Do not use TLS for the collector connection
    #[arg(long)]
    pub insecure: bool,

    /// Do not send crash reports to the maintainers
    #[arg(long)]
    pub no_error_reports: bool,

    /// Shell used to execute complex commands
    #[arg(long, value_name = "PATH")]
    pub shell: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    pub log_level: String,

    /// The command to supervise; omit it to scan stdin at the end of a pipe
    #[arg(trailing_var_arg = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

/// Build the immutable configuration from the parsed command line.
///
/// The configuration file applies first so explicit flags override it.
///
/// # Errors
///
/// Returns every validation error found in the file and the flags.
pub fn build_config(cli: &Cli) -> Result<Config, Vec<ConfigError>> {
    let mut builder = ConfigBuilder::new();

    if let Some(path) = &cli.config {
        apply_file(&mut builder, path);
    }

    if let Some(id) = &cli.id {
        builder.id(id);
    }
    for rule in &cli.rule {
        builder.rule(rule);
    }
    for rule in &cli.rule_json {
        builder.json_rule_spec(rule);
    }
    if let Some(value) = &cli.rule_quantity {
        builder.rule_quantity(value);
    }
    if let Some(value) = &cli.rule_period {
        builder.rule_period(value);
    }
    if let Some(value) = &cli.stdout_history {
        builder.stdout_history(value);
    }
    if let Some(value) = &cli.stderr_history {
        builder.stderr_history(value);
    }
    if cli.no_notify_on_success {
        builder.no_notify_on_success();
    }
    if cli.no_notify_on_failure {
        builder.no_notify_on_failure();
    }
    if cli.daemon {
        builder.daemon();
    }
    if let Some(value) = &cli.memory_warn {
        builder.memory_warn(value);
    }
    if let Some(value) = &cli.memory_kill {
        builder.memory_kill(value);
    }
    if let Some(value) = &cli.timeout_warn {
        builder.timeout_warn(value);
    }
    if let Some(value) = &cli.timeout_kill {
        builder.timeout_kill(value);
    }
    for path in &cli.creates {
        builder.creates(path);
    }
    if let Some(host) = &cli.host {
        builder.host(host);
    }
    if cli.insecure {
        builder.insecure();
    }
    if cli.no_error_reports {
        builder.no_error_reports();
    }
    if let Some(shell) = &cli.shell {
        builder.shell(shell);
    }

    builder.build()
}

fn apply_file(builder: &mut ConfigBuilder, path: &Path) {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            builder.push_error(ConfigError::File {
                path: path.display().to_string(),
                reason: e.to_string(),
            });
            return;
        },
    };
    let table: toml::Table = match toml::from_str(&text) {
        Ok(table) => table,
        Err(e) => {
            builder.push_error(ConfigError::File {
                path: path.display().to_string(),
                reason: e.to_string(),
            });
            return;
        },
    };

    for (key, value) in table {
        match value {
            toml::Value::String(s) => apply_option(builder, &key, &s),
            toml::Value::Integer(n) => apply_option(builder, &key, &n.to_string()),
            toml::Value::Boolean(flag) => {
                if flag {
                    apply_flag(builder, &key);
                }
            },
            toml::Value::Array(items) => {
                for item in items {
                    match item {
                        toml::Value::String(s) => apply_option(builder, &key, &s),
                        other => apply_option(builder, &key, &other.to_string()),
                    }
                }
            },
            other => apply_option(builder, &key, &other.to_string()),
        }
    }
}

fn apply_option(builder: &mut ConfigBuilder, key: &str, value: &str) {
    match key {
        "id" => builder.id(value),
        "rule" => builder.rule(value),
        "rule-json" => builder.json_rule_spec(value),
        "rule-quantity" => builder.rule_quantity(value),
        "rule-period" => builder.rule_period(value),
        "stdout-history" => builder.stdout_history(value),
        "stderr-history" => builder.stderr_history(value),
        "memory-warn" => builder.memory_warn(value),
        "memory-kill" => builder.memory_kill(value),
        "timeout-warn" => builder.timeout_warn(value),
        "timeout-kill" => builder.timeout_kill(value),
        "creates" => builder.creates(value),
        "host" => builder.host(value),
        "shell" => builder.shell(value),
        _ => builder.push_error(ConfigError::UnknownKey(key.to_string())),
    };
}

fn apply_flag(builder: &mut ConfigBuilder, key: &str) {
    match key {
        "no-notify-on-success" => builder.no_notify_on_success(),
        "no-notify-on-failure" => builder.no_notify_on_failure(),
        "daemon" => builder.daemon(),
        "insecure" => builder.insecure(),
        "no-error-reports" => builder.no_error_reports(),
        _ => builder.push_error(ConfigError::UnknownKey(key.to_string())),
    };
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("procwatch").chain(args.iter().copied()))
    }

    #[test]
    fn test_flags_build_config() {
        let cli = parse(&[
            "-i",
            "monitor-1",
            "--rule",
            "ERROR",
            "--timeout-kill",
            "200ms",
            "--memory-kill",
            "1K",
            "--insecure",
            "--shell",
            "/bin/sh",
            "--",
            "sleep",
            "3",
        ]);

        assert_eq!(cli.command, vec!["sleep", "3"]);
        let cfg = build_config(&cli).unwrap();
        assert_eq!(cfg.id, "monitor-1");
        assert_eq!(cfg.rules.len(), 1);
        assert_eq!(
            cfg.kill_timeout,
            Some(std::time::Duration::from_millis(200))
        );
        assert_eq!(cfg.memory_kill, Some(1));
        assert!(!cfg.use_tls);
    }

    #[test]
    fn test_config_file_values_and_lists() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
id = "from-file"
stdout-history = 10
daemon = true
rule = ["alpha", "beta"]
creates = ["out.txt"]
"#
        )
        .unwrap();

        let cli = parse(&[
            "-c",
            file.path().to_str().unwrap(),
            "--shell",
            "/bin/sh",
            "--",
            "true",
        ]);
        let cfg = build_config(&cli).unwrap();

        assert_eq!(cfg.id, "from-file");
        assert_eq!(cfg.stdout_history, 10);
        assert!(cfg.daemon);
        assert_eq!(cfg.rules.len(), 2);
        assert_eq!(cfg.creates, vec![PathBuf::from("out.txt")]);
    }

    #[test]
    fn test_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "id = \"from-file\"").unwrap();

        let cli = parse(&[
            "-c",
            file.path().to_str().unwrap(),
            "-i",
            "from-flags",
            "--shell",
            "/bin/sh",
            "--",
            "true",
        ]);
        let cfg = build_config(&cli).unwrap();
        assert_eq!(cfg.id, "from-flags");
    }

    #[test]
    fn test_unknown_file_key_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "id = \"m\"\nbogus = \"value\"").unwrap();

        let cli = parse(&[
            "-c",
            file.path().to_str().unwrap(),
            "--shell",
            "/bin/sh",
            "--",
            "true",
        ]);
        let errors = build_config(&cli).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ConfigError::UnknownKey(k) if k == "bogus")));
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let cli = parse(&[
            "-c",
            "/nonexistent/procwatch.toml",
            "-i",
            "m",
            "--shell",
            "/bin/sh",
            "--",
            "true",
        ]);
        let errors = build_config(&cli).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ConfigError::File { .. })));
    }
}
