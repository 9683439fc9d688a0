//! Command state.
//!
//! [`Command`] is the single record describing one supervised run. It is
//! owned by the supervisor behind one mutex; scanners, timer handlers, and
//! the report dispatcher take the lock only for the short spans in which
//! they mutate or snapshot state.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use procwatch_core::proto::{KillReason, ReportReason};
use serde::Serialize;

use crate::config::{Config, Rule};
use crate::logs::HistoryQueue;

/// An artifact file produced by the process. When configured, failure to
/// create the file triggers a report.
#[derive(Debug, Clone, Serialize)]
pub struct FileArtifact {
    /// Path that was checked.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: DateTime<Utc>,
}

/// A rule match against one output line.
#[derive(Debug, Clone, Serialize)]
pub struct RuleMatch {
    /// When the line was scanned.
    pub time: DateTime<Utc>,
    /// The raw line.
    pub line: String,
    /// Half-open byte ranges of every non-overlapping match within the
    /// projected text.
    pub index: Vec<(usize, usize)>,
}

/// The current state of one supervised process execution.
#[derive(Debug)]
pub struct Command {
    /// Immutable configuration snapshot.
    pub config: Config,
    /// The user command as given.
    pub user_command: Vec<String>,
    /// Bounded history of recent stdout lines, shared with the log
    /// processor.
    pub stdout: Arc<HistoryQueue>,
    /// Bounded history of recent stderr lines, shared with the log
    /// processor.
    pub stderr: Arc<HistoryQueue>,
    /// Rule matches accumulated since the last confirmed alert send.
    pub rule_matches: Vec<RuleMatch>,
    /// Whether the process exited successfully.
    pub success: bool,
    /// Whether the agent killed the process.
    pub killed: bool,
    /// Why the process was killed.
    pub kill_reason: Option<KillReason>,
    /// The reason of the most recently dispatched report.
    pub report_reason: Option<ReportReason>,
    /// Artifact files found after completion.
    pub created: Vec<FileArtifact>,
    /// Peak resident memory observed, in kilobytes.
    pub max_memory: u64,
    /// When the process started.
    pub start: Option<DateTime<Utc>>,
    /// When the process finished or was killed.
    pub finish: Option<DateTime<Utc>>,
    /// Total run time.
    pub duration: Duration,
    /// Exit code, meaningful when `exit_code_valid` is set.
    pub exit_code: i32,
    /// Whether the exit code was recoverable from the exit status.
    pub exit_code_valid: bool,
    /// Diagnostic messages surfaced in reports.
    pub messages: Vec<String>,
    /// Latch: a memory warning has been dispatched this run.
    pub mem_warn_sent: bool,
    /// Latch: a time warning has been dispatched this run.
    pub time_warn_sent: bool,
}

impl Command {
    /// Create the state record for a run of `user_command`.
    #[must_use]
    pub fn new(user_command: Vec<String>, config: Config) -> Self {
        let stdout = Arc::new(HistoryQueue::new(config.stdout_history));
        let stderr = Arc::new(HistoryQueue::new(config.stderr_history));
        Self {
            config,
            user_command,
            stdout,
            stderr,
            rule_matches: Vec::new(),
            success: false,
            killed: false,
            kill_reason: None,
            report_reason: None,
            created: Vec::new(),
            max_memory: 0,
            start: None,
            finish: None,
            duration: Duration::ZERO,
            exit_code: 0,
            exit_code_valid: false,
            messages: Vec::new(),
            mem_warn_sent: false,
            time_warn_sent: false,
        }
    }

    /// Mark the run finished now and compute its duration.
    pub fn mark_finished(&mut self) {
        let finish = Utc::now();
        self.finish = Some(finish);
        if let Some(start) = self.start {
            self.duration = (finish - start).to_std().unwrap_or_default();
        }
    }
}

/// Run every rule over one output line.
///
/// Rules with a field first project the line through
/// [`extract_json_field`]; the regex then captures all non-overlapping
/// matches as half-open ranges. The reported line is always the raw line,
/// not the projection.
#[must_use]
pub fn match_rules(line: &str, rules: &[Rule]) -> Vec<RuleMatch> {
    let mut matches = Vec::new();
    for rule in rules {
        let projection = match &rule.field {
            Some(field) => extract_json_field(line, field),
            None => line.to_string(),
        };

        let index: Vec<(usize, usize)> = rule
            .regex
            .find_iter(&projection)
            .map(|m| (m.start(), m.end()))
            .collect();
        if !index.is_empty() {
            matches.push(RuleMatch {
                time: Utc::now(),
                line: line.to_string(),
                index,
            });
        }
    }
    matches
}

/// Project a field of a JSON-encoded line to text.
///
/// Dotted paths descend nested objects. Strings project verbatim, numbers
/// with six decimal places, booleans as `true`/`false`, and arrays as the
/// newline-joined projections of their scalar elements. Anything else,
/// including non-JSON lines and absent fields, projects to the empty
/// string.
#[must_use]
pub fn extract_json_field(raw: &str, field: &str) -> String {
    let Ok(root) = serde_json::from_str::<serde_json::Value>(raw) else {
        return String::new();
    };
    if !root.is_object() {
        return String::new();
    }

    let mut value = &root;
    for segment in field.split('.') {
        match value.get(segment) {
            Some(next) => value = next,
            None => return String::new(),
        }
    }
    project(value)
}

fn project(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n
            .as_f64()
            .map(|f| format!("{f:.6}"))
            .unwrap_or_default(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Array(items) => {
            let parts: Vec<String> = items
                .iter()
                .filter(|item| !(item.is_array() || item.is_object() || item.is_null()))
                .map(project)
                .collect();
            parts.join("\n")
        },
        _ => String::new(),
    }
}

/// Cleanup callback run after the supervised process terminates.
pub type Cleanup = Box<dyn FnOnce() -> std::io::Result<()> + Send>;

/// Wrap a command containing shell metacharacters in a shell invocation.
///
/// If any argv token contains `&&`, `|`, `<`, or `>`, the joined command is
/// written to an executable temp file in the working directory and argv is
/// re-targeted as `[shell, tmpfile]`. The returned cleanup callback removes
/// the temp file.
///
/// # Errors
///
/// Returns any I/O error from creating or writing the temp file.
pub fn wrap_complex_command(
    shell: &std::path::Path,
    args: &[String],
) -> std::io::Result<(Vec<String>, Option<Cleanup>)> {
    let meta = regex::Regex::new(r"(&&|\||<|>)").expect("static regex");
    if !args.iter().any(|arg| meta.is_match(arg)) {
        return Ok((args.to_vec(), None));
    }

    let mut file = tempfile::Builder::new()
        .prefix("procwatch")
        .suffix(".sh")
        .tempfile_in(std::env::current_dir()?)?;
    file.write_all(args.join(" ").as_bytes())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = std::fs::Permissions::from_mode(0o755);
        file.as_file().set_permissions(permissions)?;
    }

    let (_, path) = file.keep().map_err(|e| e.error)?;
    let script = path.to_string_lossy().into_owned();
    let cleanup: Cleanup = Box::new(move || std::fs::remove_file(&path));

    Ok((
        vec![shell.to_string_lossy().into_owned(), script],
        Some(cleanup),
    ))
}

#[cfg(test)]
mod tests {
    use regex::Regex;

    use super::*;

    fn rule(regex: &str) -> Rule {
        Rule {
            field: None,
            regex: Regex::new(regex).unwrap(),
        }
    }

    fn json_rule(field: &str, regex: &str) -> Rule {
        Rule {
            field: Some(field.to_string()),
            regex: Regex::new(regex).unwrap(),
        }
    }

    #[test]
    fn test_plain_rule_matches_raw_line() {
        let matches = match_rules("a fatal error occurred", &[rule("fatal")]);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].line, "a fatal error occurred");
        assert_eq!(matches[0].index, vec![(2, 7)]);
    }

    #[test]
    fn test_all_non_overlapping_matches_captured() {
        let matches = match_rules("err err err", &[rule("err")]);
        assert_eq!(matches[0].index, vec![(0, 3), (4, 7), (8, 11)]);
    }

    #[test]
    fn test_no_match_produces_nothing() {
        assert!(match_rules("all quiet", &[rule("fatal")]).is_empty());
    }

    #[test]
    fn test_json_rule_matches_field_projection() {
        let line = r#"{"code":404,"msg":"te failure"}"#;
        let matches = match_rules(line, &[json_rule("msg", "te.*")]);

        assert_eq!(matches.len(), 1);
        // The reported line is the raw JSON, not the projection.
        assert_eq!(matches[0].line, line);
        assert_eq!(matches[0].index, vec![(0, 10)]);
    }

    #[test]
    fn test_json_rule_skips_non_json_lines() {
        assert!(match_rules("plain text", &[json_rule("msg", ".*")]).is_empty());
    }

    #[test]
    fn test_extract_string_field() {
        assert_eq!(
            extract_json_field(r#"{"msg":"hello"}"#, "msg"),
            "hello"
        );
    }

    #[test]
    fn test_extract_nested_field() {
        let line = r#"{"outer":{"inner":{"msg":"deep"}}}"#;
        assert_eq!(extract_json_field(line, "outer.inner.msg"), "deep");
    }

    #[test]
    fn test_extract_number_field() {
        assert_eq!(
            extract_json_field(r#"{"code":404}"#, "code"),
            "404.000000"
        );
        assert_eq!(
            extract_json_field(r#"{"ratio":0.5}"#, "ratio"),
            "0.500000"
        );
    }

    #[test]
    fn test_extract_bool_field() {
        assert_eq!(extract_json_field(r#"{"ok":true}"#, "ok"), "true");
        assert_eq!(extract_json_field(r#"{"ok":false}"#, "ok"), "false");
    }

    #[test]
    fn test_extract_array_joins_scalars() {
        let line = r#"{"tags":["a","b",true,{"skip":1},"c"]}"#;
        assert_eq!(extract_json_field(line, "tags"), "a\nb\ntrue\nc");
    }

    #[test]
    fn test_extract_absent_or_non_scalar_is_empty() {
        assert_eq!(extract_json_field(r#"{"a":1}"#, "b"), "");
        assert_eq!(extract_json_field(r#"{"a":{"b":1}}"#, "a"), "");
        assert_eq!(extract_json_field(r"[1,2,3]", "a"), "");
        assert_eq!(extract_json_field("not json", "a"), "");
        assert_eq!(extract_json_field(r#"{"a":null}"#, "a"), "");
    }

    #[test]
    fn test_simple_command_is_untouched() {
        let args = vec!["echo".to_string(), "hello".to_string()];
        let (wrapped, cleanup) =
            wrap_complex_command(std::path::Path::new("/bin/sh"), &args).unwrap();
        assert_eq!(wrapped, args);
        assert!(cleanup.is_none());
    }

    #[test]
    fn test_complex_command_is_wrapped() {
        let args = vec![
            "cat".to_string(),
            "in.txt".to_string(),
            "|".to_string(),
            "wc".to_string(),
        ];
        let (wrapped, cleanup) =
            wrap_complex_command(std::path::Path::new("/bin/sh"), &args).unwrap();

        assert_eq!(wrapped.len(), 2);
        assert_eq!(wrapped[0], "/bin/sh");
        let script = std::fs::read_to_string(&wrapped[1]).unwrap();
        assert_eq!(script, "cat in.txt | wc");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&wrapped[1]).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111, "script must be executable");
        }

        cleanup.unwrap()().unwrap();
        assert!(!std::path::Path::new(&wrapped[1]).exists());
    }

    #[test]
    fn test_redirect_triggers_wrapping() {
        for token in ["a>b", "a<b", "x && y"] {
            let args = vec![token.to_string()];
            let (wrapped, cleanup) =
                wrap_complex_command(std::path::Path::new("/bin/sh"), &args).unwrap();
            assert_eq!(wrapped[0], "/bin/sh");
            cleanup.unwrap()().unwrap();
        }
    }

    #[test]
    fn test_mark_finished_computes_duration() {
        let mut builder = crate::config::ConfigBuilder::new();
        builder.id("m").shell("/bin/sh");
        let mut cmd = Command::new(vec!["true".to_string()], builder.build().unwrap());

        cmd.start = Some(Utc::now() - chrono::Duration::seconds(2));
        cmd.mark_finished();
        assert!(cmd.duration >= Duration::from_secs(1));
        assert!(cmd.finish.is_some());
    }
}
