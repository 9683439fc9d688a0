//! End-to-end supervisor scenarios against an in-process mock collector.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use procwatch_agent::config::{Config, ConfigBuilder};
use procwatch_agent::supervisor::Supervisor;
use procwatch_core::proto::{Ack, FrameCodec, KillReason, Report, ReportReason};
use prost::Message;
use tokio::net::TcpListener;
use tokio_util::codec::Framed;

/// A collector double: accepts framed reports, acknowledges each, and
/// records them in arrival order.
struct MockCollector {
    port: u16,
    reports: Arc<Mutex<Vec<Report>>>,
}

impl MockCollector {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let reports: Arc<Mutex<Vec<Report>>> = Arc::default();

        let sink = Arc::clone(&reports);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let sink = Arc::clone(&sink);
                tokio::spawn(async move {
                    let mut framed = Framed::new(stream, FrameCodec::new());
                    while let Some(Ok(frame)) = framed.next().await {
                        let Ok(report) = Report::decode(&frame[..]) else {
                            break;
                        };
                        sink.lock().unwrap().push(report);
                        let ack = Ack { success: true }.encode_to_vec();
                        if framed.send(Bytes::from(ack)).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        Self { port, reports }
    }

    fn reports(&self) -> Vec<Report> {
        self.reports.lock().unwrap().clone()
    }

    fn reasons(&self) -> Vec<i32> {
        self.reports().iter().map(|r| r.report_reason).collect()
    }
}

fn base_config(collector: &MockCollector) -> ConfigBuilder {
    let mut builder = ConfigBuilder::new();
    builder
        .id("e2e")
        .shell("/bin/sh")
        .host(&format!("127.0.0.1:{}", collector.port))
        .insecure()
        .no_error_reports();
    builder
}

fn supervise(command: &[&str], config: Config) -> Supervisor {
    Supervisor::new(command.iter().map(ToString::to_string).collect(), config)
}

#[tokio::test]
async fn test_successful_run_reports_success() {
    let collector = MockCollector::start().await;
    let config = base_config(&collector).build().unwrap();

    let supervisor = supervise(&["sleep", "1"], config);
    let code = supervisor.exec().await.unwrap();

    assert_eq!(code, 0);
    let reports = collector.reports();
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.report_reason, ReportReason::Success as i32);
    assert!(report.success);
    assert!(report.exit_code_valid);
    assert_eq!(report.exit_code, 0);
    assert_eq!(report.user_command, "sleep 1");

    // Duration is about one second.
    let duration = humantime::parse_duration(&report.duration).unwrap();
    assert!(duration >= Duration::from_millis(500));
    assert!(duration <= Duration::from_millis(2500));

    // No rules, no matches.
    let matches: Vec<serde_json::Value> = serde_json::from_slice(&report.matches).unwrap();
    assert!(matches.is_empty());
}

#[tokio::test]
async fn test_failing_run_reports_failure() {
    let collector = MockCollector::start().await;
    let config = base_config(&collector).build().unwrap();

    let supervisor = supervise(&["false"], config);
    let code = supervisor.exec().await.unwrap();

    assert_ne!(code, 0);
    let reports = collector.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].report_reason, ReportReason::Failure as i32);
    assert!(!reports[0].success);
    assert!(reports[0].exit_code_valid);
    assert_ne!(reports[0].exit_code, 0);
}

#[tokio::test]
async fn test_kill_timeout() {
    let collector = MockCollector::start().await;
    let mut builder = base_config(&collector);
    builder.timeout_kill("200ms");
    let config = builder.build().unwrap();

    let started = std::time::Instant::now();
    let supervisor = supervise(&["sleep", "3"], config);
    let code = supervisor.exec().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));

    assert_ne!(code, 0);
    let reports = collector.reports();
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.report_reason, ReportReason::Killed as i32);
    assert!(report.killed);
    assert_eq!(report.kill_reason, KillReason::Timeout as i32);

    let duration = humantime::parse_duration(&report.duration).unwrap();
    assert!(duration >= Duration::from_millis(150));
    assert!(duration <= Duration::from_secs(2));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_memory_kill() {
    let collector = MockCollector::start().await;
    let mut builder = base_config(&collector);
    // Any resident process exceeds one kilobyte.
    builder.memory_kill("1K");
    let config = builder.build().unwrap();

    let supervisor = supervise(&["sleep", "3"], config);
    let code = supervisor.exec().await.unwrap();

    assert_ne!(code, 0);
    let reports = collector.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].report_reason, ReportReason::Killed as i32);
    assert_eq!(reports[0].kill_reason, KillReason::Memory as i32);
    assert!(reports[0].max_memory >= 1);
}

#[tokio::test]
async fn test_created_artifact_is_recorded() {
    let collector = MockCollector::start().await;
    let dir = tempfile::tempdir().unwrap();
    let artifact = dir.path().join("testfile.test");

    let mut builder = base_config(&collector);
    builder.creates(artifact.to_str().unwrap());
    let config = builder.build().unwrap();

    let supervisor = supervise(&["touch", artifact.to_str().unwrap()], config);
    let code = supervisor.exec().await.unwrap();

    assert_eq!(code, 0);
    let reports = collector.reports();
    assert_eq!(reports[0].report_reason, ReportReason::Success as i32);
    let created: Vec<serde_json::Value> = serde_json::from_slice(&reports[0].created).unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(
        created[0]["path"],
        serde_json::Value::String(artifact.to_str().unwrap().to_string())
    );
}

#[tokio::test]
async fn test_missing_artifact_reports_file_not_created() {
    let collector = MockCollector::start().await;
    let dir = tempfile::tempdir().unwrap();

    let mut builder = base_config(&collector);
    builder.creates(dir.path().join("expected.out").to_str().unwrap());
    let config = builder.build().unwrap();

    let other = dir.path().join("other.out");
    let supervisor = supervise(&["touch", other.to_str().unwrap()], config);
    let code = supervisor.exec().await.unwrap();

    assert_ne!(code, 0);
    let reports = collector.reports();
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.report_reason, ReportReason::FileNotCreated as i32);
    assert!(!report.success);
    assert!(report
        .messages
        .iter()
        .any(|m| m.starts_with("file not created:")));
}

#[tokio::test]
async fn test_json_rule_produces_alert_and_clears_matches() {
    let collector = MockCollector::start().await;
    let line = r#"{"code":404,"msg":"te failure"}"#;

    let mut builder = base_config(&collector);
    builder.json_rule_spec("msg:te.*");
    let config = builder.build().unwrap();

    let supervisor = supervise(&["echo", line], config);
    let command = supervisor.command();
    let code = supervisor.exec().await.unwrap();

    assert_eq!(code, 0);
    let reasons = collector.reasons();
    assert!(reasons.contains(&(ReportReason::Success as i32)));
    assert!(reasons.contains(&(ReportReason::Alert as i32)));

    let reports = collector.reports();
    let alert = reports
        .iter()
        .find(|r| r.report_reason == ReportReason::Alert as i32)
        .unwrap();
    let matches: Vec<serde_json::Value> = serde_json::from_slice(&alert.matches).unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0]["line"], serde_json::Value::String(line.to_string()));

    // Confirmed delivery cleared the accumulated matches.
    assert!(command.lock().unwrap().rule_matches.is_empty());
}

#[tokio::test]
async fn test_rule_rate_gate_blocks_below_quantity() {
    let collector = MockCollector::start().await;

    let mut builder = base_config(&collector);
    builder.rule("ERROR").rule_quantity("5").rule_period("1h");
    let config = builder.build().unwrap();

    let supervisor = supervise(&["echo", "one ERROR line"], config);
    supervisor.exec().await.unwrap();

    // One match is below the rate threshold: only the terminal report goes
    // out.
    let reasons = collector.reasons();
    assert_eq!(reasons, vec![ReportReason::Success as i32]);
}

#[tokio::test]
async fn test_stdout_history_is_bounded_and_ordered() {
    let collector = MockCollector::start().await;

    let mut builder = base_config(&collector);
    builder.stdout_history("3");
    let config = builder.build().unwrap();

    let supervisor = supervise(&["sh", "-c", "for i in 1 2 3 4 5; do echo line$i; done"], config);
    supervisor.exec().await.unwrap();

    let reports = collector.reports();
    assert_eq!(reports[0].stdout, vec!["line3", "line4", "line5"]);
}

#[tokio::test]
async fn test_stderr_is_scanned_separately() {
    let collector = MockCollector::start().await;
    let config = base_config(&collector).build().unwrap();

    // A ">&2" in argv would trigger the shell wrapper; use a script so the
    // redirect stays out of the supervised command line.
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("emit.sh");
    std::fs::write(&script, "#!/bin/sh\necho out\necho err >&2\n").unwrap();

    let supervisor = supervise(&["sh", script.to_str().unwrap()], config);
    supervisor.exec().await.unwrap();

    let reports = collector.reports();
    assert_eq!(reports[0].stdout, vec!["out"]);
    assert_eq!(reports[0].stderr, vec!["err"]);
}

#[tokio::test]
async fn test_complex_command_runs_through_shell() {
    let collector = MockCollector::start().await;
    let config = base_config(&collector).build().unwrap();

    let supervisor = supervise(&["echo", "alpha", "&&", "echo", "beta"], config);
    let code = supervisor.exec().await.unwrap();

    assert_eq!(code, 0);
    let reports = collector.reports();
    assert_eq!(reports[0].stdout, vec!["alpha", "beta"]);
}

#[tokio::test]
async fn test_daemon_run_sends_start_report() {
    let collector = MockCollector::start().await;
    let mut builder = base_config(&collector);
    builder.daemon();
    let config = builder.build().unwrap();

    let supervisor = supervise(&["true"], config);
    supervisor.exec().await.unwrap();

    let reasons = collector.reasons();
    assert!(reasons.contains(&(ReportReason::Start as i32)));
    assert!(reasons.contains(&(ReportReason::Success as i32)));
}

#[tokio::test]
async fn test_no_notify_on_success_suppresses_terminal_report() {
    let collector = MockCollector::start().await;
    let mut builder = base_config(&collector);
    builder.no_notify_on_success();
    let config = builder.build().unwrap();

    let supervisor = supervise(&["true"], config);
    let code = supervisor.exec().await.unwrap();

    assert_eq!(code, 0);
    assert!(collector.reports().is_empty());
}

#[tokio::test]
async fn test_spawn_failure_propagates() {
    let collector = MockCollector::start().await;
    let config = base_config(&collector).build().unwrap();

    let supervisor = supervise(&["definitely-not-a-real-binary-1234"], config);
    assert!(supervisor.exec().await.is_err());
}
