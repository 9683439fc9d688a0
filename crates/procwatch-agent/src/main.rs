//! procwatch - process-supervisor agent.
//!
//! Wraps an arbitrary user command, supervises its lifecycle, scans its
//! output, and ships telemetry reports to a collector.

use std::process::ExitCode;

use clap::Parser;
use procwatch_agent::cli::{build_config, Cli};
use procwatch_agent::supervisor::Supervisor;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // The agent mirrors the child's stdout; its own diagnostics go to
    // stderr so the mirrored stream stays clean.
    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(errors) => {
            eprintln!("Error in config:");
            for error in errors {
                eprintln!("  {error}");
            }
            return ExitCode::FAILURE;
        },
    };

    let supervisor = Supervisor::new(cli.command.clone(), config);
    let result = if cli.command.is_empty() {
        supervisor.exec_piped().await
    } else {
        supervisor.exec().await
    };

    match result {
        Ok(code) => ExitCode::from(u8::try_from(code.clamp(0, 255)).unwrap_or(1)),
        Err(e) => {
            eprintln!("Process error: {e}");
            ExitCode::FAILURE
        },
    }
}
