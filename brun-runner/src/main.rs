//! brun - Remote Runner Server
//!
//! Started on a remote host (usually over ssh) to give the orchestrator
//! control over one benchmark process there.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use brun_common::{LogConfig, init_logging};
use brun_runner::{DEFAULT_PORT, bind, serve};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Verbosity {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
}

impl Verbosity {
    fn level(self) -> &'static str {
        match self {
            Verbosity::Critical | Verbosity::Error => "error",
            Verbosity::Warning => "warn",
            Verbosity::Info => "info",
            Verbosity::Debug => "debug",
        }
    }
}

#[derive(Parser)]
#[command(name = "brun-runner")]
#[command(author, version, about = "Remote runner server for benchmarking")]
struct Cli {
    /// Host to bind the socket on
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the socket on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Terminal logging verbosity
    #[arg(short, long, value_enum, default_value = "info")]
    verbosity: Verbosity,

    /// Where to write the log file
    #[arg(short = 'o', long = "debug-log", default_value = "runner.log")]
    debug_log: PathBuf,
}

async fn run(cli: &Cli) -> Result<()> {
    let listener = bind(&cli.host, cli.port)
        .await
        .with_context(|| format!("failed to bind {}:{}", cli.host, cli.port))?;
    serve(listener).await.context("runner session failed")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = LogConfig::from_env(cli.verbosity.level()).with_file(&cli.debug_log);
    let logging_guards = init_logging(&log_config)?;
    for e in &log_config.env_errors {
        warn!("{e}");
    }

    info!("Started runner, pid={}", std::process::id());

    let code = match run(&cli).await {
        Ok(()) => 0,
        Err(e) => {
            error!("{e:#}");
            255
        }
    };

    // Exit right away so an ssh session waiting on us does not linger. Flush
    // the log file first.
    drop(logging_guards);
    std::process::exit(code);
}
