//! brun - Benchmark Runner CLI
//!
//! Runs commands through a job pool (local processes, a cluster scheduler or
//! SSH nodes) and drives remote runner servers.

#![forbid(unsafe_code)]

mod exec;
mod remote;

use anyhow::Result;
use clap::{Parser, Subcommand};
use brun_common::{LogConfig, init_logging};
use tracing::{debug, warn};

#[derive(Parser)]
#[command(name = "brun")]
#[command(author, version, about = "Benchmark runner - parallel job pools and remote runners")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command, optionally through a job pool
    Exec(exec::ExecArgs),

    /// Talk to a remote runner server
    Remote(remote::RemoteArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = init_logging(&log_config)?;
    for e in &log_config.env_errors {
        warn!("{e}");
    }
    debug!(
        level = %log_config.level,
        source = %log_config.level_source,
        "Logging initialized"
    );

    match cli.command {
        Commands::Exec(args) => {
            let failed = exec::run(args)?;
            if failed > 0 {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Remote(args) => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(remote::run(args))
        }
    }
}
