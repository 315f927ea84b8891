//! `brun remote`: one-shot calls against a runner server.

use anyhow::{Context, Result};
use brun_common::CommandSpec;
use brun_runner::{DEFAULT_PORT, RunParams, RunnerClient, WaitParams, WaitResult};
use brun_telemetry::Series;
use clap::{Args, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Args, Debug)]
pub struct RemoteArgs {
    /// Runner host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Runner port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Keep retrying the connection for this many seconds
    #[arg(long)]
    timeout: Option<f64>,

    #[command(subcommand)]
    action: RemoteAction,
}

#[derive(Subcommand, Debug)]
enum RemoteAction {
    /// Check whether a regular file exists on the runner host
    HasFile { path: PathBuf },

    /// Run a command on the runner and wait for it
    Run {
        /// Do not fail on a non-zero exit status
        #[arg(long)]
        allow_error: bool,

        /// Sample cpu and rss every this many seconds while it runs
        #[arg(long)]
        monitor: Option<f64>,

        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Print the runner's process tree (empty when idle)
    Pids,

    /// Stop the runner
    Exit,
}

#[derive(Serialize)]
struct MonitoredRun {
    result: WaitResult,
    series: Series,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

/// A runner serves a single connection, so each invocation is one whole
/// session that ends by stopping the runner.
pub async fn run(args: RemoteArgs) -> Result<()> {
    let timeout = args
        .timeout
        .map(Duration::try_from_secs_f64)
        .transpose()
        .context("invalid --timeout")?;
    let mut client = RunnerClient::connect(&args.host, args.port, timeout)
        .await
        .with_context(|| format!("failed to connect to {}:{}", args.host, args.port))?;

    let outcome = perform(&mut client, args.action).await;
    client.close().await;
    outcome
}

async fn perform(client: &mut RunnerClient, action: RemoteAction) -> Result<()> {
    match action {
        RemoteAction::HasFile { path } => print_json(&client.has_file(&path).await?),
        RemoteAction::Run {
            allow_error,
            monitor: None,
            command,
        } => {
            let params = RunParams {
                allow_error,
                ..RunParams::new(CommandSpec::Argv(command))
            };
            print_json(&client.run(&params).await?)
        }
        RemoteAction::Run {
            allow_error,
            monitor: Some(interval),
            command,
        } => {
            let params = RunParams {
                wait: false,
                allow_error,
                ..RunParams::new(CommandSpec::Argv(command))
            };
            client.run(&params).await?;
            client.start_monitoring(interval, &["cpu", "rss"]).await?;
            let result = client
                .wait(&WaitParams {
                    allow_error,
                    ..WaitParams::default()
                })
                .await?;
            let series = client.stop_monitoring().await?;
            info!(samples = series.values().map(Vec::len).max().unwrap_or(0), "monitoring stopped");
            print_json(&MonitoredRun { result, series })
        }
        RemoteAction::Pids => print_json(&client.get_pids().await?),
        RemoteAction::Exit => Ok(()),
    }
}
