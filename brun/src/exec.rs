//! `brun exec`: run one command, directly or through a pool.

use anyhow::{Context, Result, bail};
use brun_common::{CommandLine, split_words};
use brun_pool::{
    Callbacks, Disposition, JobHandle, JobRequest, ParallelMode, PoolConfig,
    PoolSettings, SshRunOptions,
};
use clap::Args;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{error, info};

#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Run through a job pool instead of directly
    #[arg(long)]
    parallel: Option<ParallelMode>,

    /// Upper bound on concurrently used nodes/processes
    #[arg(long)]
    parallelmax: Option<usize>,

    /// SSH hosts for --parallel=ssh
    #[arg(long, num_args = 1..)]
    ssh_nodes: Vec<String>,

    /// Extra scheduler options for --parallel=prun, as one string
    #[arg(long, allow_hyphen_values = true)]
    prun_opts: Option<String>,

    /// Job id used in logs
    #[arg(long)]
    jobid: String,

    /// Output file (replicas and cluster machines get suffixes)
    #[arg(long)]
    outfile: PathBuf,

    /// Resource cost: processes, machines or SSH nodes
    #[arg(long, default_value_t = 1)]
    nodes: usize,

    /// Run on these SSH nodes, in replica order
    #[arg(long = "on-node")]
    on_nodes: Vec<String>,

    /// Tunnel a random local port to this port on each SSH node
    #[arg(long)]
    tunnel_dest: Option<u16>,

    /// Command to run
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

impl ExecArgs {
    fn pool_config(&self) -> Result<PoolConfig> {
        let prun_opts = match &self.prun_opts {
            Some(opts) => split_words(opts).context("invalid --prun-opts")?,
            None => Vec::new(),
        };
        Ok(PoolConfig {
            parallel: self.parallel,
            parallelmax: self.parallelmax,
            ssh_nodes: self.ssh_nodes.clone(),
            prun_opts,
        })
    }

    fn ssh_options(&self) -> Result<SshRunOptions> {
        let wants_ssh = !self.on_nodes.is_empty() || self.tunnel_dest.is_some();
        if wants_ssh && self.parallel != Some(ParallelMode::Ssh) {
            bail!("--on-node and --tunnel-dest require --parallel=ssh");
        }
        Ok(SshRunOptions {
            nodes: (!self.on_nodes.is_empty()).then(|| self.on_nodes.clone()),
            tunnel_dest: self.tunnel_dest,
        })
    }
}

/// Run the command and return the number of failed jobs.
pub fn run(args: ExecArgs) -> Result<usize> {
    let command = CommandLine::from_args(args.command.iter().cloned())?;
    let config = args.pool_config()?;
    let ssh_options = args.ssh_options()?;
    let settings = PoolSettings::from_env()?;

    let Some(pool) = config.build(settings)? else {
        if args.nodes != 1 {
            bail!("--nodes requires --parallel");
        }
        return run_direct(&args.jobid, &command);
    };

    let failed = Arc::new(AtomicUsize::new(0));
    let callbacks = Callbacks::none().on_error({
        let failed = Arc::clone(&failed);
        move |_| {
            failed.fetch_add(1, Ordering::SeqCst);
            Disposition::Log
        }
    });

    let request = JobRequest::new(command, args.jobid, args.outfile).cost(args.nodes);
    let handles = match pool.as_ssh() {
        Some(ssh) => ssh.run_with(request, callbacks, ssh_options)?,
        None => pool.run(request, callbacks)?,
    };
    print_handles(&handles)?;

    pool.wait_all();
    if let Some(ssh) = pool.as_ssh() {
        ssh.backend().cleanup_tempdirs()?;
    }
    Ok(failed.load(Ordering::SeqCst))
}

fn print_handles(handles: &[JobHandle]) -> Result<()> {
    for handle in handles {
        println!("{}", serde_json::to_string(handle)?);
    }
    Ok(())
}

fn run_direct(jobid: &str, command: &CommandLine) -> Result<usize> {
    info!("running {jobid}");
    let status = Command::new(command.program())
        .args(command.args())
        .status()
        .with_context(|| format!("failed to start {command}"))?;
    if status.success() {
        info!("job {jobid} finished");
        Ok(0)
    } else {
        error!("job {jobid} returned status {status}");
        error!("command: {command}");
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        exec: ExecArgs,
    }

    fn parse(args: &[&str]) -> ExecArgs {
        Wrapper::try_parse_from(std::iter::once("brun").chain(args.iter().copied()))
            .unwrap()
            .exec
    }

    #[test]
    fn test_prun_opts_are_split() {
        let args = parse(&[
            "--parallel", "prun", "--prun-opts", "-t 30:00 -q 'long queue'", "--jobid", "j",
            "--outfile", "/tmp/j.out", "--", "./bench", "-n", "3",
        ]);
        let config = args.pool_config().unwrap();
        assert_eq!(config.parallel, Some(ParallelMode::Prun));
        assert_eq!(config.prun_opts, ["-t", "30:00", "-q", "long queue"]);
        assert_eq!(args.command, ["./bench", "-n", "3"]);
    }

    #[test]
    fn test_ssh_options_need_ssh_pool() {
        let args = parse(&[
            "--parallel", "proc", "--tunnel-dest", "8080", "--jobid", "j", "--outfile", "o",
            "--", "true",
        ]);
        assert!(args.ssh_options().is_err());

        let args = parse(&[
            "--parallel", "ssh", "--ssh-nodes", "a", "b", "--on-node", "b", "--tunnel-dest",
            "8080", "--jobid", "j", "--outfile", "o", "--", "true",
        ]);
        let options = args.ssh_options().unwrap();
        assert_eq!(options.nodes, Some(vec!["b".to_string()]));
        assert_eq!(options.tunnel_dest, Some(8080));
        assert_eq!(args.ssh_nodes, ["a", "b"]);
    }
}
