//! Execution backends.
//!
//! A backend turns a [`JobRequest`] into one or more running jobs via the
//! [`Launcher`] it is handed, and may inspect job output as it arrives. All
//! bookkeeping after spawn lives in [`Pool`](crate::Pool).

pub mod cluster;
pub mod local;
pub mod ssh;

use crate::error::Result;
use crate::job::{Job, JobRequest};
use crate::pool::Launcher;
use brun_common::flatten_env;
use std::process::Command;

pub use cluster::{ClusterBackend, ClusterJobState, Schedule, format_nodes, parse_schedule};
pub use local::LocalBackend;
pub use ssh::{KnownHostsPolicy, SshBackend, SshJobState, SshOptions, SshRunOptions};

pub trait Backend: Send + Sync + 'static {
    /// Per-job state kept alongside the job while it runs.
    type State: Send + 'static;
    /// Extra per-call options for [`Pool::run_with`](crate::Pool::run_with).
    type Options: Default;

    fn name(&self) -> &'static str;

    /// Units one job of `request` takes from admission control.
    fn admission_units(&self, _request: &JobRequest) -> usize {
        1
    }

    /// Reserve resources and launch the jobs for `request`.
    fn make_jobs(
        &self,
        request: &JobRequest,
        options: Self::Options,
        launcher: &mut Launcher<'_, Self::State>,
    ) -> Result<()>;

    /// Called after new output was appended to `job.output`.
    fn process_output(&self, _job: &mut Job, _state: &mut Self::State) {}

    /// Called once when the job leaves the table, before its callbacks.
    fn finish(&self, _job: &mut Job, _state: &mut Self::State) {}
}

/// A [`Command`] for `argv` with the request's environment and directory.
pub(crate) fn build_command(argv: &[String], request: &JobRequest) -> Command {
    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]).envs(flatten_env(&request.env));
    if let Some(dir) = &request.cwd {
        command.current_dir(dir);
    }
    command
}
