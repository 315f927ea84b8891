//! Jobs as local subprocesses, one process per resource unit.

use super::{Backend, build_command};
use crate::error::Result;
use crate::job::{Job, JobRequest};
use crate::pool::{LaunchSpec, Launcher};
use std::time::Instant;
use tracing::info;

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalBackend;

impl Backend for LocalBackend {
    type State = ();
    type Options = ();

    fn name(&self) -> &'static str {
        "proc"
    }

    fn make_jobs(
        &self,
        request: &JobRequest,
        _options: (),
        launcher: &mut Launcher<'_, ()>,
    ) -> Result<()> {
        for i in 0..request.cost {
            let (jobid, outfile) = request.replica(i, request.cost);
            let reservation = launcher.reserve(1);
            info!("running {jobid}");

            let mut job = Job::new(jobid, request.command.clone(), 1, vec![outfile.clone()]);
            job.start_time = Some(Instant::now());

            launcher.launch(LaunchSpec {
                command: build_command(request.command.argv(), request),
                job,
                state: (),
                capture: Some(outfile),
                reservation,
            })?;
        }
        Ok(())
    }
}
