//! Jobs, job requests and completion callbacks.

use brun_common::{CommandLine, EnvOverrides, EnvValue};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What a completion callback wants the pool to do about its own logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Disposition {
    /// Log the usual "job finished"/"job failed" lines.
    #[default]
    Log,
    /// The callback reported the outcome itself; stay quiet.
    Suppress,
}

pub type Callback = Arc<dyn Fn(&Job) -> Disposition + Send + Sync>;

/// Success and error continuations for a job, both optional.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_success: Option<Callback>,
    pub on_error: Option<Callback>,
}

impl Callbacks {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&Job) -> Disposition + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&Job) -> Disposition + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// A request to run one command under a pool.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub command: CommandLine,
    /// Human-readable id used in logs; need not be unique.
    pub jobid: String,
    /// Where output goes; replicas get a `-<i>` suffix.
    pub outfile: PathBuf,
    /// Resource units ("nodes") the job consumes.
    pub cost: usize,
    pub env: EnvOverrides,
    pub cwd: Option<PathBuf>,
}

impl JobRequest {
    pub fn new(command: CommandLine, jobid: impl Into<String>, outfile: impl Into<PathBuf>) -> Self {
        Self {
            command,
            jobid: jobid.into(),
            outfile: outfile.into(),
            cost: 1,
            env: EnvOverrides::new(),
            cwd: None,
        }
    }

    /// Like [`new`](Self::new), splitting a shell-style command string.
    pub fn shell(
        command: &str,
        jobid: impl Into<String>,
        outfile: impl Into<PathBuf>,
    ) -> Result<Self, brun_common::CommandLineError> {
        Ok(Self::new(CommandLine::parse(command)?, jobid, outfile))
    }

    pub fn cost(mut self, cost: usize) -> Self {
        self.cost = cost;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<EnvValue>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Job id and output path of replica `index` out of `count`.
    pub(crate) fn replica(&self, index: usize, count: usize) -> (String, PathBuf) {
        if count > 1 {
            (
                format!("{}-{index}", self.jobid),
                with_suffix(&self.outfile, &format!("-{index}")),
            )
        } else {
            (self.jobid.clone(), self.outfile.clone())
        }
    }
}

/// Append `suffix` to the file name of `path`.
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// What the caller gets back for each job a request produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub jobid: String,
    pub outfiles: Vec<PathBuf>,
    /// SSH node the job runs on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// Local end of the SSH tunnel to the job's node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_port: Option<u16>,
}

/// A job as seen by callbacks.
#[derive(Debug)]
pub struct Job {
    pub jobid: String,
    pub command: CommandLine,
    pub cost: usize,
    pub outfiles: Vec<PathBuf>,
    /// Everything the job wrote to stdout and stderr so far.
    pub output: String,
    /// Set once the job is known to be running.
    pub start_time: Option<Instant>,
    /// Exit status, once reaped.
    pub status: Option<ExitStatus>,
    pub node: Option<String>,
    pub tunnel_port: Option<u16>,
}

impl Job {
    pub fn new(jobid: String, command: CommandLine, cost: usize, outfiles: Vec<PathBuf>) -> Self {
        Self {
            jobid,
            command,
            cost,
            outfiles,
            output: String::new(),
            start_time: None,
            status: None,
            node: None,
            tunnel_port: None,
        }
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.start_time.map(|t| t.elapsed())
    }

    pub fn succeeded(&self) -> bool {
        self.status.is_some_and(|s| s.success())
    }

    /// Exit code, or `-signal` for jobs killed by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        use std::os::unix::process::ExitStatusExt;
        let status = self.status?;
        status.code().or_else(|| status.signal().map(|s| -s))
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            jobid: self.jobid.clone(),
            outfiles: self.outfiles.clone(),
            node: self.node.clone(),
            tunnel_port: self.tunnel_port,
        }
    }

    /// " after N seconds", or nothing if the job never started.
    pub(crate) fn elapsed_suffix(&self) -> String {
        match self.elapsed() {
            Some(elapsed) => format!(" after {} seconds", elapsed.as_secs_f64().round() as u64),
            None => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_suffixes() {
        let request = JobRequest::shell("make", "build", "/tmp/out/build.log")
            .unwrap()
            .cost(3);
        assert_eq!(
            request.replica(2, 3),
            ("build-2".to_string(), PathBuf::from("/tmp/out/build.log-2"))
        );
        assert_eq!(
            request.replica(0, 1),
            ("build".to_string(), PathBuf::from("/tmp/out/build.log"))
        );
    }

    #[test]
    fn test_elapsed_suffix() {
        let mut job = Job::new(
            "j".into(),
            CommandLine::parse("true").unwrap(),
            1,
            vec![],
        );
        assert_eq!(job.elapsed_suffix(), "");
        job.start_time = Some(Instant::now());
        assert_eq!(job.elapsed_suffix(), " after 0 seconds");
    }

    #[test]
    fn test_exit_code_of_signalled_job() {
        use std::os::unix::process::ExitStatusExt;
        let mut job = Job::new("j".into(), CommandLine::parse("true").unwrap(), 1, vec![]);
        assert_eq!(job.exit_code(), None);
        job.status = Some(ExitStatus::from_raw(9));
        assert_eq!(job.exit_code(), Some(-9));
        assert!(!job.succeeded());
        job.status = Some(ExitStatus::from_raw(0));
        assert_eq!(job.exit_code(), Some(0));
        assert!(job.succeeded());
    }

    #[test]
    fn test_callbacks_debug() {
        let callbacks = Callbacks::none().on_error(|_| Disposition::Suppress);
        assert_eq!(
            format!("{callbacks:?}"),
            "Callbacks { on_success: false, on_error: true }"
        );
    }
}
