//! The one process a runner server controls.
//!
//! The child runs in its own process group so `kill` reaches everything it
//! started. Stdout is read line by line in the background so callers can
//! consume it incrementally; stderr is accumulated whole.

use crate::error::{Result, RunnerError};
use brun_common::{CommandLine, EnvOverrides, merge_env};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a terminated child gets before it is killed outright.
pub const KILL_GRACE: Duration = Duration::from_secs(1);

/// Exit code, or `-signal` for a child killed by a signal.
pub fn exit_code(status: ExitStatus) -> Option<i32> {
    status.code().or_else(|| status.signal().map(|s| -s))
}

pub struct ChildProcess {
    child: Child,
    pid: u32,
    stdout: mpsc::UnboundedReceiver<String>,
    stderr: Option<JoinHandle<String>>,
    code: Option<i32>,
}

impl ChildProcess {
    /// Start `command` with the runner's environment updated by `env`.
    pub fn spawn(command: CommandLine, env: &EnvOverrides) -> Result<Self> {
        let mut child = Command::new(command.program())
            .args(command.args())
            .env_clear()
            .envs(merge_env(std::env::vars(), env))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;

        let pid = child
            .id()
            .ok_or_else(|| RunnerError::failed("child exited before its pid was known"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::failed("child stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunnerError::failed("child stderr was not captured"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_lines(stdout, tx));
        let stderr = tokio::spawn(read_all(stderr));

        info!(pid, command = %command, "Started process");
        Ok(Self {
            child,
            pid,
            stdout: rx,
            stderr: Some(stderr),
            code: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The exit code if the process has exited, without blocking.
    pub fn poll(&mut self) -> Result<Option<i32>> {
        if self.code.is_none()
            && let Some(status) = self.child.try_wait()?
        {
            self.record(status);
        }
        Ok(self.code)
    }

    pub fn is_alive(&mut self) -> Result<bool> {
        Ok(self.poll()?.is_none())
    }

    /// Wait for the process to exit, giving up after `timeout`.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<i32>> {
        if self.code.is_some() {
            return Ok(self.code);
        }
        let status = match timeout {
            Some(limit) => match tokio::time::timeout(limit, self.child.wait()).await {
                Ok(status) => status?,
                Err(_) => return Ok(None),
            },
            None => self.child.wait().await?,
        };
        self.record(status);
        Ok(self.code)
    }

    fn record(&mut self, status: ExitStatus) {
        self.code = exit_code(status);
        debug!(pid = self.pid, code = ?self.code, "Process exited");
    }

    /// The next stdout line without its line ending, or `""` at end of stream.
    pub async fn read_output_line(&mut self) -> String {
        match self.stdout.recv().await {
            Some(line) => line.trim_end().to_string(),
            None => String::new(),
        }
    }

    /// Everything left on stdout and stderr, waiting for both to close.
    ///
    /// Returns `None` if `timeout` passes first. Output already handed out is
    /// not repeated, so a second call yields empty strings.
    pub async fn communicate(&mut self, timeout: Option<Duration>) -> Result<Option<(String, String)>> {
        let collect = async {
            let mut stdout = String::new();
            while let Some(line) = self.stdout.recv().await {
                stdout.push_str(&line);
            }
            let stderr = match self.stderr.as_mut() {
                Some(handle) => handle.await.unwrap_or_else(|e| {
                    warn!(error = %e, "stderr reader failed");
                    String::new()
                }),
                None => String::new(),
            };
            self.stderr = None;
            (stdout, stderr)
        };
        match timeout {
            Some(limit) => Ok(tokio::time::timeout(limit, collect).await.ok()),
            None => Ok(Some(collect.await)),
        }
    }

    /// Terminate the process group, then kill it if it is still around after
    /// the grace period.
    pub async fn kill(&mut self) -> Result<Option<i32>> {
        if self.is_alive()? {
            info!("terminating {}", self.pid);
            self.signal_group(Signal::SIGTERM);
            info!("terminated {}", self.pid);
        }
        if self.wait(Some(KILL_GRACE)).await?.is_none() {
            info!("killing {}", self.pid);
            self.signal_group(Signal::SIGKILL);
            self.wait(None).await?;
        }
        Ok(self.code)
    }

    fn signal_group(&self, signal: Signal) {
        let Ok(pgid) = i32::try_from(self.pid) else {
            return;
        };
        if let Err(e) = killpg(Pid::from_raw(pgid), signal) {
            debug!(pid = self.pid, ?signal, error = %e, "Signalling process group failed");
        }
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(stream: R, tx: mpsc::UnboundedSender<String>) {
    let mut reader = BufReader::new(stream);
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Reading child stdout failed");
                break;
            }
        }
    }
}

async fn read_all<R: AsyncRead + Unpin>(mut stream: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = stream.read_to_end(&mut buf).await {
        warn!(error = %e, "Reading child stderr failed");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn(command: &str) -> ChildProcess {
        ChildProcess::spawn(CommandLine::parse(command).unwrap(), &EnvOverrides::new()).unwrap()
    }

    #[tokio::test]
    async fn test_output_lines_then_rest() {
        let mut child = spawn("sh -c 'echo one; echo two; echo three; echo oops >&2'");
        assert_eq!(child.read_output_line().await, "one");
        assert_eq!(child.wait(None).await.unwrap(), Some(0));

        let (stdout, stderr) = child.communicate(None).await.unwrap().unwrap();
        assert_eq!(stdout, "two\nthree\n");
        assert_eq!(stderr, "oops\n");
        assert_eq!(child.read_output_line().await, "");

        let (stdout, stderr) = child.communicate(None).await.unwrap().unwrap();
        assert!(stdout.is_empty() && stderr.is_empty());
    }

    #[tokio::test]
    async fn test_env_lists_are_joined() {
        let mut env = EnvOverrides::new();
        env.insert(
            "BRUN_CHILD_PATH".into(),
            vec!["/x".to_string(), "/y".to_string()].into(),
        );
        let mut child = ChildProcess::spawn(
            CommandLine::from_args(["sh", "-c", "echo $BRUN_CHILD_PATH"]).unwrap(),
            &env,
        )
        .unwrap();
        assert_eq!(child.read_output_line().await, "/x:/y");
        child.wait(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_timeout_and_kill() {
        let mut child = spawn("sleep 30");
        assert!(child.is_alive().unwrap());
        assert_eq!(child.wait(Some(Duration::from_millis(20))).await.unwrap(), None);
        assert_eq!(child.kill().await.unwrap(), Some(-15));
        assert_eq!(child.poll().unwrap(), Some(-15));
    }

    #[tokio::test]
    async fn test_kill_escalates_when_term_is_ignored() {
        let mut child = spawn("sh -c 'trap \"\" TERM; echo ready; sleep 30'");
        assert_eq!(child.read_output_line().await, "ready");
        let started = std::time::Instant::now();
        assert_eq!(child.kill().await.unwrap(), Some(-9));
        assert!(started.elapsed() >= KILL_GRACE);
    }
}
