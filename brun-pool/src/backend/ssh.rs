//! Jobs on remote hosts over `ssh`.
//!
//! Hosts are passed to `ssh` as given, so ports, users and keys belong in
//! `~/.ssh/config`. Every node must be reachable without a password prompt.
//! Besides running jobs the backend keeps a per-pool scratch directory on all
//! nodes and copies files to and from it with `scp`.

use super::Backend;
use crate::error::{PoolError, Result};
use crate::job::{Job, JobRequest};
use crate::pool::{LaunchSpec, Launcher};
use brun_common::{flatten_env, quote_join};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Range tunnel source ports are drawn from.
const TUNNEL_PORTS: std::ops::Range<u16> = 10000..30000;

/// Known hosts policy for SSH connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KnownHostsPolicy {
    /// Refuse hosts that are not already known.
    Strict,
    /// Add unknown hosts automatically, refuse changed keys.
    #[default]
    Add,
    /// Accept all hosts without verification (testing only).
    AcceptAll,
}

impl KnownHostsPolicy {
    fn as_option(self) -> &'static str {
        match self {
            Self::Strict => "yes",
            Self::Add => "accept-new",
            Self::AcceptAll => "no",
        }
    }
}

/// Options passed to every `ssh` and `scp` invocation.
#[derive(Debug, Clone)]
pub struct SshOptions {
    /// Never prompt for passwords or passphrases.
    pub batch_mode: bool,
    pub known_hosts: KnownHostsPolicy,
    pub connect_timeout: Option<Duration>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            batch_mode: true,
            known_hosts: KnownHostsPolicy::Add,
            connect_timeout: None,
        }
    }
}

impl SshOptions {
    /// `-o` arguments understood by both `ssh` and `scp`.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![format!(
            "-oStrictHostKeyChecking={}",
            self.known_hosts.as_option()
        )];
        if self.batch_mode {
            args.push("-oBatchMode=yes".to_string());
        }
        if let Some(timeout) = self.connect_timeout {
            args.push(format!("-oConnectTimeout={}", timeout.as_secs().max(1)));
        }
        args
    }
}

/// Per-call options for [`Pool::run_with`](crate::Pool::run_with).
#[derive(Debug, Clone, Default)]
pub struct SshRunOptions {
    /// Run replica `i` on `nodes[i]` instead of any free node.
    pub nodes: Option<Vec<String>>,
    /// Forward a random local port to this port on the job's node.
    pub tunnel_dest: Option<u16>,
}

#[derive(Debug)]
pub struct SshJobState {
    node: String,
}

#[derive(Debug, Default)]
struct Progress {
    tested: bool,
    tempdir_created: bool,
}

#[derive(Debug)]
pub struct SshBackend {
    nodes: Vec<String>,
    options: SshOptions,
    free: Mutex<Vec<String>>,
    progress: Mutex<Progress>,
    tempdir: String,
}

impl SshBackend {
    pub fn new(nodes: Vec<String>, options: SshOptions) -> Self {
        let stamp = chrono::Local::now().format("%Y-%m-%d.%H-%M-%S");
        Self {
            free: Mutex::new(nodes.clone()),
            nodes,
            options,
            progress: Mutex::new(Progress::default()),
            tempdir: format!("/tmp/brun-{stamp}"),
        }
    }

    /// Node names exactly as configured.
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    /// Scratch directory present on every node, created on first use.
    pub fn tempdir(&self) -> Result<&str> {
        self.create_tempdirs()?;
        Ok(&self.tempdir)
    }

    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn free_nodes(&self) -> MutexGuard<'_, Vec<String>> {
        self.free.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `ssh` argv running `remote` on `node`, optionally with a tunnel.
    pub(crate) fn ssh_argv(&self, node: &str, remote: &str, tunnel: Option<(u16, u16)>) -> Vec<String> {
        let mut argv = vec!["ssh".to_string()];
        argv.extend(self.options.to_args());
        if let Some((src, dest)) = tunnel {
            argv.push(format!("-Llocalhost:{src}:0.0.0.0:{dest}"));
        }
        argv.push(node.to_string());
        argv.push(remote.to_string());
        argv
    }

    fn scp_argv(&self) -> Vec<String> {
        let mut argv = vec!["scp".to_string(), "-q".into(), "-B".into(), "-r".into()];
        argv.extend(self.options.to_args());
        argv
    }

    /// Run a short command to completion and collect stdout and stderr.
    fn run_quiet(argv: &[String]) -> Result<Output> {
        debug!(command = %quote_join(argv), "Running ssh helper command");
        Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .output()
            .map_err(|source| PoolError::Spawn {
                jobid: quote_join(argv),
                source,
            })
    }

    fn run_checked(node: &str, argv: &[String]) -> Result<()> {
        let output = Self::run_quiet(argv)?;
        if output.status.success() {
            return Ok(());
        }
        Err(PoolError::Remote {
            node: node.to_string(),
            command: quote_join(argv),
            output: combined(&output),
        })
    }

    /// Check once that every node answers `echo -n hi`.
    pub fn test_nodes(&self) -> Result<()> {
        let mut progress = self.progress();
        if progress.tested {
            return Ok(());
        }
        for node in &self.nodes {
            let output = Self::run_quiet(&self.ssh_argv(node, "echo -n hi", None))?;
            let text = combined(&output);
            if !output.status.success() || !text.ends_with("hi") {
                return Err(PoolError::NodeTest {
                    node: node.clone(),
                    output: text,
                });
            }
        }
        progress.tested = true;
        Ok(())
    }

    fn create_tempdirs(&self) -> Result<()> {
        if self.progress().tempdir_created {
            return Ok(());
        }
        self.test_nodes()?;

        let mut progress = self.progress();
        if progress.tempdir_created {
            return Ok(());
        }
        debug!(tempdir = %self.tempdir, nodes = ?self.nodes, "Creating temp dir on SSH nodes");
        let remote = quote_join(&["mkdir", "-p", self.tempdir.as_str()]);
        for node in &self.nodes {
            Self::run_checked(node, &self.ssh_argv(node, &remote, None))?;
        }
        progress.tempdir_created = true;
        Ok(())
    }

    /// Remove the scratch directory from every node, if it was created.
    pub fn cleanup_tempdirs(&self) -> Result<()> {
        let mut progress = self.progress();
        if !progress.tempdir_created {
            return Ok(());
        }
        debug!(tempdir = %self.tempdir, nodes = ?self.nodes, "Cleaning up temp dir on SSH nodes");
        let remote = quote_join(&["rm", "-rf", self.tempdir.as_str()]);
        for node in &self.nodes {
            Self::run_checked(node, &self.ssh_argv(node, &remote, None))?;
        }
        progress.tempdir_created = false;
        Ok(())
    }

    /// Copy local `sources` into `destination` under the scratch directory.
    pub fn sync_to_nodes<P: AsRef<Path>>(
        &self,
        sources: &[P],
        destination: &str,
        target_nodes: Option<&[String]>,
    ) -> Result<()> {
        let tempdir = self.tempdir()?;
        let nodes = target_nodes.unwrap_or(&self.nodes);
        debug!(destination, nodes = ?nodes, "Syncing files to SSH nodes");

        for node in nodes {
            let mut argv = self.scp_argv();
            argv.extend(sources.iter().map(|s| s.as_ref().to_string_lossy().into_owned()));
            argv.push(format!("{node}:{}", remote_path(tempdir, destination)));
            Self::run_checked(node, &argv)?;
        }
        Ok(())
    }

    /// Copy `source` from the scratch directory of each node to the local
    /// machine. Returns the local paths written, one per node.
    pub fn sync_from_nodes(
        &self,
        source: &str,
        destination: Option<&Path>,
        source_nodes: Option<&[String]>,
    ) -> Result<Vec<PathBuf>> {
        let tempdir = self.tempdir()?;
        let nodes = source_nodes.unwrap_or(&self.nodes);
        debug!(source, nodes = ?nodes, "Syncing files from SSH nodes");

        let base = destination.map_or_else(
            || PathBuf::from(Path::new(source).file_name().unwrap_or(source.as_ref())),
            Path::to_path_buf,
        );
        let targets = sync_destinations(&base, nodes);
        for (node, dest) in nodes.iter().zip(&targets) {
            let mut argv = self.scp_argv();
            argv.push(format!("{node}:{}", remote_path(tempdir, source)));
            argv.push(dest.to_string_lossy().into_owned());
            Self::run_checked(node, &argv)?;
        }
        Ok(targets)
    }

    /// Take `requested` if given, else any free node.
    pub(crate) fn take_node(&self, requested: Option<&str>) -> Result<String> {
        let mut free = self.free_nodes();
        match requested {
            Some(node) => {
                if !self.nodes.iter().any(|n| n == node) {
                    return Err(PoolError::UnknownNode(node.to_string()));
                }
                let index = free
                    .iter()
                    .position(|n| n == node)
                    .ok_or_else(|| PoolError::NodeBusy(node.to_string()))?;
                Ok(free.remove(index))
            }
            None => free.pop().ok_or(PoolError::NoFreeNode),
        }
    }

    pub(crate) fn return_node(&self, node: String) {
        self.free_nodes().push(node);
    }

    /// Shell command run on the node for `request`.
    fn remote_command(request: &JobRequest) -> String {
        let mut parts = Vec::new();
        if let Some(dir) = &request.cwd {
            parts.push(format!("cd {} &&", quote_join(&[dir.to_string_lossy()])));
        }
        let env: Vec<String> = flatten_env(&request.env)
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        if !env.is_empty() {
            parts.push(format!("env {}", quote_join(&env)));
        }
        parts.push(request.command.to_shell_string());
        parts.join(" ")
    }
}

impl Backend for SshBackend {
    type State = SshJobState;
    type Options = SshRunOptions;

    fn name(&self) -> &'static str {
        "ssh"
    }

    fn make_jobs(
        &self,
        request: &JobRequest,
        options: SshRunOptions,
        launcher: &mut Launcher<'_, SshJobState>,
    ) -> Result<()> {
        self.test_nodes()?;
        let remote = Self::remote_command(request);

        for i in 0..request.cost {
            let (jobid, outfile) = request.replica(i, request.cost);
            let reservation = launcher.reserve(1);
            let requested = options.nodes.as_ref().and_then(|nodes| nodes.get(i));
            let node = self.take_node(requested.map(String::as_str))?;
            info!("running {jobid} on {node}");

            let tunnel = options
                .tunnel_dest
                .map(|dest| (rand::rng().random_range(TUNNEL_PORTS), dest));
            let argv = self.ssh_argv(&node, &remote, tunnel);
            let mut command = Command::new(&argv[0]);
            command.args(&argv[1..]);

            let mut job = Job::new(jobid, request.command.clone(), 1, vec![outfile.clone()]);
            job.start_time = Some(Instant::now());
            job.node = Some(node.clone());
            job.tunnel_port = tunnel.map(|(src, _)| src);

            let launched = launcher.launch(LaunchSpec {
                command,
                job,
                state: SshJobState { node: node.clone() },
                capture: Some(outfile),
                reservation,
            });
            if let Err(e) = launched {
                self.return_node(node);
                return Err(e);
            }
        }
        Ok(())
    }

    fn finish(&self, _job: &mut Job, state: &mut SshJobState) {
        self.return_node(std::mem::take(&mut state.node));
    }
}

fn remote_path(tempdir: &str, relative: &str) -> String {
    if relative.is_empty() {
        tempdir.to_string()
    } else {
        format!("{}/{}", tempdir.trim_end_matches('/'), relative)
    }
}

/// Local targets for copying one file from each of `nodes`.
pub(crate) fn sync_destinations(base: &Path, nodes: &[String]) -> Vec<PathBuf> {
    if nodes.len() <= 1 {
        return nodes.iter().map(|_| base.to_path_buf()).collect();
    }
    let mut unique = nodes.to_vec();
    unique.sort();
    unique.dedup();
    let repeated = unique.len() != nodes.len();

    nodes
        .iter()
        .enumerate()
        .map(|(i, node)| {
            let mut suffix = format!(".{node}");
            if repeated {
                suffix.push_str(&i.to_string());
            }
            crate::job::with_suffix(base, &suffix)
        })
        .collect()
}

fn combined(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use brun_common::CommandLine;

    fn backend(nodes: &[&str]) -> SshBackend {
        SshBackend::new(nodes.iter().map(|n| n.to_string()).collect(), SshOptions::default())
    }

    #[test]
    fn test_default_options() {
        assert_eq!(
            SshOptions::default().to_args(),
            ["-oStrictHostKeyChecking=accept-new", "-oBatchMode=yes"]
        );
        let strict = SshOptions {
            batch_mode: false,
            known_hosts: KnownHostsPolicy::Strict,
            connect_timeout: Some(Duration::from_secs(5)),
        };
        assert_eq!(
            strict.to_args(),
            ["-oStrictHostKeyChecking=yes", "-oConnectTimeout=5"]
        );
    }

    #[test]
    fn test_ssh_argv_with_tunnel() {
        println!("TEST START: test_ssh_argv_with_tunnel");
        let backend = backend(&["web1"]);
        assert_eq!(
            backend.ssh_argv("web1", "nginx -g 'daemon off;'", Some((12345, 8080))),
            [
                "ssh",
                "-oStrictHostKeyChecking=accept-new",
                "-oBatchMode=yes",
                "-Llocalhost:12345:0.0.0.0:8080",
                "web1",
                "nginx -g 'daemon off;'"
            ]
        );
        println!("TEST PASS: test_ssh_argv_with_tunnel");
    }

    #[test]
    fn test_take_and_return_nodes() {
        println!("TEST START: test_take_and_return_nodes");
        let backend = backend(&["a", "b"]);

        assert!(matches!(backend.take_node(Some("c")), Err(PoolError::UnknownNode(n)) if n == "c"));
        assert_eq!(backend.take_node(Some("a")).unwrap(), "a");
        assert!(matches!(backend.take_node(Some("a")), Err(PoolError::NodeBusy(n)) if n == "a"));
        assert_eq!(backend.take_node(None).unwrap(), "b");
        assert!(matches!(backend.take_node(None), Err(PoolError::NoFreeNode)));

        backend.return_node("a".to_string());
        assert_eq!(backend.take_node(None).unwrap(), "a");
        println!("TEST PASS: test_take_and_return_nodes");
    }

    #[test]
    fn test_sync_destinations() {
        let base = Path::new("results/log.txt");
        assert_eq!(
            sync_destinations(base, &["a".to_string()]),
            [PathBuf::from("results/log.txt")]
        );
        assert_eq!(
            sync_destinations(base, &["a".to_string(), "b".to_string()]),
            [
                PathBuf::from("results/log.txt.a"),
                PathBuf::from("results/log.txt.b")
            ]
        );
        assert_eq!(
            sync_destinations(base, &["a".to_string(), "a".to_string()]),
            [
                PathBuf::from("results/log.txt.a0"),
                PathBuf::from("results/log.txt.a1")
            ]
        );
    }

    #[test]
    fn test_tempdir_name() {
        let backend = backend(&["a"]);
        let name = backend.tempdir.strip_prefix("/tmp/brun-").unwrap();
        // YYYY-mm-dd.HH-MM-SS
        assert_eq!(name.len(), 19);
        assert_eq!(&name[10..11], ".");
        assert_eq!(backend.nodes(), ["a"]);
    }

    #[test]
    fn test_remote_command() {
        let request = JobRequest::new(
            CommandLine::parse("./server --port 8080").unwrap(),
            "server",
            "/tmp/server.out",
        )
        .env("OMP_NUM_THREADS", "4")
        .cwd("/srv/bench");
        assert_eq!(
            SshBackend::remote_command(&request),
            "cd /srv/bench && env OMP_NUM_THREADS=4 ./server --port 8080"
        );
    }

    #[test]
    fn test_remote_path() {
        assert_eq!(remote_path("/tmp/brun-x", ""), "/tmp/brun-x");
        assert_eq!(remote_path("/tmp/brun-x/", "bin/server"), "/tmp/brun-x/bin/server");
    }
}
