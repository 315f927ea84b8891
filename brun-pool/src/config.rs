//! Pool selection from command-line flags.

use crate::backend::{ClusterBackend, LocalBackend, SshBackend, SshOptions};
use crate::error::{PoolError, Result};
use crate::job::{Callbacks, JobHandle, JobRequest};
use crate::pool::Pool;
use crate::settings::PoolSettings;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Cluster pools default to this many concurrently reserved machines.
pub const DEFAULT_CLUSTER_MAX: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelMode {
    Proc,
    Ssh,
    Prun,
}

impl ParallelMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proc => "proc",
            Self::Ssh => "ssh",
            Self::Prun => "prun",
        }
    }
}

impl fmt::Display for ParallelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParallelMode {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "proc" => Ok(Self::Proc),
            "ssh" => Ok(Self::Ssh),
            "prun" => Ok(Self::Prun),
            other => Err(PoolError::Config(format!(
                "invalid --parallel value '{other}' (expected proc, ssh or prun)"
            ))),
        }
    }
}

/// The pool flags as given by the user.
#[derive(Debug, Clone, Default)]
pub struct PoolConfig {
    pub parallel: Option<ParallelMode>,
    pub parallelmax: Option<usize>,
    pub ssh_nodes: Vec<String>,
    /// Extra scheduler options, already split into words.
    pub prun_opts: Vec<String>,
}

impl PoolConfig {
    /// Check flag combinations and work out the parallelism bound.
    ///
    /// Returns `None` when no pool was requested.
    pub fn validate(&self) -> Result<Option<(ParallelMode, usize)>> {
        let reject = |flag: &str, mode: &str| {
            Err(PoolError::Config(format!("{flag} not supported for {mode}")))
        };

        let Some(mode) = self.parallel else {
            if self.parallelmax.is_some() {
                return reject("--parallelmax", "non-parallel execution");
            }
            if !self.prun_opts.is_empty() {
                return reject("--prun-opts", "non-parallel execution");
            }
            return Ok(None);
        };

        if self.parallelmax == Some(0) {
            return Err(PoolError::Config("--parallelmax must be at least 1".to_string()));
        }

        let max = match mode {
            ParallelMode::Proc => {
                if !self.prun_opts.is_empty() {
                    return reject("--prun-opts", "--parallel=proc");
                }
                if !self.ssh_nodes.is_empty() {
                    return reject("--ssh-nodes", "--parallel=proc");
                }
                self.parallelmax.unwrap_or_else(cpu_count)
            }
            ParallelMode::Ssh => {
                if !self.prun_opts.is_empty() {
                    return reject("--prun-opts", "--parallel=ssh");
                }
                if self.ssh_nodes.is_empty() {
                    return Err(PoolError::Config(
                        "--ssh-nodes required for --parallel=ssh".to_string(),
                    ));
                }
                let max = self.parallelmax.unwrap_or(self.ssh_nodes.len());
                if max > self.ssh_nodes.len() {
                    return Err(PoolError::Config(
                        "parallelmax cannot be greater than number of available nodes".to_string(),
                    ));
                }
                max
            }
            ParallelMode::Prun => {
                if !self.ssh_nodes.is_empty() {
                    return reject("--ssh-nodes", "--parallel=prun");
                }
                self.parallelmax.unwrap_or(DEFAULT_CLUSTER_MAX)
            }
        };
        Ok(Some((mode, max)))
    }

    /// Build the requested pool, or `None` for direct execution.
    pub fn build(&self, settings: PoolSettings) -> Result<Option<AnyPool>> {
        let Some((mode, max)) = self.validate()? else {
            return Ok(None);
        };
        debug!(mode = %mode, parallelmax = max, "Creating job pool");

        let pool = match mode {
            ParallelMode::Proc => AnyPool::Local(Pool::new(LocalBackend, Some(max), settings)),
            ParallelMode::Ssh => AnyPool::Ssh(Pool::new(
                SshBackend::new(self.ssh_nodes.clone(), SshOptions::default()),
                Some(max),
                settings,
            )),
            ParallelMode::Prun => {
                let backend = ClusterBackend::new(
                    settings.scheduler.clone(),
                    self.prun_opts.clone(),
                    settings.default_reservation_secs,
                );
                AnyPool::Cluster(Pool::new(backend, Some(max), settings))
            }
        };
        Ok(Some(pool))
    }
}

fn cpu_count() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

/// A pool over whichever backend the flags selected.
pub enum AnyPool {
    Local(Pool<LocalBackend>),
    Cluster(Pool<ClusterBackend>),
    Ssh(Pool<SshBackend>),
}

impl AnyPool {
    pub fn mode(&self) -> ParallelMode {
        match self {
            Self::Local(_) => ParallelMode::Proc,
            Self::Cluster(_) => ParallelMode::Prun,
            Self::Ssh(_) => ParallelMode::Ssh,
        }
    }

    pub fn max_parallel(&self) -> Option<usize> {
        match self {
            Self::Local(pool) => pool.max_parallel(),
            Self::Cluster(pool) => pool.max_parallel(),
            Self::Ssh(pool) => pool.max_parallel(),
        }
    }

    pub fn run(&self, request: JobRequest, callbacks: Callbacks) -> Result<Vec<JobHandle>> {
        match self {
            Self::Local(pool) => pool.run(request, callbacks),
            Self::Cluster(pool) => pool.run(request, callbacks),
            Self::Ssh(pool) => pool.run(request, callbacks),
        }
    }

    pub fn wait_all(&self) {
        match self {
            Self::Local(pool) => pool.wait_all(),
            Self::Cluster(pool) => pool.wait_all(),
            Self::Ssh(pool) => pool.wait_all(),
        }
    }

    /// The SSH pool, for file sync and tunnels.
    pub fn as_ssh(&self) -> Option<&Pool<SshBackend>> {
        match self {
            Self::Ssh(pool) => Some(pool),
            _ => None,
        }
    }
}

impl fmt::Debug for AnyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyPool")
            .field("mode", &self.mode())
            .field("max_parallel", &self.max_parallel())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(parallel: Option<ParallelMode>) -> PoolConfig {
        PoolConfig {
            parallel,
            ..PoolConfig::default()
        }
    }

    fn config_error(config: &PoolConfig) -> String {
        match config.validate() {
            Err(PoolError::Config(msg)) => msg,
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!("proc".parse::<ParallelMode>().unwrap(), ParallelMode::Proc);
        assert_eq!("prun".parse::<ParallelMode>().unwrap(), ParallelMode::Prun);
        assert!("threads".parse::<ParallelMode>().is_err());
        assert_eq!(ParallelMode::Ssh.to_string(), "ssh");
    }

    #[test]
    fn test_no_pool() {
        assert_eq!(config(None).validate().unwrap(), None);

        let mut cfg = config(None);
        cfg.parallelmax = Some(4);
        assert!(config_error(&cfg).contains("--parallelmax"));

        let mut cfg = config(None);
        cfg.prun_opts = vec!["-t".into()];
        assert!(config_error(&cfg).contains("--prun-opts"));
    }

    #[test]
    fn test_proc_defaults_to_cpu_count() {
        let (mode, max) = config(Some(ParallelMode::Proc)).validate().unwrap().unwrap();
        assert_eq!(mode, ParallelMode::Proc);
        assert_eq!(max, cpu_count());

        let mut cfg = config(Some(ParallelMode::Proc));
        cfg.prun_opts = vec!["-t".into()];
        assert_eq!(config_error(&cfg), "--prun-opts not supported for --parallel=proc");

        let mut cfg = config(Some(ParallelMode::Proc));
        cfg.ssh_nodes = vec!["a".into()];
        assert_eq!(config_error(&cfg), "--ssh-nodes not supported for --parallel=proc");
    }

    #[test]
    fn test_ssh_bounds() {
        let mut cfg = config(Some(ParallelMode::Ssh));
        assert!(config_error(&cfg).contains("--ssh-nodes required"));

        cfg.ssh_nodes = vec!["a".into(), "b".into()];
        assert_eq!(cfg.validate().unwrap(), Some((ParallelMode::Ssh, 2)));

        cfg.parallelmax = Some(1);
        assert_eq!(cfg.validate().unwrap(), Some((ParallelMode::Ssh, 1)));

        cfg.parallelmax = Some(3);
        assert!(config_error(&cfg).contains("greater than number of available nodes"));
    }

    #[test]
    fn test_prun_default_max() {
        let cfg = config(Some(ParallelMode::Prun));
        assert_eq!(cfg.validate().unwrap(), Some((ParallelMode::Prun, DEFAULT_CLUSTER_MAX)));

        let mut cfg = config(Some(ParallelMode::Prun));
        cfg.ssh_nodes = vec!["a".into()];
        assert_eq!(config_error(&cfg), "--ssh-nodes not supported for --parallel=prun");
    }

    #[test]
    fn test_zero_parallelmax() {
        let mut cfg = config(Some(ParallelMode::Proc));
        cfg.parallelmax = Some(0);
        assert!(config_error(&cfg).contains("at least 1"));
    }

    #[test]
    fn test_build_selects_backend() {
        let mut cfg = config(Some(ParallelMode::Prun));
        cfg.prun_opts = vec!["-t".into(), "30:00".into()];
        let pool = cfg.build(PoolSettings::default()).unwrap().unwrap();
        assert_eq!(pool.mode(), ParallelMode::Prun);
        assert_eq!(pool.max_parallel(), Some(64));
        assert!(pool.as_ssh().is_none());

        let mut cfg = config(Some(ParallelMode::Ssh));
        cfg.ssh_nodes = vec!["client".into(), "server".into()];
        let pool = cfg.build(PoolSettings::default()).unwrap().unwrap();
        let ssh = pool.as_ssh().unwrap();
        assert_eq!(ssh.backend().nodes(), ["client", "server"]);

        assert!(config(None).build(PoolSettings::default()).unwrap().is_none());
    }
}
