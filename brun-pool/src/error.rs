//! Errors raised by pools before or while launching jobs.
//!
//! Job failures (non-zero exit, stream errors) are not errors here; they are
//! reported through the job's error callback.

use brun_common::{CommandLineError, EnvError};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    /// Invalid combination of pool flags.
    #[error("{0}")]
    Config(String),

    #[error("invalid pool settings: {}", format_env_errors(.0))]
    Settings(Vec<EnvError>),

    #[error(transparent)]
    Command(#[from] CommandLineError),

    #[error("job {jobid}: resource cost must be at least 1")]
    ZeroCost { jobid: String },

    #[error("job {jobid} needs {cost} nodes but the pool allows at most {max}")]
    CostExceedsLimit { jobid: String, cost: usize, max: usize },

    #[error("failed to start job {jobid}: {source}")]
    Spawn {
        jobid: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open output file {path}: {source}")]
    Outfile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to set up output polling: {0}")]
    Poll(#[source] std::io::Error),

    #[error("required program '{program}' not found on PATH")]
    MissingProgram { program: String },

    #[error("Testing SSH node {node} failed:\n{output}")]
    NodeTest { node: String, output: String },

    #[error("ssh command on {node} failed ({command}):\n{output}")]
    Remote {
        node: String,
        command: String,
        output: String,
    },

    #[error("unknown SSH node '{0}'")]
    UnknownNode(String),

    #[error("SSH node '{0}' is busy")]
    NodeBusy(String),

    #[error("no free SSH node")]
    NoFreeNode,
}

fn format_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, PoolError>;
