//! System and process metrics collection from the /proc filesystem.

pub mod cpu;
pub mod process;

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while reading /proc.
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("failed to read {path}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {detail}")]
    ParseError { path: PathBuf, detail: String },

    #[error("no such process: {0}")]
    NoSuchProcess(u32),

    #[error("Unsupported stats requested: {0}")]
    UnsupportedStat(String),

    #[error("failed to start sampling thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    #[error("sampling thread panicked")]
    SamplerPanicked,
}

pub(crate) fn read_proc_file(path: impl Into<PathBuf>) -> Result<String, TelemetryError> {
    let path = path.into();
    std::fs::read_to_string(&path).map_err(|source| TelemetryError::ReadError { path, source })
}
