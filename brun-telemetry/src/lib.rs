//! Statistics collection for brun remote runners.
//!
//! ## Modules
//!
//! - [`collect`]: system and per-process metrics read from the /proc filesystem
//! - [`monitor`]: a background thread recording those metrics as time series

#![forbid(unsafe_code)]

pub mod collect;
pub mod monitor;

pub use collect::TelemetryError;
pub use collect::cpu::{CpuCollector, CpuTimes};
pub use collect::process::{
    MemoryUsage, ProcStat, ProcessCpuTracker, descendants, process_exists, process_tree,
};
pub use monitor::{MonitorThread, Sample, Series, Stat};
