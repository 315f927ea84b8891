//! brun - Job Pools
//!
//! Runs commands concurrently under a bound on the resources they consume,
//! over local processes, a batch cluster scheduler or SSH nodes. One
//! multiplexer thread per pool collects job output and runs completion
//! callbacks.

#![deny(unsafe_code)]

pub mod admission;
pub mod backend;
pub mod config;
pub mod error;
pub mod job;
mod multiplexer;
pub mod pool;
pub mod settings;

pub use admission::{Admission, Reservation};
pub use backend::{
    Backend, ClusterBackend, KnownHostsPolicy, LocalBackend, SshBackend, SshOptions, SshRunOptions,
};
pub use config::{AnyPool, ParallelMode, PoolConfig};
pub use error::{PoolError, Result};
pub use job::{Callback, Callbacks, Disposition, Job, JobHandle, JobRequest};
pub use pool::{LaunchSpec, Launcher, Pool};
pub use settings::PoolSettings;
