//! brun - Remote Runner
//!
//! Operates a process on a machine the orchestrator shares neither a
//! filesystem nor a process table with. A `brun-runner` server on the remote
//! host accepts one connection and executes requests from a
//! [`RunnerClient`]; both ends share the method table in [`dispatch`].
//!
//! ## Modules
//!
//! - [`protocol`]: line-delimited JSON frames and the framed transport
//! - [`dispatch`]: method names, parameters and argument decoding
//! - [`server`]: the single-connection server session
//! - [`client`]: typed calls over a connection
//! - [`child`]: the controlled child process

#![deny(unsafe_code)]

pub mod child;
pub mod client;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::RunnerClient;
pub use dispatch::{Method, MonitorParams, RunParams, WaitParams, WaitResult};
pub use error::{Result, RunnerError};
pub use protocol::Frame;
pub use server::{DEFAULT_PORT, bind, serve};
