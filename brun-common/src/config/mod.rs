//! Environment-driven configuration for brun.
//!
//! Values come from built-in defaults, `BRUN_*` environment variables and
//! command-line flags, in increasing order of precedence. Each value keeps
//! track of where it came from so `--verbose` runs can explain themselves.

pub mod env;
pub mod source;

pub use env::{EnvError, EnvParser};
pub use source::{ConfigSource, Sourced};
