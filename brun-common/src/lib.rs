//! brun - Common Library
//!
//! Logging, configuration, command-line and dependency utilities shared by the
//! brun pool, remote runner and CLI.

#![deny(unsafe_code)]

pub mod command;
pub mod config;
pub mod deps;
pub mod logging;

pub use command::{
    CommandLine, CommandLineError, CommandSpec, EnvOverrides, EnvValue, flatten_env, merge_env,
    quote_join, split_words,
};
pub use config::{ConfigSource, EnvError, EnvParser, Sourced};
pub use deps::{Dependent, DependencyError, resolve_dependencies};
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
