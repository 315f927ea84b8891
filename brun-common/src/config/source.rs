//! Configuration source tracking.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a configuration value originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    /// Built-in default value.
    Default,
    /// `BRUN_*` environment variable.
    Environment,
    /// Command-line flag; overrides the other two.
    CommandLine,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConfigSource::Default => "default",
            ConfigSource::Environment => "environment",
            ConfigSource::CommandLine => "command line",
        };
        f.write_str(name)
    }
}

/// A configuration value with its source.
#[derive(Debug, Clone, PartialEq)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConfigSource,
    /// Variable name when the value came from the environment.
    pub env_var: Option<String>,
}

impl<T> Sourced<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self {
            value,
            source,
            env_var: None,
        }
    }

    pub fn from_env(value: T, var_name: impl Into<String>) -> Self {
        Self {
            value,
            source: ConfigSource::Environment,
            env_var: Some(var_name.into()),
        }
    }

    pub fn default_value(value: T) -> Self {
        Self::new(value, ConfigSource::Default)
    }

    /// Replace the value with a command-line override, if one was given.
    pub fn override_with(self, cli: Option<T>) -> Self {
        match cli {
            Some(value) => Self::new(value, ConfigSource::CommandLine),
            None => self,
        }
    }

    /// Map the value while preserving source.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Sourced<U> {
        Sourced {
            value: f(self.value),
            source: self.source,
            env_var: self.env_var,
        }
    }
}
