//! The method table shared by client and server.
//!
//! Each exposed operation has a wire name and an ordered parameter list.
//! Positional arguments in a request are matched to parameters by position
//! and merged with the keyword arguments before the typed parameters are
//! deserialized.

use crate::error::{Result, RunnerError};
use crate::protocol::Frame;
use brun_common::{CommandSpec, EnvOverrides};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;

/// Which end of a connection may run a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Executed on the server at the client's request.
    Remote,
    /// Only meaningful on the client.
    ClientOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    GetPids,
    RunnerExit,
    Run,
    Poll,
    ProcCommunicate,
    Wait,
    Kill,
    ReadOutputLine,
    GetCpuPercentage,
    StartMonitoring,
    StopMonitoring,
    HasFile,
    Close,
}

impl Method {
    pub const ALL: [Method; 13] = [
        Method::GetPids,
        Method::RunnerExit,
        Method::Run,
        Method::Poll,
        Method::ProcCommunicate,
        Method::Wait,
        Method::Kill,
        Method::ReadOutputLine,
        Method::GetCpuPercentage,
        Method::StartMonitoring,
        Method::StopMonitoring,
        Method::HasFile,
        Method::Close,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Method::GetPids => "get_pids",
            Method::RunnerExit => "runner_exit",
            Method::Run => "run",
            Method::Poll => "poll",
            Method::ProcCommunicate => "proc_communicate",
            Method::Wait => "wait",
            Method::Kill => "kill",
            Method::ReadOutputLine => "read_output_line",
            Method::GetCpuPercentage => "get_cpu_percentage",
            Method::StartMonitoring => "start_monitoring",
            Method::StopMonitoring => "stop_monitoring",
            Method::HasFile => "has_file",
            Method::Close => "close",
        }
    }

    /// Parameter names in positional order.
    pub fn params(self) -> &'static [&'static str] {
        match self {
            Method::Run => &["cmd", "env", "wait", "allow_error"],
            Method::Poll => &["expect_alive"],
            Method::ProcCommunicate => &["timeout"],
            Method::Wait => &["timeout", "output", "stats", "allow_error"],
            Method::StartMonitoring => &["interval", "stats"],
            Method::HasFile => &["path"],
            _ => &[],
        }
    }

    pub fn role(self) -> Role {
        match self {
            Method::Close => Role::ClientOnly,
            _ => Role::Remote,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded request: the method and all arguments by name.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub method: Method,
    pub kwargs: Map<String, Value>,
}

impl Call {
    /// Resolve a request frame against the method table.
    pub fn from_frame(frame: Frame) -> Result<Self> {
        let (name, args, mut kwargs) = frame.into_parts();
        let method = Method::from_name(&name).ok_or(RunnerError::UnknownMethod(name))?;
        if method.role() == Role::ClientOnly {
            return Err(RunnerError::WrongRole {
                method: method.name().to_string(),
                role: "client",
                other: "server",
            });
        }

        let params = method.params();
        if args.len() > params.len() {
            return Err(RunnerError::BadArguments {
                method: method.name().to_string(),
                detail: format!(
                    "takes {} positional arguments but {} were given",
                    params.len(),
                    args.len()
                ),
            });
        }
        for (param, value) in params.iter().zip(args) {
            if kwargs.insert(param.to_string(), value).is_some() {
                return Err(RunnerError::BadArguments {
                    method: method.name().to_string(),
                    detail: format!("got multiple values for argument '{param}'"),
                });
            }
        }
        Ok(Self { method, kwargs })
    }

    /// Deserialize the arguments into a parameter struct.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.kwargs.clone())).map_err(|e| {
            RunnerError::BadArguments {
                method: self.method.name().to_string(),
                detail: e.to_string(),
            }
        })
    }
}

/// Turn a parameter struct into keyword arguments.
pub(crate) fn to_kwargs<T: Serialize>(params: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(params)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(RunnerError::Protocol {
            message: "parameters must serialize to an object".to_string(),
            last_frame: other.to_string(),
        }),
    }
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunParams {
    pub cmd: CommandSpec,
    #[serde(default)]
    pub env: EnvOverrides,
    /// Block until the process exits and return the wait result.
    #[serde(default = "yes")]
    pub wait: bool,
    #[serde(default)]
    pub allow_error: bool,
}

impl RunParams {
    pub fn new(cmd: impl Into<CommandSpec>) -> Self {
        Self {
            cmd: cmd.into(),
            env: EnvOverrides::new(),
            wait: true,
            allow_error: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollParams {
    #[serde(default)]
    pub expect_alive: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommunicateParams {
    /// Seconds; `None` waits indefinitely.
    #[serde(default)]
    pub timeout: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WaitParams {
    /// Seconds; `None` waits indefinitely.
    #[serde(default)]
    pub timeout: Option<f64>,
    /// Capture stdout and stderr once the process has exited.
    #[serde(default = "yes")]
    pub output: bool,
    /// Include the system CPU load since the previous sample.
    #[serde(default = "yes")]
    pub stats: bool,
    #[serde(default)]
    pub allow_error: bool,
}

impl Default for WaitParams {
    fn default() -> Self {
        Self {
            timeout: None,
            output: true,
            stats: true,
            allow_error: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorParams {
    /// Seconds between samples.
    #[serde(default = "default_interval")]
    pub interval: f64,
    #[serde(default = "default_stats")]
    pub stats: Vec<String>,
}

fn default_interval() -> f64 {
    1.0
}

fn default_stats() -> Vec<String> {
    vec!["cpu".to_string(), "rss".to_string()]
}

impl Default for MonitorParams {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            stats: default_stats(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HasFileParams {
    pub path: PathBuf,
}

/// What `wait` reports. Fields are omitted when not applicable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaitResult {
    /// Exit code, or `-signal`; absent if the process is still running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rv: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percentage: Option<f64>,
}
