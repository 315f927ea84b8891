//! Remote runner errors.

use brun_common::CommandLineError;
use brun_telemetry::TelemetryError;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    /// A malformed or unexpected frame.
    #[error("{message}\nduring handling of message:\n{last_frame}")]
    Protocol { message: String, last_frame: String },

    /// The server answered with something other than `ok`.
    #[error("Got unexpected {status}: {message}\nreturned payload: {}", Value::Object(.payload.clone()))]
    Remote {
        status: String,
        message: String,
        payload: Map<String, Value>,
    },

    /// A server-side operation failed. `payload` is sent back to the client
    /// alongside the message.
    #[error("{message}")]
    Failed {
        message: String,
        payload: Map<String, Value>,
    },

    #[error("running {role}-only method '{method}' on the {other} side")]
    WrongRole {
        method: String,
        role: &'static str,
        other: &'static str,
    },

    #[error("unknown message type '{0}'")]
    UnknownMethod(String),

    #[error("bad arguments for '{method}': {detail}")]
    BadArguments { method: String, detail: String },

    #[error("connection closed")]
    ConnectionClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Command(#[from] CommandLineError),

    #[error("monitoring failed: {0}")]
    Monitor(#[from] TelemetryError),
}

impl RunnerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            payload: Map::new(),
        }
    }

    /// Payload to send back in an error reply.
    pub fn payload(&self) -> Map<String, Value> {
        match self {
            Self::Failed { payload, .. } | Self::Remote { payload, .. } => payload.clone(),
            _ => Map::new(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RunnerError>;
