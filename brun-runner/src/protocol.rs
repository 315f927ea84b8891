//! Wire format and framed transport.
//!
//! Every message is one line of JSON holding a three-element array:
//!
//! ```text
//! ["run", [], {"cmd": "./server", "wait": false}]
//! ["ok", [], {"rv": null}]
//! ["error", ["already running a process"], {}]
//! ```
//!
//! Requests carry the method name, positional arguments and keyword
//! arguments. Replies use the same shape with `ok` or `error` in place of the
//! method name.

use crate::error::{Result, RunnerError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

pub const STATUS_OK: &str = "ok";
pub const STATUS_ERROR: &str = "error";

/// One message: `(name, args, kwargs)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame(pub String, pub Vec<Value>, pub Map<String, Value>);

impl Frame {
    pub fn call(name: impl Into<String>, kwargs: Map<String, Value>) -> Self {
        Self(name.into(), Vec::new(), kwargs)
    }

    pub fn ok(rv: Value) -> Self {
        let mut kwargs = Map::new();
        kwargs.insert("rv".to_string(), rv);
        Self(STATUS_OK.to_string(), Vec::new(), kwargs)
    }

    pub fn error(message: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self(
            STATUS_ERROR.to_string(),
            vec![Value::String(message.into())],
            payload,
        )
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn args(&self) -> &[Value] {
        &self.1
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.2
    }

    pub fn into_parts(self) -> (String, Vec<Value>, Map<String, Value>) {
        (self.0, self.1, self.2)
    }

    /// Interpret a reply: the `rv` of an `ok`, an error for anything else.
    pub fn into_result(self) -> Result<Value> {
        let (status, args, mut kwargs) = self.into_parts();
        if status == STATUS_OK {
            return Ok(kwargs.remove("rv").unwrap_or(Value::Null));
        }
        let message = args
            .iter()
            .map(|arg| match arg {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ");
        Err(RunnerError::Remote {
            status,
            message,
            payload: kwargs,
        })
    }
}

/// A framed connection. Reads and writes whole lines.
pub struct Comms<R, W> {
    reader: R,
    writer: Option<W>,
    last_frame: String,
}

impl<R, W> Comms<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer: Some(writer),
            last_frame: String::new(),
        }
    }

    /// The raw text of the most recently received frame.
    pub fn last_frame(&self) -> &str {
        &self.last_frame
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<()> {
        debug!(" > {} {:?} {:?}", frame.name(), frame.args(), frame.kwargs());
        let Some(writer) = self.writer.as_mut() else {
            warn!("Could not send message {} because there is no connection", frame.name());
            return Err(RunnerError::ConnectionClosed);
        };
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Block until one whole frame arrives.
    pub async fn recv(&mut self) -> Result<Frame> {
        if self.writer.is_none() {
            warn!("Could not receive data because there is no connection");
            return Err(RunnerError::ConnectionClosed);
        }
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(RunnerError::ConnectionClosed);
        }
        let line = line.trim_end();
        debug!(" < {line}");
        self.last_frame = line.to_string();
        serde_json::from_str(line).map_err(|e| RunnerError::Protocol {
            message: format!("malformed frame: {e}"),
            last_frame: self.last_frame.clone(),
        })
    }

    /// Shut down the write side. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{BufReader, duplex};

    #[test]
    fn test_frame_wire_shape() {
        let frame = Frame::ok(json!(0));
        assert_eq!(serde_json::to_string(&frame).unwrap(), r#"["ok",[],{"rv":0}]"#);

        let frame: Frame = serde_json::from_str(r#"["has_file", ["/etc/hostname"], {}]"#).unwrap();
        assert_eq!(frame.name(), "has_file");
        assert_eq!(frame.args(), [json!("/etc/hostname")]);
    }

    #[test]
    fn test_reply_into_result() {
        assert_eq!(Frame::ok(json!([1, 2])).into_result().unwrap(), json!([1, 2]));

        let mut payload = Map::new();
        payload.insert("rv".into(), json!(2));
        let err = Frame::error("process exited with error", payload)
            .into_result()
            .unwrap_err();
        match err {
            RunnerError::Remote {
                status,
                message,
                payload,
            } => {
                assert_eq!(status, "error");
                assert_eq!(message, "process exited with error");
                assert_eq!(payload["rv"], json!(2));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_comms_round_trip_and_close() {
        let (a, b) = duplex(1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let mut left = Comms::new(BufReader::new(ar), aw);
        let mut right = Comms::new(BufReader::new(br), bw);

        left.send(&Frame::call("get_pids", Map::new())).await.unwrap();
        let frame = right.recv().await.unwrap();
        assert_eq!(frame.name(), "get_pids");
        assert_eq!(right.last_frame(), r#"["get_pids",[],{}]"#);

        left.close().await;
        left.close().await;
        assert!(left.is_closed());
        assert!(matches!(right.recv().await, Err(RunnerError::ConnectionClosed)));
        assert!(matches!(
            left.send(&Frame::ok(Value::Null)).await,
            Err(RunnerError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_text() {
        let (a, b) = duplex(1024);
        let (_ar, mut aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let mut right = Comms::new(BufReader::new(br), bw);

        aw.write_all(b"{\"not\": \"an array\"}\n").await.unwrap();
        match right.recv().await {
            Err(RunnerError::Protocol { last_frame, .. }) => {
                assert_eq!(last_frame, r#"{"not": "an array"}"#)
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }
}
