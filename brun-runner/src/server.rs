//! Server side: execute requests against one child process.
//!
//! The server accepts exactly one connection and then handles one request at
//! a time. Handlers return their value and the loop sends the single `ok`
//! reply, so an operation built from other operations still answers once.
//! Any handler error ends the session: the client gets an `error` frame,
//! the connection is closed and the child is killed.

use crate::child::ChildProcess;
use crate::dispatch::{
    Call, CommunicateParams, HasFileParams, Method, MonitorParams, PollParams, RunParams,
    WaitParams, WaitResult,
};
use crate::error::{Result, RunnerError};
use crate::protocol::{Comms, Frame};
use brun_common::CommandLine;
use brun_telemetry::{CpuCollector, MonitorThread, TelemetryError, process_tree};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, error, info, warn};

pub const DEFAULT_PORT: u16 = 20010;

type TcpComms = Comms<BufReader<OwnedReadHalf>, OwnedWriteHalf>;

/// Bind the listening socket.
pub async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    let listener = TcpListener::bind((host, port)).await?;
    info!("Listening on {}:{}", host, port);
    Ok(listener)
}

/// Accept one connection on `listener` and serve it until `runner_exit`.
pub async fn serve(listener: TcpListener) -> Result<()> {
    let (stream, addr) = listener.accept().await?;
    info!("Connection from {addr}");
    drop(listener);

    let (reader, writer) = stream.into_split();
    let mut session = Session::new(Comms::new(BufReader::new(reader), writer));
    session.run().await
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn seconds(value: Option<f64>) -> Result<Option<Duration>> {
    value
        .map(|s| {
            Duration::try_from_secs_f64(s)
                .map_err(|e| RunnerError::failed(format!("invalid timeout {s}: {e}")))
        })
        .transpose()
}

struct Session {
    comms: TcpComms,
    child: Option<ChildProcess>,
    monitor: Option<MonitorThread>,
    cpu: CpuCollector,
    running: bool,
}

impl Session {
    fn new(comms: TcpComms) -> Self {
        Self {
            comms,
            child: None,
            monitor: None,
            cpu: CpuCollector::new(),
            running: true,
        }
    }

    async fn run(&mut self) -> Result<()> {
        let result = self.receive_loop().await;
        if let Err(e) = &result {
            self.report(e).await;
        }
        self.comms.close().await;
        self.shutdown().await;
        result
    }

    async fn receive_loop(&mut self) -> Result<()> {
        while self.running {
            let frame = self.comms.recv().await?;
            let call = Call::from_frame(frame)?;
            let rv = self.dispatch(&call).await?;
            self.comms.send(&Frame::ok(rv)).await?;
        }
        Ok(())
    }

    /// Best-effort error reply carrying the offending frame.
    async fn report(&mut self, e: &RunnerError) {
        error!("exception occurred: {e}");
        let message = match e {
            RunnerError::Protocol { .. } => e.to_string(),
            _ => format!(
                "{e}\nduring handling of message:\n{}",
                self.comms.last_frame()
            ),
        };
        if let Err(send_err) = self.comms.send(&Frame::error(message, e.payload())).await {
            debug!(error = %send_err, "Could not send error reply");
        }
    }

    async fn shutdown(&mut self) {
        if let Some(mut monitor) = self.monitor.take() {
            let _ = tokio::task::spawn_blocking(move || monitor.stop()).await;
        }
        if let Some(child) = self.child.as_mut()
            && let Err(e) = child.kill().await
        {
            warn!(error = %e, "Failed to kill child on shutdown");
        }
    }

    fn child(&mut self) -> Result<&mut ChildProcess> {
        self.child
            .as_mut()
            .ok_or_else(|| RunnerError::failed("no process was running"))
    }

    async fn dispatch(&mut self, call: &Call) -> Result<Value> {
        debug!(method = %call.method, "Dispatching");
        match call.method {
            Method::GetPids => to_value(self.get_pids()),
            Method::RunnerExit => {
                self.running = false;
                Ok(Value::Null)
            }
            Method::Run => self.run_child(call.params()?).await,
            Method::Poll => self.poll(call.params()?).await,
            Method::ProcCommunicate => {
                let params: CommunicateParams = call.params()?;
                let output = self.child()?.communicate(seconds(params.timeout)?).await?;
                Ok(match output {
                    Some((stdout, stderr)) => json!([stdout, stderr]),
                    None => json!([null, null]),
                })
            }
            Method::Wait => to_value(self.wait(call.params()?).await?),
            Method::Kill => {
                self.child()?.kill().await?;
                info!("OK!");
                Ok(Value::Null)
            }
            Method::ReadOutputLine => to_value(self.child()?.read_output_line().await),
            Method::GetCpuPercentage => to_value(self.cpu.sample()?),
            Method::StartMonitoring => self.start_monitoring(call.params()?).await,
            Method::StopMonitoring => self.stop_monitoring().await,
            Method::HasFile => {
                let params: HasFileParams = call.params()?;
                to_value(params.path.is_file())
            }
            Method::Close => Err(RunnerError::WrongRole {
                method: call.method.name().to_string(),
                role: "client",
                other: "server",
            }),
        }
    }

    fn get_pids(&self) -> Vec<u32> {
        let Some(child) = self.child.as_ref() else {
            return Vec::new();
        };
        match process_tree(child.pid()) {
            Ok(pids) => pids,
            Err(TelemetryError::NoSuchProcess(_)) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "Could not list child processes");
                Vec::new()
            }
        }
    }

    async fn run_child(&mut self, params: RunParams) -> Result<Value> {
        if let Some(child) = self.child.as_mut()
            && child.is_alive()?
        {
            return Err(RunnerError::failed("already running a process"));
        }

        let command = CommandLine::try_from(params.cmd)?;
        self.child = Some(ChildProcess::spawn(command, &params.env)?);
        // Start the CPU measurement window reported by `wait`.
        self.cpu.sample()?;

        if !params.wait {
            return Ok(Value::Null);
        }
        let result = self
            .wait(WaitParams {
                allow_error: params.allow_error,
                ..WaitParams::default()
            })
            .await?;
        to_value(result)
    }

    async fn poll(&mut self, params: PollParams) -> Result<Value> {
        let child = self.child()?;
        let code = child.poll()?;
        if params.expect_alive
            && let Some(rv) = code
        {
            let (stdout, stderr) = child.communicate(None).await?.unwrap_or_default();
            return Err(RunnerError::failed(format!(
                "process has exited already ({rv})\nstdout: {stdout}\nstderr: {stderr}"
            )));
        }
        to_value(code)
    }

    async fn wait(&mut self, params: WaitParams) -> Result<WaitResult> {
        let timeout = seconds(params.timeout)?;
        let child = self.child()?;

        let mut result = WaitResult {
            rv: child.wait(timeout).await?,
            ..WaitResult::default()
        };
        if params.output
            && child.poll()?.is_some()
            && let Some((stdout, stderr)) = child.communicate(timeout).await?
        {
            result.stdout = Some(stdout);
            result.stderr = Some(stderr);
        }
        let code = child.poll()?;
        if params.stats {
            result.cpu_percentage = Some(self.cpu.sample()?);
        }

        if !params.allow_error
            && let Some(code) = code
            && code != 0
        {
            let payload = match to_value(&result)? {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            return Err(RunnerError::Failed {
                message: "process exited with error".to_string(),
                payload,
            });
        }
        Ok(result)
    }

    async fn start_monitoring(&mut self, params: MonitorParams) -> Result<Value> {
        let interval = seconds(Some(params.interval))?.unwrap_or_default();
        if interval.is_zero() {
            return Err(RunnerError::failed("monitoring interval must be positive"));
        }
        if let Some(mut old) = self.monitor.take() {
            debug!("Discarding previous monitor");
            let _ = tokio::task::spawn_blocking(move || old.stop()).await;
        }
        let pids = self.get_pids();
        self.monitor = Some(MonitorThread::start(interval, pids, params.stats.as_slice())?);
        Ok(Value::Null)
    }

    async fn stop_monitoring(&mut self) -> Result<Value> {
        let mut monitor = self
            .monitor
            .take()
            .ok_or_else(|| RunnerError::failed("no monitoring thread"))?;
        let stopped = tokio::task::spawn_blocking(move || {
            let result = monitor.stop();
            (result, monitor.into_series())
        })
        .await
        .map_err(|e| RunnerError::failed(format!("monitor join failed: {e}")))?;

        let (result, series) = stopped;
        result?;
        to_value(series)
    }
}
