//! Client side: every call sends one request frame and waits for its reply.

use crate::dispatch::{
    CommunicateParams, HasFileParams, Method, MonitorParams, PollParams, RunParams, WaitParams,
    WaitResult, to_kwargs,
};
use crate::error::{Result, RunnerError};
use crate::protocol::{Comms, Frame};
use brun_telemetry::Series;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::io::ErrorKind;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info};

/// Pause between connection attempts while the server starts up.
pub const CONNECT_RETRY: Duration = Duration::from_millis(500);

pub struct RunnerClient {
    comms: Option<Comms<BufReader<OwnedReadHalf>, OwnedWriteHalf>>,
}

impl RunnerClient {
    /// Connect to a server, retrying refused connections until `timeout`
    /// has passed. Without a timeout the first refusal is returned.
    pub async fn connect(host: &str, port: u16, timeout: Option<Duration>) -> Result<Self> {
        let started = Instant::now();
        let stream = loop {
            match TcpStream::connect((host, port)).await {
                Ok(stream) => break stream,
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                    if timeout.is_none_or(|limit| started.elapsed() > limit) {
                        return Err(e.into());
                    }
                    debug!(host, port, "Runner not up yet, retrying");
                    tokio::time::sleep(CONNECT_RETRY).await;
                }
                Err(e) => return Err(e.into()),
            }
        };
        info!(host, port, "Connected to runner");

        let (reader, writer) = stream.into_split();
        Ok(Self {
            comms: Some(Comms::new(BufReader::new(reader), writer)),
        })
    }

    /// Send one request and return the `rv` of the reply.
    pub async fn call(&mut self, method: Method, kwargs: Map<String, Value>) -> Result<Value> {
        let comms = self.comms.as_mut().ok_or(RunnerError::ConnectionClosed)?;
        comms.send(&Frame::call(method.name(), kwargs)).await?;
        comms.recv().await?.into_result()
    }

    async fn call_with<P: Serialize, T: DeserializeOwned>(
        &mut self,
        method: Method,
        params: &P,
    ) -> Result<T> {
        let rv = self.call(method, to_kwargs(params)?).await?;
        Ok(serde_json::from_value(rv)?)
    }

    async fn call_bare<T: DeserializeOwned>(&mut self, method: Method) -> Result<T> {
        let rv = self.call(method, Map::new()).await?;
        Ok(serde_json::from_value(rv)?)
    }

    /// The child and all of its descendants.
    pub async fn get_pids(&mut self) -> Result<Vec<u32>> {
        self.call_bare(Method::GetPids).await
    }

    /// Start a process. With `params.wait` the result of waiting for it is
    /// returned.
    pub async fn run(&mut self, params: &RunParams) -> Result<Option<WaitResult>> {
        self.call_with(Method::Run, params).await
    }

    /// Exit code if the child has exited.
    pub async fn poll(&mut self, expect_alive: bool) -> Result<Option<i32>> {
        self.call_with(Method::Poll, &PollParams { expect_alive }).await
    }

    pub async fn wait(&mut self, params: &WaitParams) -> Result<WaitResult> {
        self.call_with(Method::Wait, params).await
    }

    /// Remaining stdout and stderr, or `None` on timeout.
    pub async fn proc_communicate(
        &mut self,
        timeout: Option<f64>,
    ) -> Result<Option<(String, String)>> {
        let (stdout, stderr): (Option<String>, Option<String>) = self
            .call_with(Method::ProcCommunicate, &CommunicateParams { timeout })
            .await?;
        Ok(stdout.zip(stderr))
    }

    pub async fn kill(&mut self) -> Result<()> {
        self.call(Method::Kill, Map::new()).await.map(drop)
    }

    pub async fn read_output_line(&mut self) -> Result<String> {
        self.call_bare(Method::ReadOutputLine).await
    }

    pub async fn get_cpu_percentage(&mut self) -> Result<f64> {
        self.call_bare(Method::GetCpuPercentage).await
    }

    pub async fn start_monitoring<S: AsRef<str>>(&mut self, interval: f64, stats: &[S]) -> Result<()> {
        let params = MonitorParams {
            interval,
            stats: stats.iter().map(|s| s.as_ref().to_string()).collect(),
        };
        self.call(Method::StartMonitoring, to_kwargs(&params)?)
            .await
            .map(drop)
    }

    pub async fn stop_monitoring(&mut self) -> Result<Series> {
        self.call_bare(Method::StopMonitoring).await
    }

    pub async fn has_file(&mut self, path: impl AsRef<Path>) -> Result<bool> {
        let params = HasFileParams {
            path: path.as_ref().to_path_buf(),
        };
        self.call_with(Method::HasFile, &params).await
    }

    /// Ask the server to stop after replying.
    pub async fn runner_exit(&mut self) -> Result<()> {
        self.call(Method::RunnerExit, Map::new()).await.map(drop)
    }

    /// Stop the server and drop the connection. The client is unusable
    /// afterwards.
    pub async fn close(&mut self) {
        if self.comms.is_none() {
            return;
        }
        match self.runner_exit().await {
            Ok(()) | Err(RunnerError::Remote { .. } | RunnerError::Protocol { .. }) => {}
            Err(e) => debug!(error = %e, "runner_exit failed while closing"),
        }
        if let Some(mut comms) = self.comms.take() {
            comms.close().await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.comms.is_some()
    }
}
