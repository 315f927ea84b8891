//! Background sampling of system and process statistics.
//!
//! A [`MonitorThread`] samples once at start, once per interval, and once more
//! when stopped. Errors on the sampling thread end the loop and are handed to
//! whoever calls [`MonitorThread::stop`].

use crate::collect::TelemetryError;
use crate::collect::cpu::CpuCollector;
use crate::collect::process::{MemoryUsage, ProcessCpuTracker, ProcStat};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A statistic the monitor can record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stat {
    /// Seconds since monitoring started.
    Time,
    /// Whole-system CPU utilisation.
    Cpu,
    /// CPU utilisation summed over the monitored processes.
    CpuProc,
    /// Resident memory summed over the monitored processes.
    Rss,
    /// Virtual memory summed over the monitored processes.
    Vms,
}

impl Stat {
    pub const ALL: [Stat; 5] = [Stat::Time, Stat::Cpu, Stat::CpuProc, Stat::Rss, Stat::Vms];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stat::Time => "time",
            Stat::Cpu => "cpu",
            Stat::CpuProc => "cpu-proc",
            Stat::Rss => "rss",
            Stat::Vms => "vms",
        }
    }

    /// Whether this statistic is aggregated over the target processes.
    pub fn is_per_process(&self) -> bool {
        matches!(self, Stat::CpuProc | Stat::Rss | Stat::Vms)
    }

    /// Parse a list of stat names, rejecting unknown ones all at once.
    pub fn parse_list<S: AsRef<str>>(names: &[S]) -> Result<BTreeSet<Stat>, TelemetryError> {
        let mut stats = BTreeSet::new();
        let mut unsupported = Vec::new();
        for name in names {
            match name.as_ref().parse::<Stat>() {
                Ok(stat) => {
                    stats.insert(stat);
                }
                Err(_) => unsupported.push(name.as_ref().to_string()),
            }
        }
        if unsupported.is_empty() {
            Ok(stats)
        } else {
            Err(TelemetryError::UnsupportedStat(unsupported.join(", ")))
        }
    }
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stat::ALL
            .into_iter()
            .find(|stat| stat.as_str() == s)
            .ok_or_else(|| TelemetryError::UnsupportedStat(s.to_string()))
    }
}

/// One recorded value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Sample {
    Bytes(u64),
    Value(f64),
}

impl Sample {
    pub fn as_f64(&self) -> f64 {
        match *self {
            Sample::Bytes(b) => b as f64,
            Sample::Value(v) => v,
        }
    }
}

/// Recorded samples per statistic, one entry per tick.
pub type Series = BTreeMap<Stat, Vec<Sample>>;

struct Sampler {
    stats: BTreeSet<Stat>,
    pids: Vec<u32>,
    started: Instant,
    cpu: CpuCollector,
    proc_cpu: ProcessCpuTracker,
    series: Series,
}

impl Sampler {
    fn sample(&mut self) -> Result<(), TelemetryError> {
        for stat in &self.stats {
            let value = match stat {
                Stat::Time => Sample::Value(self.started.elapsed().as_secs_f64()),
                Stat::Cpu => Sample::Value(self.cpu.sample()?),
                // Per-process stats are added below in one pass.
                _ => continue,
            };
            self.series.entry(*stat).or_default().push(value);
        }

        if self.stats.iter().any(Stat::is_per_process) {
            let mut cpu_proc = 0.0;
            let mut memory = MemoryUsage::default();
            for &pid in &self.pids {
                if self.stats.contains(&Stat::CpuProc) {
                    cpu_proc += self.proc_cpu.sample(pid)?;
                }
                if self.stats.contains(&Stat::Rss) || self.stats.contains(&Stat::Vms) {
                    let usage = MemoryUsage::read(pid)?;
                    memory.rss = memory.rss.saturating_add(usage.rss);
                    memory.vms = memory.vms.saturating_add(usage.vms);
                }
            }
            for stat in self.stats.iter().filter(|s| s.is_per_process()) {
                let value = match stat {
                    Stat::CpuProc => Sample::Value(cpu_proc),
                    Stat::Rss => Sample::Bytes(memory.rss),
                    _ => Sample::Bytes(memory.vms),
                };
                self.series.entry(*stat).or_default().push(value);
            }
        }
        Ok(())
    }

    fn run(mut self, interval: Duration, stop: mpsc::Receiver<()>) -> (Series, Option<TelemetryError>) {
        let result = (|| {
            self.sample()?;
            loop {
                match stop.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => self.sample()?,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            self.sample()
        })();

        if let Err(ref e) = result {
            warn!(error = %e, "Monitoring stopped early");
        }
        (self.series, result.err())
    }
}

/// A running (or finished) statistics sampler.
pub struct MonitorThread {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<(Series, Option<TelemetryError>)>>,
    series: Series,
}

impl MonitorThread {
    /// Start sampling `stats` (plus `time`, always) every `interval`,
    /// aggregating per-process statistics over `pids`.
    pub fn start<S: AsRef<str>>(
        interval: Duration,
        pids: Vec<u32>,
        stats: &[S],
    ) -> Result<Self, TelemetryError> {
        let mut stats = Stat::parse_list(stats)?;
        stats.insert(Stat::Time);

        // Fail now rather than on the first tick.
        for &pid in &pids {
            ProcStat::read(pid)?;
        }

        let names = stats.iter().map(Stat::as_str).collect::<Vec<_>>().join(",");
        let sampler = Sampler {
            series: stats.iter().map(|s| (*s, Vec::new())).collect(),
            stats,
            pids,
            started: Instant::now(),
            cpu: CpuCollector::new(),
            proc_cpu: ProcessCpuTracker::new(),
        };

        let (stop_tx, stop_rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("brun-monitor".to_string())
            .spawn(move || sampler.run(interval, stop_rx))
            .map_err(TelemetryError::ThreadSpawn)?;

        info!(
            interval_ms = interval.as_millis() as u64,
            stats = %names,
            "Monitoring started"
        );

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
            series: Series::new(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Stop sampling and wait for the thread.
    ///
    /// Returns the error that ended sampling early, if any. Calling this again
    /// is a no-op.
    pub fn stop(&mut self) -> Result<(), TelemetryError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        if let Some(tx) = self.stop_tx.take() {
            // The thread may already have exited on error.
            let _ = tx.send(());
        }

        let (series, error) = handle.join().map_err(|_| TelemetryError::SamplerPanicked)?;
        self.series = series;
        debug!(
            ticks = self.series.get(&Stat::Time).map_or(0, Vec::len),
            "Monitoring stopped"
        );
        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Samples recorded so far; populated by [`stop`](Self::stop).
    pub fn series(&self) -> &Series {
        &self.series
    }

    pub fn into_series(mut self) -> Series {
        std::mem::take(&mut self.series)
    }
}

impl Drop for MonitorThread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.stop();
        }
    }
}
