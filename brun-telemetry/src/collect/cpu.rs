//! Whole-system CPU utilisation from /proc/stat.
//!
//! /proc/stat only has cumulative tick counters, so utilisation is always a
//! delta between two snapshots. [`CpuCollector`] keeps the previous snapshot.

use super::{TelemetryError, read_proc_file};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

const PROC_STAT: &str = "/proc/stat";

/// Aggregate CPU tick counters (the `cpu` line of /proc/stat).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    pub fn read_from_proc() -> Result<Self, TelemetryError> {
        let content = read_proc_file(PROC_STAT)?;
        Self::parse(&content)
    }

    /// Parse the aggregate `cpu ` line.
    ///
    /// ```text
    /// cpu  4705 356 584 3699 23 23 0 0 0 0
    /// cpu0 1393 280 290 1015 17 9 0 0 0 0
    /// ```
    pub fn parse(content: &str) -> Result<Self, TelemetryError> {
        let line = content
            .lines()
            .find(|l| l.starts_with("cpu "))
            .ok_or_else(|| parse_error("missing aggregate cpu line"))?;

        let values: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .map(|v| v.parse::<u64>())
            .collect::<Result<_, _>>()
            .map_err(|e| parse_error(format!("bad counter in '{line}': {e}")))?;

        if values.len() < 4 {
            return Err(parse_error(format!("too few fields in '{line}'")));
        }
        let field = |i: usize| values.get(i).copied().unwrap_or(0);

        Ok(Self {
            user: field(0),
            nice: field(1),
            system: field(2),
            idle: field(3),
            iowait: field(4),
            irq: field(5),
            softirq: field(6),
            steal: field(7),
        })
    }

    /// Ticks spent idle (idle + iowait).
    pub fn idle_total(&self) -> u64 {
        self.idle.saturating_add(self.iowait)
    }

    pub fn total(&self) -> u64 {
        [
            self.user,
            self.nice,
            self.system,
            self.idle,
            self.iowait,
            self.irq,
            self.softirq,
            self.steal,
        ]
        .iter()
        .fold(0u64, |acc, v| acc.saturating_add(*v))
    }

    /// Busy percentage (0-100) between an earlier and a later snapshot.
    pub fn percent_since(&self, prev: &CpuTimes) -> f64 {
        let total = self.total().saturating_sub(prev.total());
        if total == 0 {
            return 0.0;
        }
        let idle = self.idle_total().saturating_sub(prev.idle_total());
        let busy = total.saturating_sub(idle);
        busy as f64 * 100.0 / total as f64
    }
}

fn parse_error(detail: impl Into<String>) -> TelemetryError {
    TelemetryError::ParseError {
        path: PathBuf::from(PROC_STAT),
        detail: detail.into(),
    }
}

/// System CPU utilisation sampler.
///
/// Each [`sample`](Self::sample) reports utilisation since the previous call;
/// the first call reports utilisation since boot.
#[derive(Debug, Default)]
pub struct CpuCollector {
    prev: Option<CpuTimes>,
}

impl CpuCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&mut self) -> Result<f64, TelemetryError> {
        let curr = CpuTimes::read_from_proc()?;
        Ok(self.update(curr))
    }

    fn update(&mut self, curr: CpuTimes) -> f64 {
        let prev = self.prev.replace(curr).unwrap_or_default();
        let percent = curr.percent_since(&prev);
        debug!(percent = %format!("{percent:.1}"), "System CPU sampled");
        percent
    }
}
