//! Per-process statistics from /proc/<pid>/stat and /proc/<pid>/status.

use super::{TelemetryError, read_proc_file};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, trace};

/// Clock ticks per second used by /proc (USER_HZ, fixed at 100 on Linux).
const USER_HZ: f64 = 100.0;

/// Fields of /proc/<pid>/stat that we care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcStat {
    pub pid: u32,
    pub ppid: u32,
    pub state: char,
    /// User-mode CPU time in clock ticks.
    pub utime: u64,
    /// Kernel-mode CPU time in clock ticks.
    pub stime: u64,
}

impl ProcStat {
    pub fn read(pid: u32) -> Result<Self, TelemetryError> {
        let content = read_pid_file(pid, "stat")?;
        Self::parse(pid, &content)
    }

    /// Parse a /proc/<pid>/stat line.
    ///
    /// The command name is parenthesised and may itself contain spaces or
    /// parentheses, so fields are counted from the last `)`.
    pub fn parse(pid: u32, content: &str) -> Result<Self, TelemetryError> {
        let err = |detail: &str| TelemetryError::ParseError {
            path: pid_path(pid, "stat"),
            detail: detail.to_string(),
        };

        let close = content.rfind(')').ok_or_else(|| err("missing command name"))?;
        let fields: Vec<&str> = content[close + 1..].split_whitespace().collect();
        // fields[0] is field 3 (state) in proc(5) numbering.
        if fields.len() < 13 {
            return Err(err("too few fields"));
        }

        let num = |i: usize| -> Result<u64, TelemetryError> {
            fields[i]
                .parse::<u64>()
                .map_err(|_| err(&format!("bad numeric field '{}'", fields[i])))
        };

        Ok(Self {
            pid,
            ppid: u32::try_from(num(1)?).map_err(|_| err("ppid out of range"))?,
            state: fields[0].chars().next().unwrap_or('?'),
            utime: num(11)?,
            stime: num(12)?,
        })
    }

    pub fn cpu_ticks(&self) -> u64 {
        self.utime.saturating_add(self.stime)
    }
}

/// Memory usage of one process, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub rss: u64,
    pub vms: u64,
}

impl MemoryUsage {
    pub fn read(pid: u32) -> Result<Self, TelemetryError> {
        let content = read_pid_file(pid, "status")?;
        Ok(Self::parse(&content))
    }

    /// Parse `VmRSS`/`VmSize` from /proc/<pid>/status.
    ///
    /// Zombies and kernel threads have neither line and report zero.
    pub fn parse(content: &str) -> Self {
        let mut usage = Self::default();
        for line in content.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let target = match key {
                "VmRSS" => &mut usage.rss,
                "VmSize" => &mut usage.vms,
                _ => continue,
            };
            let kb = value
                .split_whitespace()
                .next()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            *target = kb.saturating_mul(1024);
        }
        usage
    }
}

fn pid_path(pid: u32, file: &str) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/{file}"))
}

fn read_pid_file(pid: u32, file: &str) -> Result<String, TelemetryError> {
    match read_proc_file(pid_path(pid, file)) {
        Err(TelemetryError::ReadError { source, .. }) if source.kind() == ErrorKind::NotFound => {
            Err(TelemetryError::NoSuchProcess(pid))
        }
        other => other,
    }
}

/// Check that a process exists.
pub fn process_exists(pid: u32) -> bool {
    pid_path(pid, "stat").exists()
}

/// All live descendants of `pid` (children, grandchildren, ...), not
/// including `pid` itself, in breadth-first order.
pub fn descendants(pid: u32) -> Result<Vec<u32>, TelemetryError> {
    let entries = std::fs::read_dir("/proc").map_err(|source| TelemetryError::ReadError {
        path: PathBuf::from("/proc"),
        source,
    })?;

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for entry in entries.flatten() {
        let Some(child) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        // Processes can vanish between readdir and read.
        match ProcStat::read(child) {
            Ok(stat) => children.entry(stat.ppid).or_default().push(child),
            Err(e) => trace!(pid = child, error = %e, "Skipping unreadable process"),
        }
    }

    Ok(walk_tree(pid, &children))
}

fn walk_tree(root: u32, children: &HashMap<u32, Vec<u32>>) -> Vec<u32> {
    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if kid != root && !found.contains(&kid) {
                    found.push(kid);
                    queue.push_back(kid);
                }
            }
        }
    }
    found
}

/// `pid` followed by all of its descendants.
pub fn process_tree(pid: u32) -> Result<Vec<u32>, TelemetryError> {
    if !process_exists(pid) {
        return Err(TelemetryError::NoSuchProcess(pid));
    }
    let mut pids = vec![pid];
    pids.extend(descendants(pid)?);
    debug!(root = pid, count = pids.len(), "Collected process tree");
    Ok(pids)
}

/// Per-process CPU utilisation sampler.
///
/// Utilisation is CPU time used since the previous sample of the same pid,
/// relative to wall time, so a process saturating two cores reports 200. The
/// first sample of a pid reports 0.
#[derive(Debug, Default)]
pub struct ProcessCpuTracker {
    prev: HashMap<u32, (u64, Instant)>,
}

impl ProcessCpuTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&mut self, pid: u32) -> Result<f64, TelemetryError> {
        let stat = ProcStat::read(pid)?;
        Ok(self.update(pid, stat.cpu_ticks(), Instant::now()))
    }

    fn update(&mut self, pid: u32, ticks: u64, now: Instant) -> f64 {
        let Some((prev_ticks, prev_time)) = self.prev.insert(pid, (ticks, now)) else {
            return 0.0;
        };
        let wall = now.duration_since(prev_time).as_secs_f64();
        if wall <= 0.0 {
            return 0.0;
        }
        let cpu = ticks.saturating_sub(prev_ticks) as f64 / USER_HZ;
        cpu / wall * 100.0
    }
}
