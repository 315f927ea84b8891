//! Jobs submitted to a batch cluster scheduler (`prun`-style).
//!
//! One scheduler invocation per request reserves `cost` machines. The
//! scheduler announces its reservation on stdout:
//!
//! ```text
//! Reservation number 4711: Reserved 2 hosts for 900 seconds
//! Run on 2 hosts for 900 seconds from Mon Jan  1 12:00:00
//! : node003/0 node004/0
//! ```
//!
//! The whole output is re-parsed on every update until the node list is
//! complete, at which point the job counts as started.

use super::{Backend, build_command};
use crate::error::{PoolError, Result};
use crate::job::{Job, JobRequest, with_suffix};
use crate::pool::{LaunchSpec, Launcher};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Instant;
use tracing::{debug, info};

static NODE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^node(\d+)/(\d+)$").expect("valid node token regex"));
static DURATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"for (\d+) seconds").expect("valid duration regex"));

/// What the scheduler has announced so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schedule {
    /// Assigned `(machine, core)` pairs.
    pub nodes: Vec<(u32, u32)>,
    /// Reservation length.
    pub seconds: Option<u64>,
}

/// Parse the complete lines of scheduler output.
///
/// Returns `None` if a node line is malformed, which happens when a line is
/// only partially written; the caller retries on the next update.
pub fn parse_schedule(output: &str) -> Option<Schedule> {
    let complete = match output.rfind('\n') {
        Some(end) => &output[..end],
        None => "",
    };

    let mut schedule = Schedule::default();
    for line in complete.lines() {
        if let Some(tokens) = line.strip_prefix(':') {
            for token in tokens.split_whitespace() {
                let caps = NODE_TOKEN.captures(token)?;
                let machine = caps[1].parse().ok()?;
                let core = caps[2].parse().ok()?;
                schedule.nodes.push((machine, core));
            }
        } else if schedule.seconds.is_none()
            && let Some(caps) = DURATION.captures(line)
        {
            schedule.seconds = caps[1].parse().ok();
        }
    }
    Some(schedule)
}

type Group = (Vec<u32>, Vec<u32>);

/// Merge sorted nodes into runs of consecutive cores on one machine, or of
/// consecutive machines on the same single core.
fn group_nodes(nodes: &[(u32, u32)]) -> Vec<Group> {
    let mut sorted = nodes.to_vec();
    sorted.sort_unstable();
    let mut groups: Vec<Group> = sorted.into_iter().map(|(m, c)| (vec![m], vec![c])).collect();

    for i in (1..groups.len()).rev() {
        let (left, right) = groups.split_at_mut(i);
        let (lmachines, lcores) = &mut left[i - 1];
        let (rmachines, rcores) = &right[0];

        let same_machine_next_core = lmachines == rmachines && last(lcores) + 1 == rcores[0];
        let next_machine_same_core =
            lcores.len() == 1 && last(lmachines) + 1 == rmachines[0] && lcores == rcores;

        if same_machine_next_core {
            lcores.extend_from_slice(rcores);
        } else if next_machine_same_core {
            lmachines.extend_from_slice(rmachines);
        } else {
            continue;
        }
        groups.remove(i);
    }
    groups
}

fn last(values: &[u32]) -> u32 {
    values.last().copied().unwrap_or_default()
}

fn join_range(values: &[u32], pad: bool) -> String {
    let fmt = |v: u32| if pad { format!("{v:03}") } else { v.to_string() };
    match values {
        [] => String::new(),
        [only] => fmt(*only),
        [first, .., end] => format!("{}-{}", fmt(*first), fmt(*end)),
    }
}

/// Compact node list, e.g. `node003`, `node[003-005]`, `node[003/0-1]`.
pub fn format_nodes(nodes: &[(u32, u32)]) -> String {
    let groups = group_nodes(nodes);
    let all_core_zero = groups.iter().all(|(_, cores)| cores.iter().all(|&c| c == 0));

    let parts: Vec<String> = groups
        .iter()
        .map(|(machines, cores)| {
            if all_core_zero {
                join_range(machines, true)
            } else {
                format!("{}/{}", join_range(machines, true), join_range(cores, false))
            }
        })
        .collect();

    if let [(machines, cores)] = groups.as_slice()
        && machines.len() == 1
        && cores.len() == 1
    {
        return format!("node{}", parts[0]);
    }
    format!("node[{}]", parts.join(","))
}

#[derive(Debug, Default)]
pub struct ClusterJobState {
    logged: bool,
}

#[derive(Debug, Clone)]
pub struct ClusterBackend {
    scheduler: String,
    extra_opts: Vec<String>,
    default_reservation_secs: u64,
}

impl ClusterBackend {
    pub fn new(scheduler: impl Into<String>, extra_opts: Vec<String>, default_reservation_secs: u64) -> Self {
        Self {
            scheduler: scheduler.into(),
            extra_opts,
            default_reservation_secs,
        }
    }

    pub fn scheduler(&self) -> &str {
        &self.scheduler
    }

    /// The scheduler command line wrapping `request`.
    pub fn scheduler_argv(&self, request: &JobRequest) -> Vec<String> {
        let mut prefix = vec![
            self.scheduler.clone(),
            "-v".to_string(),
            "-np".to_string(),
            request.cost.to_string(),
            "-1".to_string(),
            "-o".to_string(),
            request.outfile.to_string_lossy().into_owned(),
        ];
        prefix.extend(self.extra_opts.iter().cloned());
        request.command.wrapped(prefix).argv().to_vec()
    }

    fn require_scheduler(&self) -> Result<()> {
        which::which(&self.scheduler)
            .map(|path| debug!(scheduler = %path.display(), "Found cluster scheduler"))
            .map_err(|_| PoolError::MissingProgram {
                program: self.scheduler.clone(),
            })
    }

    fn summary(&self, jobid: &str, schedule: &Schedule) -> String {
        let mut line = format!("running {jobid} on {}", format_nodes(&schedule.nodes));
        if let Some(seconds) = schedule.seconds
            && seconds != self.default_reservation_secs
        {
            line.push_str(&format!(" for {seconds} seconds"));
        }
        line
    }
}

impl Backend for ClusterBackend {
    type State = ClusterJobState;
    type Options = ();

    fn name(&self) -> &'static str {
        "prun"
    }

    fn admission_units(&self, request: &JobRequest) -> usize {
        request.cost
    }

    fn make_jobs(
        &self,
        request: &JobRequest,
        _options: (),
        launcher: &mut Launcher<'_, ClusterJobState>,
    ) -> Result<()> {
        self.require_scheduler()?;
        let reservation = launcher.reserve(request.cost);
        info!("scheduling {}", request.jobid);

        let argv = self.scheduler_argv(request);
        let outfiles = (0..request.cost)
            .map(|i| with_suffix(&request.outfile, &format!(".{i}")))
            .collect();
        let job = Job::new(request.jobid.clone(), request.command.clone(), request.cost, outfiles);

        launcher.launch(LaunchSpec {
            command: build_command(&argv, request),
            job,
            state: ClusterJobState::default(),
            capture: None,
            reservation,
        })?;
        Ok(())
    }

    fn process_output(&self, job: &mut Job, state: &mut ClusterJobState) {
        if state.logged {
            return;
        }
        let Some(schedule) = parse_schedule(&job.output) else {
            return;
        };
        if schedule.nodes.len() == job.cost {
            info!("{}", self.summary(&job.jobid, &schedule));
            job.start_time = Some(Instant::now());
            state.logged = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brun_common::CommandLine;

    #[test]
    fn test_parse_nodes_and_duration() {
        println!("TEST START: test_parse_nodes_and_duration");
        let schedule = parse_schedule(":node3/0 node3/1\nrunning for 120 seconds\n").unwrap();
        assert_eq!(schedule.nodes, vec![(3, 0), (3, 1)]);
        assert_eq!(schedule.seconds, Some(120));
        println!("TEST PASS: test_parse_nodes_and_duration");
    }

    #[test]
    fn test_parse_malformed_node_line() {
        println!("TEST START: test_parse_malformed_node_line");
        // Partial line: nothing complete yet.
        let partial = parse_schedule(":node3/x");
        assert!(partial.is_none_or(|s| s.nodes.is_empty()));
        // Complete but malformed line: abort this round entirely.
        assert_eq!(parse_schedule(":node3/0 node3/x\n"), None);
        println!("TEST PASS: test_parse_malformed_node_line");
    }

    #[test]
    fn test_parse_ignores_incomplete_last_line() {
        println!("TEST START: test_parse_ignores_incomplete_last_line");
        let schedule = parse_schedule("Run on 2 hosts for 900 seconds\n: node003/0 node0").unwrap();
        assert!(schedule.nodes.is_empty());
        assert_eq!(schedule.seconds, Some(900));

        let schedule =
            parse_schedule("Run on 2 hosts for 900 seconds\n: node003/0 node004/0\n").unwrap();
        assert_eq!(schedule.nodes, vec![(3, 0), (4, 0)]);
        println!("TEST PASS: test_parse_ignores_incomplete_last_line");
    }

    #[test]
    fn test_first_duration_wins() {
        let schedule = parse_schedule("for 60 seconds\nfor 30 seconds\n").unwrap();
        assert_eq!(schedule.seconds, Some(60));
    }

    #[test]
    fn test_format_nodes() {
        println!("TEST START: test_format_nodes");
        assert_eq!(format_nodes(&[(3, 0)]), "node003");
        assert_eq!(format_nodes(&[(3, 1)]), "node003/1");
        assert_eq!(format_nodes(&[(3, 0), (3, 1)]), "node[003/0-1]");
        assert_eq!(format_nodes(&[(5, 0), (3, 0), (4, 0)]), "node[003-005]");
        assert_eq!(format_nodes(&[(3, 0), (5, 0)]), "node[003,005]");
        assert_eq!(
            format_nodes(&[(3, 0), (3, 1), (7, 0), (7, 1)]),
            "node[003/0-1,007/0-1]"
        );
        assert_eq!(format_nodes(&[(3, 1), (4, 1)]), "node[003-004/1]");
        println!("TEST PASS: test_format_nodes");
    }

    #[test]
    fn test_scheduler_argv() {
        let backend = ClusterBackend::new("prun", vec!["-t".into(), "30:00".into()], 900);
        let request = JobRequest::new(
            CommandLine::parse("./bench --size large").unwrap(),
            "spec",
            "/tmp/results/spec.out",
        )
        .cost(4);
        assert_eq!(
            backend.scheduler_argv(&request),
            [
                "prun", "-v", "-np", "4", "-1", "-o", "/tmp/results/spec.out", "-t", "30:00",
                "./bench", "--size", "large"
            ]
        );
        assert_eq!(backend.admission_units(&request), 4);
    }

    #[test]
    fn test_summary_hides_default_reservation() {
        let backend = ClusterBackend::new("prun", vec![], 900);
        let default = Schedule {
            nodes: vec![(3, 0), (4, 0)],
            seconds: Some(900),
        };
        assert_eq!(backend.summary("spec", &default), "running spec on node[003-004]");

        let long = Schedule {
            seconds: Some(3600),
            ..default
        };
        assert_eq!(
            backend.summary("spec", &long),
            "running spec on node[003-004] for 3600 seconds"
        );
    }

    #[test]
    fn test_process_output_marks_start_once() {
        let backend = ClusterBackend::new("prun", vec![], 900);
        let mut job = Job::new(
            "spec".into(),
            CommandLine::parse("true").unwrap(),
            2,
            vec![],
        );
        let mut state = ClusterJobState::default();

        job.output.push_str(": node003/0\n");
        backend.process_output(&mut job, &mut state);
        assert!(job.start_time.is_none());

        job.output.push_str(": node004/0\n");
        backend.process_output(&mut job, &mut state);
        let started = job.start_time;
        assert!(started.is_some());
        assert!(state.logged);

        job.output.push_str("more output\n");
        backend.process_output(&mut job, &mut state);
        assert_eq!(job.start_time, started);
    }

    #[test]
    fn test_missing_scheduler() {
        let backend = ClusterBackend::new("definitely-not-a-scheduler-binary", vec![], 900);
        assert!(matches!(
            backend.require_scheduler(),
            Err(PoolError::MissingProgram { .. })
        ));
    }
}
