//! Monitoring real child processes.

use brun_telemetry::{MonitorThread, Stat, descendants, process_tree};
use std::process::{Command, Stdio};
use std::time::Duration;

struct Reaper(std::process::Child);

impl Drop for Reaper {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn spawn_sleeper() -> Reaper {
    Reaper(
        Command::new("sleep")
            .arg("10")
            .stdout(Stdio::null())
            .spawn()
            .expect("sleep should spawn"),
    )
}

#[test]
fn test_children_show_up_as_descendants() {
    let child = spawn_sleeper();
    let pid = child.0.id();

    let ours = descendants(std::process::id()).unwrap();
    assert!(ours.contains(&pid), "{pid} not in {ours:?}");

    let tree = process_tree(pid).unwrap();
    assert_eq!(tree, vec![pid]);
}

#[test]
fn test_monitor_time_and_rss() {
    let child = spawn_sleeper();
    let interval = Duration::from_millis(50);

    let mut monitor = MonitorThread::start(interval, vec![child.0.id()], &["time", "rss"]).unwrap();
    std::thread::sleep(interval * 4);
    monitor.stop().unwrap();

    let series = monitor.into_series();
    let time: Vec<f64> = series[&Stat::Time].iter().map(|s| s.as_f64()).collect();
    assert!(time.len() >= 3, "only {} samples", time.len());
    assert!(time.windows(2).all(|w| w[0] <= w[1]), "time not monotonic: {time:?}");

    let rss = &series[&Stat::Rss];
    assert_eq!(rss.len(), time.len());
    assert!(rss.iter().all(|s| s.as_f64() > 0.0));
}

#[test]
fn test_cpu_proc_over_several_pids() {
    let a = spawn_sleeper();
    let b = spawn_sleeper();

    let mut monitor = MonitorThread::start(
        Duration::from_millis(20),
        vec![a.0.id(), b.0.id()],
        &["cpu-proc", "vms"],
    )
    .unwrap();
    std::thread::sleep(Duration::from_millis(60));
    monitor.stop().unwrap();

    let series = monitor.series();
    assert_eq!(series.len(), 3);
    let cpu = &series[&Stat::CpuProc];
    assert_eq!(cpu.len(), series[&Stat::Time].len());
    // First tick has no previous sample to compare against.
    assert_eq!(cpu[0].as_f64(), 0.0);
}
