#![cfg(unix)]
//! Local process pool tests.
//!
//! These run real `sh` subprocesses through a pool and check output capture,
//! admission control and callback dispatch.

use brun_pool::{
    Callbacks, ClusterBackend, Disposition, Job, JobRequest, LocalBackend, Pool, PoolError,
    PoolSettings,
};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tracing::{Level, info};

static INIT: Once = Once::new();

fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

fn settings() -> PoolSettings {
    PoolSettings {
        poll_interval: Duration::from_millis(10),
        ..PoolSettings::default()
    }
}

fn sh(script: &str, jobid: &str, outfile: impl Into<std::path::PathBuf>) -> JobRequest {
    JobRequest::new(
        brun_common::CommandLine::from_args(["sh", "-c", script]).unwrap(),
        jobid,
        outfile,
    )
}

#[derive(Debug, Clone)]
struct Seen {
    jobid: String,
    code: Option<i32>,
    output: String,
}

impl Seen {
    fn of(job: &Job) -> Self {
        Self {
            jobid: job.jobid.clone(),
            code: job.exit_code(),
            output: job.output.clone(),
        }
    }
}

/// Callbacks recording every finished job into two lists.
fn recorder() -> (Callbacks, Arc<Mutex<Vec<Seen>>>, Arc<Mutex<Vec<Seen>>>) {
    let ok = Arc::new(Mutex::new(Vec::new()));
    let failed = Arc::new(Mutex::new(Vec::new()));
    let callbacks = Callbacks::none()
        .on_success({
            let ok = Arc::clone(&ok);
            move |job| {
                ok.lock().unwrap().push(Seen::of(job));
                Disposition::Log
            }
        })
        .on_error({
            let failed = Arc::clone(&failed);
            move |job| {
                failed.lock().unwrap().push(Seen::of(job));
                Disposition::Log
            }
        });
    (callbacks, ok, failed)
}

#[test]
fn test_replicas_get_suffixed_outfiles() {
    init_test_logging();
    info!("TEST START: test_replicas_get_suffixed_outfiles");
    let dir = tempfile::tempdir().unwrap();
    let pool = Pool::new(LocalBackend, None, settings());
    let (callbacks, ok, failed) = recorder();

    let handles = pool
        .run(
            sh("echo replica", "build", dir.path().join("out/build.log")).cost(3),
            callbacks,
        )
        .unwrap();
    pool.wait_all();

    let jobids: Vec<_> = handles.iter().map(|h| h.jobid.as_str()).collect();
    assert_eq!(jobids, ["build-0", "build-1", "build-2"]);
    for (i, handle) in handles.iter().enumerate() {
        let expected = dir.path().join(format!("out/build.log-{i}"));
        assert_eq!(handle.outfiles, [expected.clone()]);
        assert_eq!(std::fs::read_to_string(&expected).unwrap(), "replica\n");
    }
    assert_eq!(ok.lock().unwrap().len(), 3);
    assert!(failed.lock().unwrap().is_empty());
    assert_eq!(pool.active_jobs(), 0);
    assert_eq!(pool.in_use(), 0);
    info!("TEST PASS: test_replicas_get_suffixed_outfiles");
}

#[test]
fn test_admission_serializes_jobs() {
    init_test_logging();
    info!("TEST START: test_admission_serializes_jobs");
    let dir = tempfile::tempdir().unwrap();
    let lock = dir.path().join("lock");
    let pool = Pool::new(LocalBackend, Some(1), settings());
    let (callbacks, ok, failed) = recorder();

    // mkdir fails if another job still holds the lock directory.
    let script = format!(
        "mkdir {0} || exit 1; sleep 0.1; rmdir {0}",
        lock.display()
    );
    for i in 0..3 {
        pool.run(
            sh(&script, &format!("job{i}"), dir.path().join(format!("job{i}.log"))),
            callbacks.clone(),
        )
        .unwrap();
        assert!(pool.in_use() <= 1);
    }
    pool.wait_all();

    assert!(failed.lock().unwrap().is_empty(), "jobs overlapped: {:?}", failed.lock().unwrap());
    assert_eq!(ok.lock().unwrap().len(), 3);
    info!("TEST PASS: test_admission_serializes_jobs");
}

#[test]
fn test_failing_job_reports_status_and_output() {
    init_test_logging();
    info!("TEST START: test_failing_job_reports_status_and_output");
    let dir = tempfile::tempdir().unwrap();
    let pool = Pool::new(LocalBackend, Some(4), settings());
    let (callbacks, ok, failed) = recorder();

    pool.run(
        sh("echo to-stdout; echo to-stderr >&2; exit 3", "broken", dir.path().join("broken.log")),
        callbacks,
    )
    .unwrap();
    pool.wait_all();

    assert!(ok.lock().unwrap().is_empty());
    let failed = failed.lock().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].jobid, "broken");
    assert_eq!(failed[0].code, Some(3));
    assert!(failed[0].output.contains("to-stdout"));
    assert!(failed[0].output.contains("to-stderr"));

    let file = std::fs::read_to_string(dir.path().join("broken.log")).unwrap();
    assert!(file.contains("to-stdout") && file.contains("to-stderr"));
    info!("TEST PASS: test_failing_job_reports_status_and_output");
}

#[test]
fn test_killed_job_reports_negative_signal() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let pool = Pool::new(LocalBackend, None, settings());
    let (callbacks, _ok, failed) = recorder();

    pool.run(sh("kill -9 $$", "suicide", dir.path().join("s.log")), callbacks)
        .unwrap();
    pool.wait_all();

    let failed = failed.lock().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].code, Some(-9));
}

#[test]
fn test_suppressing_callback_still_completes() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let pool = Pool::new(LocalBackend, None, settings());
    let calls = Arc::new(Mutex::new(0));

    let callbacks = Callbacks::none().on_error({
        let calls = Arc::clone(&calls);
        move |_| {
            *calls.lock().unwrap() += 1;
            Disposition::Suppress
        }
    });
    pool.run(sh("exit 1", "quiet", dir.path().join("quiet.log")), callbacks)
        .unwrap();
    pool.wait_all();

    assert_eq!(*calls.lock().unwrap(), 1);
    assert_eq!(pool.active_jobs(), 0);
}

#[test]
fn test_panicking_callback_does_not_wedge_pool() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let pool = Pool::new(LocalBackend, Some(1), settings());

    let callbacks = Callbacks::none().on_success(|_| panic!("callback bug"));
    pool.run(sh("true", "first", dir.path().join("a.log")), callbacks)
        .unwrap();
    let (callbacks, ok, _failed) = recorder();
    pool.run(sh("true", "second", dir.path().join("b.log")), callbacks)
        .unwrap();
    pool.wait_all();

    assert_eq!(ok.lock().unwrap().len(), 1);
    assert_eq!(pool.in_use(), 0);
}

#[test]
fn test_large_output_is_captured_completely() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let pool = Pool::new(LocalBackend, None, settings());
    let (callbacks, ok, _failed) = recorder();

    pool.run(
        sh("seq 1 20000", "seq", dir.path().join("seq.log")),
        callbacks,
    )
    .unwrap();
    pool.wait_all();

    let ok = ok.lock().unwrap();
    let lines: Vec<_> = ok[0].output.lines().collect();
    assert_eq!(lines.len(), 20000);
    assert_eq!(lines.last(), Some(&"20000"));
}

#[test]
fn test_rejected_requests() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();

    let pool = Pool::new(LocalBackend, Some(2), settings());
    let err = pool
        .run(sh("true", "none", dir.path().join("n.log")).cost(0), Callbacks::none())
        .unwrap_err();
    assert!(matches!(err, PoolError::ZeroCost { .. }));

    let err = pool
        .run(
            JobRequest::new(
                brun_common::CommandLine::parse("/nonexistent/brun-test-binary").unwrap(),
                "missing",
                dir.path().join("m.log"),
            ),
            Callbacks::none(),
        )
        .unwrap_err();
    assert!(matches!(err, PoolError::Spawn { .. }));
    assert_eq!(pool.in_use(), 0);

    let cluster = Pool::new(ClusterBackend::new("prun", vec![], 900), Some(2), settings());
    let err = cluster
        .run(sh("true", "big", dir.path().join("big.log")).cost(3), Callbacks::none())
        .unwrap_err();
    assert!(matches!(
        err,
        PoolError::CostExceedsLimit { cost: 3, max: 2, .. }
    ));
}

#[test]
fn test_env_and_cwd_are_applied() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let pool = Pool::new(LocalBackend, None, settings());
    let (callbacks, ok, _failed) = recorder();

    let request = sh("echo $BRUN_TEST_PATH; pwd", "env", dir.path().join("env.log"))
        .env("BRUN_TEST_PATH", vec!["/a".to_string(), "/b".to_string()])
        .cwd(dir.path());
    pool.run(request, callbacks).unwrap();
    pool.wait_all();

    let ok = ok.lock().unwrap();
    let mut lines = ok[0].output.lines();
    assert_eq!(lines.next(), Some("/a:/b"));
    let cwd = std::path::PathBuf::from(lines.next().unwrap());
    assert_eq!(cwd.canonicalize().unwrap(), dir.path().canonicalize().unwrap());
}
