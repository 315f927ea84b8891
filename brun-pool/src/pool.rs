//! The pool core shared by every backend.
//!
//! A [`Pool`] owns the job table, admission control and the multiplexer
//! thread. Backends only decide how a request turns into processes (see
//! [`Backend`]); everything after spawn is handled here:
//!
//! - each job's stdout and stderr are registered with the multiplexer
//! - readable streams are drained into the job's output buffer and outfile
//! - once every stream has hung up and the process is reaped, the job is
//!   removed from the table and its callbacks run on the multiplexer thread

use crate::admission::{Admission, Reservation};
use crate::backend::Backend;
use crate::error::{PoolError, Result};
use crate::job::{Callbacks, Disposition, Job, JobHandle, JobRequest};
use crate::multiplexer::{Multiplexer, ReadinessHandler};
use crate::settings::PoolSettings;
use mio::Token;
use mio::unix::pipe::Receiver;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

struct Entry<S> {
    job: Job,
    state: S,
    child: Child,
    streams: Vec<(Token, Receiver)>,
    capture: Option<File>,
    callbacks: Callbacks,
    reservation: Reservation,
}

struct Table<S> {
    next_key: u64,
    jobs: HashMap<u64, Entry<S>>,
    streams: HashMap<Token, u64>,
    /// Jobs removed from `jobs` whose callbacks have not returned yet.
    finishing: usize,
}

impl<S> Table<S> {
    fn new() -> Self {
        Self {
            next_key: 0,
            jobs: HashMap::new(),
            streams: HashMap::new(),
            finishing: 0,
        }
    }

    fn is_idle(&self) -> bool {
        self.jobs.is_empty() && self.finishing == 0
    }

    fn take(&mut self, key: u64) -> Option<Entry<S>> {
        let entry = self.jobs.remove(&key)?;
        for (token, _) in &entry.streams {
            self.streams.remove(token);
        }
        self.finishing += 1;
        Some(entry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Exited,
    StreamError,
}

struct Finished<S> {
    entry: Entry<S>,
    outcome: Outcome,
}

struct Shared<B: Backend> {
    backend: B,
    settings: PoolSettings,
    table: Mutex<Table<B::State>>,
    idle: Condvar,
}

impl<B: Backend> Shared<B> {
    fn lock(&self) -> MutexGuard<'_, Table<B::State>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read everything currently available on one stream.
    ///
    /// Returns true once the stream has reached end of file.
    fn drain(&self, entry: &mut Entry<B::State>, token: Token) -> bool {
        let Entry {
            job,
            state,
            streams,
            capture,
            ..
        } = entry;
        let Some((_, rx)) = streams.iter_mut().find(|(t, _)| *t == token) else {
            return true;
        };

        let mut buf = vec![0u8; self.settings.read_chunk];
        let mut received = false;
        let eof = loop {
            match rx.read(&mut buf) {
                Ok(0) => break true,
                Ok(n) => {
                    received = true;
                    job.output.push_str(&String::from_utf8_lossy(&buf[..n]));
                    if let Some(file) = capture.as_mut()
                        && let Err(e) = file.write_all(&buf[..n]).and_then(|()| file.flush())
                    {
                        warn!(jobid = %job.jobid, error = %e, "Failed to write job output file");
                        *capture = None;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break false,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(jobid = %job.jobid, error = %e, "Reading job output failed");
                    break true;
                }
            }
        };

        if received {
            self.backend.process_output(job, state);
        }
        eof
    }

    /// Reap a job whose streams have all closed. Returns false if the process
    /// has not exited yet.
    fn try_reap(entry: &mut Entry<B::State>) -> bool {
        match entry.child.try_wait() {
            Ok(Some(status)) => {
                entry.job.status = Some(status);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(jobid = %entry.job.jobid, error = %e, "Failed to reap job");
                true
            }
        }
    }

    fn finish(&self, finished: Finished<B::State>) {
        let Finished { entry, outcome } = finished;
        let Entry {
            mut job,
            mut state,
            capture,
            callbacks,
            reservation,
            ..
        } = entry;
        drop(capture);

        self.backend.finish(&mut job, &mut state);

        let success = outcome == Outcome::Exited && job.succeeded();
        let callback = if success {
            callbacks.on_success.as_ref()
        } else {
            callbacks.on_error.as_ref()
        };
        let disposition = match callback {
            Some(cb) => catch_unwind(AssertUnwindSafe(|| cb(&job))).unwrap_or_else(|_| {
                error!(jobid = %job.jobid, "Job callback panicked");
                Disposition::Log
            }),
            None => Disposition::Log,
        };

        if disposition == Disposition::Log {
            if success {
                info!("job {} finished{}", job.jobid, job.elapsed_suffix());
                debug!("command: {}", job.command);
            } else {
                let status = job
                    .exit_code()
                    .map_or_else(|| "unknown".to_string(), |c| c.to_string());
                error!("job {} returned status {}{}", job.jobid, status, job.elapsed_suffix());
                error!("command: {}", job.command);
                error!("output:\n{}", job.output);
            }
        }

        drop(reservation);
        let mut table = self.lock();
        table.finishing = table.finishing.saturating_sub(1);
        drop(table);
        self.idle.notify_all();
    }
}

impl<B: Backend> ReadinessHandler for Shared<B> {
    fn on_readable(&self, token: Token) {
        let finished = {
            let mut guard = self.lock();
            let table = &mut *guard;
            let Some(&key) = table.streams.get(&token) else {
                return;
            };
            let Some(entry) = table.jobs.get_mut(&key) else {
                return;
            };

            if self.drain(entry, token) {
                // Dropping the receiver closes it and removes it from epoll.
                entry.streams.retain(|(t, _)| *t != token);
                table.streams.remove(&token);
            }

            if !entry.streams.is_empty() {
                return;
            }
            if !Self::try_reap(entry) {
                debug!(
                    "job {} hung up but does not yet have a return code, check later",
                    entry.job.jobid
                );
                return;
            }
            table.take(key).map(|entry| Finished {
                entry,
                outcome: Outcome::Exited,
            })
        };

        if let Some(finished) = finished {
            self.finish(finished);
        }
    }

    fn on_error(&self, token: Token) {
        let finished = {
            let mut table = self.lock();
            let Some(&key) = table.streams.get(&token) else {
                return;
            };
            table.take(key)
        };
        let Some(mut entry) = finished else {
            return;
        };

        error!(jobid = %entry.job.jobid, token = token.0, "Error on job output stream");
        let _ = entry.child.kill();
        if let Ok(status) = entry.child.wait() {
            entry.job.status = Some(status);
        }
        self.finish(Finished {
            entry,
            outcome: Outcome::StreamError,
        });
    }

    fn on_tick(&self) {
        let finished: Vec<_> = {
            let mut table = self.lock();
            let ready: Vec<u64> = table
                .jobs
                .iter_mut()
                .filter(|(_, entry)| entry.streams.is_empty())
                .filter_map(|(key, entry)| Self::try_reap(entry).then_some(*key))
                .collect();
            ready
                .into_iter()
                .filter_map(|key| table.take(key))
                .map(|entry| Finished {
                    entry,
                    outcome: Outcome::Exited,
                })
                .collect()
        };

        for f in finished {
            self.finish(f);
        }
    }
}

/// Handed to [`Backend::make_jobs`] to reserve resources and start jobs.
pub struct Launcher<'a, S> {
    table: &'a Mutex<Table<S>>,
    admission: &'a Admission,
    mux: &'a Multiplexer,
    callbacks: &'a Callbacks,
    handles: Vec<JobHandle>,
}

/// Everything needed to start one job.
pub struct LaunchSpec<S> {
    pub command: Command,
    pub job: Job,
    pub state: S,
    /// File receiving a copy of the job's output, if any.
    pub capture: Option<PathBuf>,
    pub reservation: Reservation,
}

impl<S: Send + 'static> Launcher<'_, S> {
    /// Block until `units` are available and take them.
    pub fn reserve(&self, units: usize) -> Reservation {
        self.admission.reserve(units)
    }

    /// Spawn the job and start watching its output.
    pub fn launch(&mut self, spec: LaunchSpec<S>) -> Result<JobHandle> {
        let LaunchSpec {
            mut command,
            job,
            state,
            capture,
            reservation,
        } = spec;

        let capture = capture.map(|path| open_outfile(&path)).transpose()?;

        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| PoolError::Spawn {
                jobid: job.jobid.clone(),
                source,
            })?;

        let streams = match take_streams(&mut child) {
            Ok(streams) => streams,
            Err(e) => {
                kill_quietly(&mut child);
                return Err(PoolError::Poll(e));
            }
        };

        let handle = job.handle();
        let mut entry = Entry {
            job,
            state,
            child,
            streams: Vec::with_capacity(2),
            capture,
            callbacks: self.callbacks.clone(),
            reservation,
        };

        // Register while holding the table lock so the multiplexer cannot see
        // an event for a token it does not know yet.
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let key = table.next_key;
        table.next_key += 1;
        for mut rx in streams {
            let token = self.mux.next_token();
            if let Err(e) = self.mux.register(&mut rx, token) {
                for (t, _) in &entry.streams {
                    table.streams.remove(t);
                }
                drop(table);
                kill_quietly(&mut entry.child);
                return Err(PoolError::Poll(e));
            }
            table.streams.insert(token, key);
            entry.streams.push((token, rx));
        }
        table.jobs.insert(key, entry);
        drop(table);

        self.handles.push(handle.clone());
        Ok(handle)
    }
}

fn open_outfile(path: &std::path::Path) -> Result<File> {
    let wrap = |source| PoolError::Outfile {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(wrap)?;
    }
    File::create(path).map_err(wrap)
}

fn take_streams(child: &mut Child) -> io::Result<Vec<Receiver>> {
    let missing = || io::Error::other("child output was not captured");
    let stdout = Receiver::from(child.stdout.take().ok_or_else(missing)?);
    let stderr = Receiver::from(child.stderr.take().ok_or_else(missing)?);
    stdout.set_nonblocking(true)?;
    stderr.set_nonblocking(true)?;
    Ok(vec![stdout, stderr])
}

fn kill_quietly(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// A pool of concurrently running jobs over one backend.
pub struct Pool<B: Backend> {
    shared: Arc<Shared<B>>,
    admission: Admission,
    mux: Mutex<Option<Arc<Multiplexer>>>,
}

impl<B: Backend> Pool<B> {
    /// `max_parallel` bounds the total cost of running jobs; `None` is
    /// unbounded.
    pub fn new(backend: B, max_parallel: Option<usize>, settings: PoolSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                settings,
                table: Mutex::new(Table::new()),
                idle: Condvar::new(),
            }),
            admission: Admission::new(max_parallel),
            mux: Mutex::new(None),
        }
    }

    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.shared.settings
    }

    pub fn max_parallel(&self) -> Option<usize> {
        self.admission.max()
    }

    /// Resource units currently held by running jobs.
    pub fn in_use(&self) -> usize {
        self.admission.in_use()
    }

    /// Jobs still in the job table.
    pub fn active_jobs(&self) -> usize {
        self.shared.lock().jobs.len()
    }

    /// Run a command with the backend's default options.
    pub fn run(&self, request: JobRequest, callbacks: Callbacks) -> Result<Vec<JobHandle>> {
        self.run_with(request, callbacks, B::Options::default())
    }

    /// Run a command, blocking only for admission.
    ///
    /// Returns one handle per job the backend created. Job failures are
    /// reported through `callbacks`, not as errors.
    pub fn run_with(
        &self,
        request: JobRequest,
        callbacks: Callbacks,
        options: B::Options,
    ) -> Result<Vec<JobHandle>> {
        if request.cost == 0 {
            return Err(PoolError::ZeroCost {
                jobid: request.jobid,
            });
        }
        let units = self.shared.backend.admission_units(&request);
        if !self.admission.fits(units) {
            return Err(PoolError::CostExceedsLimit {
                jobid: request.jobid,
                cost: units,
                max: self.admission.max().unwrap_or_default(),
            });
        }

        let mux = self.multiplexer()?;
        let mut launcher = Launcher {
            table: &self.shared.table,
            admission: &self.admission,
            mux: &mux,
            callbacks: &callbacks,
            handles: Vec::new(),
        };
        self.shared
            .backend
            .make_jobs(&request, options, &mut launcher)?;
        Ok(launcher.handles)
    }

    /// Block until every job has finished and its callbacks have returned.
    pub fn wait_all(&self) {
        let mut table = self.shared.lock();
        while !table.is_idle() {
            table = self
                .shared
                .idle
                .wait(table)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn multiplexer(&self) -> Result<Arc<Multiplexer>> {
        let mut mux = self.mux.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mux) = mux.as_ref() {
            return Ok(Arc::clone(mux));
        }
        let handler: Arc<dyn ReadinessHandler> = self.shared.clone();
        let started = Arc::new(
            Multiplexer::start(handler, self.shared.settings.poll_interval).map_err(PoolError::Poll)?,
        );
        *mux = Some(Arc::clone(&started));
        Ok(started)
    }
}

impl<B: Backend> Drop for Pool<B> {
    fn drop(&mut self) {
        let remaining = self.active_jobs();
        if remaining > 0 {
            warn!(remaining, "Pool dropped with jobs still running");
        }
        let mux = self.mux.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(mux);
    }
}
