//! Readiness polling for job output streams.
//!
//! One background thread per pool waits on an epoll instance (through `mio`)
//! and forwards events to a [`ReadinessHandler`]. Streams are registered from
//! the caller's thread through a cloned [`Registry`].

use mio::{Events, Interest, Poll, Registry, Token, Waker, event::Source};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, trace};

const WAKE_TOKEN: Token = Token(0);
const EVENT_CAPACITY: usize = 64;

/// Receives stream events on the multiplexer thread.
pub(crate) trait ReadinessHandler: Send + Sync + 'static {
    /// Data (or end of stream) is available.
    fn on_readable(&self, token: Token);
    /// The stream reported an error condition.
    fn on_error(&self, token: Token);
    /// Called after every poll round, including timeouts.
    fn on_tick(&self);
}

pub(crate) struct Multiplexer {
    registry: Registry,
    waker: Waker,
    stop: Arc<AtomicBool>,
    next_token: AtomicUsize,
    thread: Option<JoinHandle<()>>,
}

impl Multiplexer {
    pub(crate) fn start(handler: Arc<dyn ReadinessHandler>, interval: Duration) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("pool-poller".to_string())
                .spawn(move || poll_loop(poll, handler, interval, stop))?
        };
        debug!(interval_ms = interval.as_millis() as u64, "Multiplexer started");

        Ok(Self {
            registry,
            waker,
            stop,
            next_token: AtomicUsize::new(WAKE_TOKEN.0 + 1),
            thread: Some(thread),
        })
    }

    pub(crate) fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Watch `source` for readability. Closing the source's descriptor removes
    /// it from the poll set.
    pub(crate) fn register<S: Source + ?Sized>(&self, source: &mut S, token: Token) -> io::Result<()> {
        self.registry.register(source, token, Interest::READABLE)
    }

    fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            error!(error = %e, "Failed to wake multiplexer for shutdown");
        }
        if thread.join().is_err() {
            error!("Multiplexer thread panicked");
        }
        debug!("Multiplexer stopped");
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn poll_loop(
    mut poll: Poll,
    handler: Arc<dyn ReadinessHandler>,
    interval: Duration,
    stop: Arc<AtomicBool>,
) {
    let mut events = Events::with_capacity(EVENT_CAPACITY);

    while !stop.load(Ordering::SeqCst) {
        if let Err(e) = poll.poll(&mut events, Some(interval)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %e, "Polling job streams failed");
            break;
        }

        for event in events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                continue;
            }
            trace!(
                token = token.0,
                readable = event.is_readable(),
                read_closed = event.is_read_closed(),
                error = event.is_error(),
                "Stream event"
            );
            if event.is_readable() || event.is_read_closed() {
                handler.on_readable(token);
            }
            if event.is_error() {
                handler.on_error(token);
            }
        }

        handler.on_tick();
    }
}
