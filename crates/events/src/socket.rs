//! Unix socket event sink.
//!
//! Events are written as JSON lines to a listening admin socket. The socket
//! is non-blocking; an event that cannot be written in full right away is
//! dropped. After repeated failures the sink stops trying until it manages to
//! reconnect.

use std::cell::RefCell;
use std::io::{self, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, warn};

use crate::error::Result;
use crate::event::RecoveryEvent;
use crate::sink::EventSink;

/// Consecutive failures after which a dead connection is dropped.
const FAILURE_THRESHOLD: u32 = 5;

/// Counts consecutive delivery failures.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_count: AtomicU32,
    threshold: u32,
}

impl CircuitBreaker {
    /// Create a breaker that opens after `threshold` consecutive failures.
    #[must_use]
    pub const fn new(threshold: u32) -> Self {
        Self {
            failure_count: AtomicU32::new(0),
            threshold,
        }
    }

    /// Check if a request should be allowed.
    pub fn allow_request(&self) -> bool {
        self.failure_count.load(Ordering::Relaxed) < self.threshold
    }

    /// Record a successful request.
    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::Relaxed);
    }

    /// Record a failed request.
    pub fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current failure count.
    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }
}

/// Sends events to an admin socket, best effort.
#[derive(Debug)]
pub struct UnixSocketSink {
    path: PathBuf,
    stream: RefCell<Option<UnixStream>>,
    breaker: CircuitBreaker,
}

impl UnixSocketSink {
    /// Create a sink for the socket at `path`. Connection is attempted
    /// lazily on the first event.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            stream: RefCell::new(None),
            breaker: CircuitBreaker::new(FAILURE_THRESHOLD),
        }
    }

    /// Create a sink and connect right away.
    ///
    /// # Errors
    ///
    /// Returns an error when the socket cannot be reached.
    pub fn connect(path: impl Into<PathBuf>) -> Result<Self> {
        let sink = Self::new(path);
        let stream = open(&sink.path)?;
        *sink.stream.borrow_mut() = Some(stream);
        Ok(sink)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if a connection is currently open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.stream.borrow().is_some()
    }

    fn send(&self, event: &RecoveryEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut slot = self.stream.borrow_mut();
        if slot.is_none() {
            *slot = Some(open(&self.path)?);
        }
        if let Some(stream) = slot.as_mut() {
            write_all_nonblocking(stream, &line)?;
        }
        Ok(())
    }
}

fn open(path: &Path) -> io::Result<UnixStream> {
    let stream = UnixStream::connect(path)?;
    stream.set_nonblocking(true)?;
    Ok(stream)
}

/// Write the whole buffer, retrying partial writes. Would-block is an error:
/// the reader is not keeping up and the event is dropped.
fn write_all_nonblocking(stream: &mut UnixStream, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => buf = buf.get(n..).unwrap_or_default(),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

impl EventSink for UnixSocketSink {
    fn emit(&self, event: &RecoveryEvent) {
        if !self.breaker.allow_request() {
            // give the listener a fresh chance once per event
            *self.stream.borrow_mut() = None;
        }
        match self.send(event) {
            Ok(()) => {
                self.breaker.record_success();
                debug!(path = %self.path.display(), subject = event.subject(), "event sent");
            }
            Err(e) => {
                self.breaker.record_failure();
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    failures = self.breaker.failure_count(),
                    "dropping event"
                );
                if !self.breaker.allow_request() {
                    *self.stream.borrow_mut() = None;
                }
            }
        }
    }
}
