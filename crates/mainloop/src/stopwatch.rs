//! Elapsed-time measurement on the loop clock.

use std::time::Duration;

/// Start/stop timer used for diagnostics (provisioning time, queue time).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stopwatch {
    started: Option<Duration>,
    stopped: Option<Duration>,
}

impl Stopwatch {
    /// Start (or restart) measuring at `now`.
    pub const fn start(&mut self, now: Duration) {
        self.started = Some(now);
        self.stopped = None;
    }

    /// Stop measuring at `now` and return the measured span.
    pub fn stop(&mut self, now: Duration) -> Duration {
        if self.stopped.is_none() {
            self.stopped = Some(now);
        }
        self.elapsed(now)
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.started.is_some() && self.stopped.is_none()
    }

    /// Span measured so far; zero if never started.
    #[must_use]
    pub fn elapsed(&self, now: Duration) -> Duration {
        match (self.started, self.stopped) {
            (Some(started), Some(stopped)) => stopped.saturating_sub(started),
            (Some(started), None) => now.saturating_sub(started),
            _ => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stopwatch() {
        let mut sw = Stopwatch::default();
        assert_eq!(sw.elapsed(Duration::from_secs(9)), Duration::ZERO);

        sw.start(Duration::from_secs(1));
        assert!(sw.is_running());
        assert_eq!(sw.elapsed(Duration::from_secs(3)), Duration::from_secs(2));

        assert_eq!(sw.stop(Duration::from_secs(4)), Duration::from_secs(3));
        assert!(!sw.is_running());
        // stopping twice keeps the first reading
        assert_eq!(sw.stop(Duration::from_secs(10)), Duration::from_secs(3));
    }
}
