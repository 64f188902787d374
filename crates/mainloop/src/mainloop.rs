//! Job and timer queues of the reactor.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::time::Duration;

/// Work item run to completion against the reactor state.
pub type Job<S> = Box<dyn FnOnce(&mut S)>;

/// Scheduling priority of jobs and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Med,
    High,
}

/// Handle of an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    /// Rebuild a handle from [`TimerId::as_u64`].
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

struct QueuedJob<S> {
    priority: Priority,
    seq: u64,
    job: Job<S>,
}

impl<S> PartialEq for QueuedJob<S> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<S> Eq for QueuedJob<S> {}

impl<S> PartialOrd for QueuedJob<S> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Higher priority first, then submission order.
impl<S> Ord for QueuedJob<S> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Timer<S> {
    priority: Priority,
    deadline: Duration,
    job: Job<S>,
}

/// Prioritized jobs and timers over a clock measured from loop start.
///
/// Nothing here runs jobs: the owner of the state `S` pops them and runs
/// them against itself (see [`Reactor`](crate::Reactor)). Expired timers are
/// moved into the job queue, in deadline order, the next time a job is
/// popped. Cancelled timers leave a stale heap entry that is skipped lazily.
pub struct Mainloop<S> {
    now: Duration,
    next_seq: u64,
    next_timer: u64,
    jobs: BinaryHeap<QueuedJob<S>>,
    deadlines: BinaryHeap<Reverse<(Duration, TimerId)>>,
    timers: HashMap<TimerId, Timer<S>>,
}

impl<S> Mainloop<S> {
    /// Create an empty loop at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            now: Duration::ZERO,
            next_seq: 0,
            next_timer: 0,
            jobs: BinaryHeap::new(),
            deadlines: BinaryHeap::new(),
            timers: HashMap::new(),
        }
    }

    /// Current loop time.
    #[must_use]
    pub const fn now(&self) -> Duration {
        self.now
    }

    /// Move the clock. Time never goes backwards.
    pub fn set_now(&mut self, now: Duration) {
        if now > self.now {
            self.now = now;
        }
    }

    /// Queue a job.
    pub fn add_job(&mut self, priority: Priority, job: impl FnOnce(&mut S) + 'static) {
        self.push_job(priority, Box::new(job));
    }

    fn push_job(&mut self, priority: Priority, job: Job<S>) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.jobs.push(QueuedJob { priority, seq, job });
    }

    /// Arm a one-shot timer firing `after` from now.
    pub fn add_timer(
        &mut self,
        priority: Priority,
        after: Duration,
        job: impl FnOnce(&mut S) + 'static,
    ) -> TimerId {
        let id = TimerId(self.next_timer);
        self.next_timer = self.next_timer.wrapping_add(1);
        let deadline = self.now.saturating_add(after);
        self.deadlines.push(Reverse((deadline, id)));
        self.timers.insert(
            id,
            Timer {
                priority,
                deadline,
                job: Box::new(job),
            },
        );
        id
    }

    /// Disarm a timer. Returns `false` if it already fired or was cancelled.
    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.timers.remove(&id).is_some()
    }

    /// Check if a timer is still armed.
    #[must_use]
    pub fn is_timer_armed(&self, id: TimerId) -> bool {
        self.timers.contains_key(&id)
    }

    /// Time left before an armed timer fires.
    #[must_use]
    pub fn time_remaining(&self, id: TimerId) -> Option<Duration> {
        self.timers
            .get(&id)
            .map(|timer| timer.deadline.saturating_sub(self.now))
    }

    /// Deadline of the earliest armed timer.
    pub fn next_deadline(&mut self) -> Option<Duration> {
        self.discard_stale();
        self.deadlines.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Number of queued jobs, expired timers not included.
    #[must_use]
    pub fn pending_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Number of armed timers.
    #[must_use]
    pub fn armed_timers(&self) -> usize {
        self.timers.len()
    }

    /// Check if a job is runnable right now.
    pub fn has_ready_work(&mut self) -> bool {
        !self.jobs.is_empty() || self.next_deadline().is_some_and(|d| d <= self.now)
    }

    /// Pop the next runnable job.
    pub fn next_job(&mut self) -> Option<Job<S>> {
        self.promote_expired();
        self.jobs.pop().map(|queued| queued.job)
    }

    /// Pop every job runnable right now, in run order.
    ///
    /// Jobs queued while the batch runs wait for the next batch.
    pub fn take_batch(&mut self) -> Vec<Job<S>> {
        self.promote_expired();
        let mut batch = Vec::with_capacity(self.jobs.len());
        while let Some(queued) = self.jobs.pop() {
            batch.push(queued.job);
        }
        batch
    }

    fn discard_stale(&mut self) {
        while let Some(Reverse((_, id))) = self.deadlines.peek() {
            if self.timers.contains_key(id) {
                break;
            }
            self.deadlines.pop();
        }
    }

    fn promote_expired(&mut self) {
        while let Some(Reverse((deadline, id))) = self.deadlines.peek().copied() {
            if deadline > self.now {
                break;
            }
            self.deadlines.pop();
            if let Some(timer) = self.timers.remove(&id) {
                self.push_job(timer.priority, timer.job);
            }
        }
    }
}

impl<S> Default for Mainloop<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> fmt::Debug for Mainloop<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mainloop")
            .field("now", &self.now)
            .field("jobs", &self.jobs.len())
            .field("timers", &self.timers.len())
            .finish_non_exhaustive()
    }
}
