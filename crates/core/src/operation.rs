//! Operations requested by the planner and the shared handle that carries
//! them across asynchronous boundaries.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::rc::Rc;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::exitcode::OcfExitCode;

/// Lifecycle action on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Start,
    Stop,
    Monitor,
    Delete,
}

impl Method {
    /// Get the method as a string slice.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Monitor => "monitor",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "monitor" | "status" => Ok(Self::Monitor),
            "delete" => Ok(Self::Delete),
            other => Err(Error::unknown_method(other)),
        }
    }
}

/// A single requested action on a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    /// Assembly the planner expects to run the action.
    pub hostname: String,
    /// Resource name, `rsc_{assembly}_{service}`.
    pub resource: String,
    pub method: Method,
    pub class: String,
    pub kind: String,
    pub provider: Option<String>,
    /// Zero for one-shot operations, otherwise the recurrence period.
    pub interval_ms: u64,
    pub timeout_ms: u64,
    /// Outcome the planner considers a success.
    pub target: OcfExitCode,
    pub params: BTreeMap<String, String>,
    pub graph_id: u32,
    pub action_id: u32,
}

impl Operation {
    /// Create a one-shot operation expecting [`OcfExitCode::Ok`].
    pub fn new(hostname: impl Into<String>, resource: impl Into<String>, method: Method) -> Self {
        Self {
            hostname: hostname.into(),
            resource: resource.into(),
            method,
            class: String::from("lsb"),
            kind: String::new(),
            provider: None,
            interval_ms: 0,
            timeout_ms: 20_000,
            target: OcfExitCode::Ok,
            params: BTreeMap::new(),
            graph_id: 0,
            action_id: 0,
        }
    }

    /// Set the resource agent class, type and provider.
    #[must_use]
    pub fn with_agent(
        mut self,
        class: impl Into<String>,
        kind: impl Into<String>,
        provider: Option<String>,
    ) -> Self {
        self.class = class.into();
        self.kind = kind.into();
        self.provider = provider;
        self
    }

    /// Set the recurrence interval in milliseconds.
    #[must_use]
    pub const fn with_interval_ms(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    /// Set the timeout in milliseconds.
    #[must_use]
    pub const fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set the expected outcome.
    #[must_use]
    pub const fn with_target(mut self, target: OcfExitCode) -> Self {
        self.target = target;
        self
    }

    /// Set the agent parameters.
    #[must_use]
    pub fn with_params(mut self, params: BTreeMap<String, String>) -> Self {
        self.params = params;
        self
    }

    /// Set the planner correlation ids.
    #[must_use]
    pub const fn with_ids(mut self, graph_id: u32, action_id: u32) -> Self {
        self.graph_id = graph_id;
        self.action_id = action_id;
        self
    }

    /// Check if the operation recurs.
    #[must_use]
    pub const fn is_recurring(&self) -> bool {
        self.interval_ms > 0
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// History key, `{resource}_{method}_{interval}`.
    #[must_use]
    pub fn history_key(&self) -> String {
        format!("{}_{}_{}", self.resource, self.method, self.interval_ms)
    }

    /// Stable digest of the parameters, used to detect configuration drift.
    #[must_use]
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in &self.params {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] on {}",
            self.history_key(),
            self.class,
            self.hostname
        )
    }
}

#[derive(Debug)]
struct Shared {
    op: Operation,
    times_executed: Cell<u32>,
    started_at: Cell<Option<Duration>>,
}

/// Reference counted handle to an [`Operation`].
///
/// The planner's operation starts out with one handle. Whoever keeps the
/// operation across an asynchronous gap takes its own handle with
/// [`OpHandle::retain`] before handing off, and drops it (or calls
/// [`OpHandle::release`]) once its part is done. The operation is freed when
/// the last handle goes.
#[derive(Debug)]
pub struct OpHandle(Rc<Shared>);

impl OpHandle {
    /// Wrap a planner operation. The returned handle is the only reference.
    #[must_use]
    pub fn new(op: Operation) -> Self {
        Self(Rc::new(Shared {
            op,
            times_executed: Cell::new(0),
            started_at: Cell::new(None),
        }))
    }

    /// Take another reference to the same operation.
    #[must_use]
    pub fn retain(&self) -> Self {
        Self(Rc::clone(&self.0))
    }

    /// Give up this reference.
    pub fn release(self) {
        drop(self);
    }

    /// Number of live references.
    #[must_use]
    pub fn refcount(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    /// Check if both handles refer to the same operation.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    #[must_use]
    pub fn times_executed(&self) -> u32 {
        self.0.times_executed.get()
    }

    /// Count one more completed execution and return the new total.
    pub fn mark_executed(&self) -> u32 {
        let count = self.0.times_executed.get().saturating_add(1);
        self.0.times_executed.set(count);
        count
    }

    /// Start measuring an execution.
    pub fn start_timing(&self, now: Duration) {
        self.0.started_at.set(Some(now));
    }

    /// Stop measuring and return how long the execution took.
    pub fn stop_timing(&self, now: Duration) -> Option<Duration> {
        self.0
            .started_at
            .take()
            .map(|started| now.saturating_sub(started))
    }
}

impl Deref for OpHandle {
    type Target = Operation;

    fn deref(&self) -> &Self::Target {
        &self.0.op
    }
}
