//! The contract between the engine and the ways of reaching a node.
//!
//! A transport never blocks. Work that cannot finish right away is split into
//! steps; the transport asks its [`TransportContext`] to call it back with a
//! [`Wakeup`], either as a deferred job or when a timer fires. Everything a
//! transport has to tell the engine (action completions, node liveness) also
//! goes through the context.

use std::fmt;
use std::time::Duration;

use cape_core::{OcfExitCode, OpHandle, RecoveryState};
use cape_mainloop::{Priority, TimerId};
use serde_json::{Map, Value};

use crate::bus::{CorrelationId, ObjectAddress, ObjectKind};

/// What the engine knows about the node a transport talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Assembly name.
    pub name: String,
    pub uuid: String,
    /// Network address once the instance is running.
    pub address: String,
}

impl NodeInfo {
    pub fn new(name: impl Into<String>, uuid: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: uuid.into(),
            address: address.into(),
        }
    }
}

/// Reason a transport asked to be called back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Wakeup {
    /// Continue establishing the connection.
    Connect,
    /// Continue the unit of work with this id.
    Step(u64),
    /// The unit of work with this id ran out of time.
    Timeout(u64),
    Keepalive,
    Healthcheck,
}

impl fmt::Display for Wakeup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Step(id) => write!(f, "step {id}"),
            Self::Timeout(id) => write!(f, "timeout {id}"),
            Self::Keepalive => write!(f, "keepalive"),
            Self::Healthcheck => write!(f, "healthcheck"),
        }
    }
}

/// Inbound traffic from a message bus, addressed to one node.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportInput {
    /// An agent object appeared on the bus.
    ObjectConnected {
        kind: ObjectKind,
        address: ObjectAddress,
    },
    /// An agent object went away.
    ObjectLost { kind: ObjectKind },
    /// Reply to an earlier call.
    Response {
        correlation: CorrelationId,
        result: Result<Map<String, Value>, String>,
    },
    /// Liveness beacon from the host agent.
    Heartbeat { sequence: u32 },
}

/// Services the engine offers to a transport while it runs.
pub trait TransportContext {
    /// Current reactor time.
    fn now(&self) -> Duration;

    /// Call the transport back with `wakeup` as soon as possible.
    fn defer(&mut self, priority: Priority, wakeup: Wakeup);

    /// Call the transport back with `wakeup` after `after`.
    fn start_timer(&mut self, priority: Priority, after: Duration, wakeup: Wakeup) -> TimerId;

    fn cancel_timer(&mut self, timer: TimerId);

    /// Hand back a finished action with its outcome. Every action passed to
    /// [`Transport::resource_action`] is handed back exactly once.
    fn action_completed(&mut self, op: OpHandle, rc: OcfExitCode);

    /// Report the node as reachable ([`RecoveryState::Running`]) or lost
    /// ([`RecoveryState::Failed`]).
    fn node_state(&mut self, state: RecoveryState, reason: &str);
}

/// A way of running resource actions on one node.
pub trait Transport {
    fn kind(&self) -> &'static str;

    /// Check if the node is reachable right now.
    fn is_connected(&self) -> bool;

    /// Start connecting. Calling it while connected or connecting does
    /// nothing.
    fn connect(&mut self, ctx: &mut dyn TransportContext);

    /// Tear the connection down. Actions still in flight complete with
    /// [`OcfExitCode::UnknownError`].
    fn disconnect(&mut self, ctx: &mut dyn TransportContext);

    /// Run an action. The handle comes back through
    /// [`TransportContext::action_completed`].
    fn resource_action(&mut self, op: OpHandle, ctx: &mut dyn TransportContext);

    /// Probe the node once.
    fn healthcheck(&mut self, _ctx: &mut dyn TransportContext) {}

    /// A deferred step or timer asked for earlier is due.
    fn wakeup(&mut self, wakeup: Wakeup, ctx: &mut dyn TransportContext);

    /// Inbound bus traffic for this node.
    fn deliver(&mut self, input: TransportInput, _ctx: &mut dyn TransportContext) {
        tracing::warn!(kind = self.kind(), ?input, "transport takes no inbound traffic");
    }
}

/// Creates transports of one kind.
pub trait TransportFactory {
    /// Name used in topology documents (`ssh`, `cim`, `bus`).
    fn kind(&self) -> &'static str;

    /// Check if resources of `class` can be run.
    fn supports_class(&self, class: &str) -> bool;

    fn create(&self, node: &NodeInfo) -> Box<dyn Transport>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! A recording context shared by the transport unit tests.

    #![allow(clippy::unwrap_used)]

    use std::collections::{BTreeMap, VecDeque};

    use super::*;

    #[derive(Default)]
    pub struct FakeContext {
        pub now: Duration,
        pub deferred: VecDeque<Wakeup>,
        pub timers: BTreeMap<u64, (Duration, Wakeup, bool)>,
        pub next_timer: u64,
        pub completions: Vec<(String, OcfExitCode)>,
        pub handles: Vec<OpHandle>,
        pub node_states: Vec<(RecoveryState, String)>,
    }

    impl FakeContext {
        /// Armed timers, soonest first.
        pub fn armed(&self) -> Vec<(u64, Duration, Wakeup)> {
            let mut armed: Vec<_> = self
                .timers
                .iter()
                .filter(|(_, (_, _, live))| *live)
                .map(|(id, (at, wakeup, _))| (*id, *at, *wakeup))
                .collect();
            armed.sort_by_key(|(id, at, _)| (*at, *id));
            armed
        }

        pub fn armed_for(&self, wakeup: Wakeup) -> bool {
            self.armed().iter().any(|(_, _, w)| *w == wakeup)
        }

        /// Fire the soonest armed timer, moving the clock to it.
        pub fn fire_next(&mut self) -> Option<Wakeup> {
            let (id, at, wakeup) = self.armed().into_iter().next()?;
            self.now = at;
            self.timers.get_mut(&id).unwrap().2 = false;
            Some(wakeup)
        }

        pub fn last_node_state(&self) -> Option<RecoveryState> {
            self.node_states.last().map(|(state, _)| *state)
        }
    }

    impl TransportContext for FakeContext {
        fn now(&self) -> Duration {
            self.now
        }

        fn defer(&mut self, _priority: Priority, wakeup: Wakeup) {
            self.deferred.push_back(wakeup);
        }

        fn start_timer(&mut self, _priority: Priority, after: Duration, wakeup: Wakeup) -> TimerId {
            self.next_timer += 1;
            self.timers
                .insert(self.next_timer, (self.now + after, wakeup, true));
            TimerId::from_raw(self.next_timer)
        }

        fn cancel_timer(&mut self, timer: TimerId) {
            if let Some(entry) = self.timers.get_mut(&timer.as_u64()) {
                entry.2 = false;
            }
        }

        fn action_completed(&mut self, op: OpHandle, rc: OcfExitCode) {
            self.completions.push((op.history_key(), rc));
            self.handles.push(op);
        }

        fn node_state(&mut self, state: RecoveryState, reason: &str) {
            self.node_states.push((state, reason.to_string()));
        }
    }

    /// Run deferred wakeups until none is left, or `limit` ran.
    pub fn drain(
        transport: &mut dyn Transport,
        ctx: &mut FakeContext,
        limit: usize,
    ) -> usize {
        let mut ran = 0;
        while ran < limit {
            let Some(wakeup) = ctx.deferred.pop_front() else {
                break;
            };
            transport.wakeup(wakeup, ctx);
            ran += 1;
        }
        ran
    }
}
