//! Asynchronous calls to one remote object.
//!
//! Calls made while the object is away are queued and issued in order once
//! it shows up. Every call ends exactly once: with its response, a timeout,
//! or cancellation when the object goes away. A completed call is forgotten,
//! so whichever of response and timeout comes second finds nothing.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use cape_mainloop::{Priority, Stopwatch, TimerId};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{BusConnection, CorrelationId, ObjectAddress, ObjectKind};
use crate::transport::{TransportContext, Wakeup};

/// Identity of a call, unique per transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Waiting for the object to connect.
    Scheduled,
    /// Issued, waiting for the response.
    Running,
}

/// How a call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CallResult {
    Ok(Map<String, Value>),
    /// Issued but unanswered in time.
    Timeout,
    /// The object never connected in time.
    NotConnected,
    /// The object went away with the call outstanding.
    Cancelled,
    /// The remote side or the bus rejected the call.
    Exception(String),
}

/// A finished call handed back to its owner.
#[derive(Debug)]
pub struct Completion<U> {
    pub call: CallId,
    pub method: String,
    pub result: CallResult,
    pub user_data: U,
    /// Time spent waiting for the object.
    pub queued_for: Duration,
    /// Time between issuing and the result.
    pub executed_for: Duration,
}

struct PendingCall<U> {
    method: String,
    args: Map<String, Value>,
    user_data: U,
    timeout: Duration,
    state: CallState,
    timer: Option<TimerId>,
    queued: Stopwatch,
    executing: Stopwatch,
}

/// Client side of one remote object.
pub struct RemoteObject<U> {
    kind: ObjectKind,
    address: Option<ObjectAddress>,
    calls: BTreeMap<CallId, PendingCall<U>>,
    outstanding: HashMap<CorrelationId, CallId>,
    queued: VecDeque<CallId>,
}

impl<U> RemoteObject<U> {
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            address: None,
            calls: BTreeMap::new(),
            outstanding: HashMap::new(),
            queued: VecDeque::new(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ObjectKind {
        self.kind
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.address.is_some()
    }

    /// State of a call that has not ended yet.
    #[must_use]
    pub fn call_state(&self, call: CallId) -> Option<CallState> {
        self.calls.get(&call).map(|pending| pending.state)
    }

    /// Calls issued and waiting for a response.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Calls waiting for the object to connect.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queued.len()
    }

    /// Check if a response with this id is awaited here.
    #[must_use]
    pub fn owns_correlation(&self, correlation: CorrelationId) -> bool {
        self.outstanding.contains_key(&correlation)
    }

    /// Check if a call with this id belongs to this object.
    #[must_use]
    pub fn owns(&self, call: CallId) -> bool {
        self.calls.contains_key(&call)
    }

    /// Issue a call now, or queue it until the object connects. Either way
    /// its timer starts now. A call the bus refuses to take ends right away
    /// and is returned.
    #[allow(clippy::too_many_arguments)]
    pub fn call_async(
        &mut self,
        call: CallId,
        method: impl Into<String>,
        args: Map<String, Value>,
        user_data: U,
        timeout: Duration,
        bus: &mut dyn BusConnection,
        ctx: &mut dyn TransportContext,
    ) -> Option<Completion<U>> {
        let mut pending = PendingCall {
            method: method.into(),
            args,
            user_data,
            timeout,
            state: CallState::Scheduled,
            timer: Some(ctx.start_timer(Priority::Low, timeout, Wakeup::Timeout(call.0))),
            queued: Stopwatch::default(),
            executing: Stopwatch::default(),
        };

        if self.address.is_none() {
            debug!(object = %self.kind, %call, method = %pending.method, "queued until connected");
            pending.queued.start(ctx.now());
            self.calls.insert(call, pending);
            self.queued.push_back(call);
            return None;
        }
        self.calls.insert(call, pending);
        self.issue(call, bus, ctx)
    }

    fn issue(
        &mut self,
        call: CallId,
        bus: &mut dyn BusConnection,
        ctx: &mut dyn TransportContext,
    ) -> Option<Completion<U>> {
        let address = self.address.as_ref()?;
        let pending = self.calls.get_mut(&call)?;
        match bus.call(address, &pending.method, &pending.args) {
            Ok(correlation) => {
                debug!(object = %self.kind, %call, method = %pending.method, %correlation, "issued");
                pending.state = CallState::Running;
                pending.executing.start(ctx.now());
                self.outstanding.insert(correlation, call);
                None
            }
            Err(e) => {
                warn!(object = %self.kind, %call, method = %pending.method, error = %e, "cannot issue call");
                self.finish(call, CallResult::Exception(e.to_string()), ctx)
            }
        }
    }

    fn finish(
        &mut self,
        call: CallId,
        result: CallResult,
        ctx: &mut dyn TransportContext,
    ) -> Option<Completion<U>> {
        let mut pending = self.calls.remove(&call)?;
        if let Some(timer) = pending.timer.take() {
            ctx.cancel_timer(timer);
        }
        let now = ctx.now();
        Some(Completion {
            call,
            method: pending.method,
            result,
            user_data: pending.user_data,
            queued_for: pending.queued.stop(now),
            executed_for: pending.executing.stop(now),
        })
    }

    /// The object appeared at `address`. Queued calls are issued in order,
    /// each with a fresh timer.
    pub fn on_connected(
        &mut self,
        address: ObjectAddress,
        bus: &mut dyn BusConnection,
        ctx: &mut dyn TransportContext,
    ) -> Vec<Completion<U>> {
        info!(object = %self.kind, %address, queued = self.queued.len(), "object connected");
        self.address = Some(address);

        let mut failed = Vec::new();
        while let Some(call) = self.queued.pop_front() {
            let Some(pending) = self.calls.get_mut(&call) else {
                continue;
            };
            pending.queued.stop(ctx.now());
            if let Some(timer) = pending.timer.take() {
                ctx.cancel_timer(timer);
            }
            pending.timer = Some(ctx.start_timer(Priority::Low, pending.timeout, Wakeup::Timeout(call.0)));
            failed.extend(self.issue(call, bus, ctx));
        }
        failed
    }

    /// A response arrived. Responses to calls that already ended are
    /// dropped.
    pub fn on_response(
        &mut self,
        correlation: CorrelationId,
        result: Result<Map<String, Value>, String>,
        ctx: &mut dyn TransportContext,
    ) -> Option<Completion<U>> {
        let Some(call) = self.outstanding.remove(&correlation) else {
            debug!(object = %self.kind, %correlation, "response arrived too late");
            return None;
        };
        let result = match result {
            Ok(args) => CallResult::Ok(args),
            Err(text) => CallResult::Exception(text),
        };
        self.finish(call, result, ctx)
    }

    /// The timer of `call` fired.
    pub fn on_timeout(&mut self, call: CallId, ctx: &mut dyn TransportContext) -> Option<Completion<U>> {
        let pending = self.calls.get_mut(&call)?;
        pending.timer = None;
        let result = match pending.state {
            CallState::Scheduled => {
                self.queued.retain(|queued| *queued != call);
                CallResult::NotConnected
            }
            CallState::Running => {
                self.outstanding.retain(|_, outstanding| *outstanding != call);
                CallResult::Timeout
            }
        };
        warn!(object = %self.kind, %call, ?result, "call timed out");
        self.finish(call, result, ctx)
    }

    /// The object went away. Outstanding calls are cancelled; queued calls
    /// keep waiting.
    pub fn on_disconnected(&mut self, ctx: &mut dyn TransportContext) -> Vec<Completion<U>> {
        if self.address.take().is_some() {
            info!(object = %self.kind, outstanding = self.outstanding.len(), "object disconnected");
        }
        let mut cancelled: Vec<CallId> = self.outstanding.drain().map(|(_, call)| call).collect();
        cancelled.sort_unstable();
        cancelled
            .into_iter()
            .filter_map(|call| self.finish(call, CallResult::Cancelled, ctx))
            .collect()
    }

    /// End every call, queued ones included.
    pub fn cancel_all(&mut self, ctx: &mut dyn TransportContext) -> Vec<Completion<U>> {
        let mut done = self.on_disconnected(ctx);
        self.queued.clear();
        let calls: Vec<CallId> = self.calls.keys().copied().collect();
        done.extend(
            calls
                .into_iter()
                .filter_map(|call| self.finish(call, CallResult::Cancelled, ctx)),
        );
        done
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use serde_json::json;

    use super::*;
    use crate::error::{Result, TransportError};
    use crate::transport::testing::FakeContext;

    #[derive(Default)]
    struct RecordingBus {
        calls: Vec<(String, String)>,
        next: u64,
        closed: bool,
    }

    impl BusConnection for RecordingBus {
        fn call(
            &mut self,
            object: &ObjectAddress,
            method: &str,
            _args: &Map<String, Value>,
        ) -> Result<CorrelationId> {
            if self.closed {
                return Err(TransportError::BusClosed);
            }
            self.next += 1;
            self.calls.push((object.to_string(), method.to_string()));
            Ok(CorrelationId(self.next))
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(20);

    fn object() -> RemoteObject<&'static str> {
        RemoteObject::new(ObjectKind::Services)
    }

    fn address() -> ObjectAddress {
        ObjectAddress::new("bar/services")
    }

    #[test]
    fn test_queued_calls_drain_in_order() {
        let mut obj = object();
        let mut bus = RecordingBus::default();
        let mut ctx = FakeContext::default();

        assert!(obj
            .call_async(CallId(1), "start", Map::new(), "a", TIMEOUT, &mut bus, &mut ctx)
            .is_none());
        obj.call_async(CallId(2), "status", Map::new(), "b", TIMEOUT, &mut bus, &mut ctx);
        assert_eq!(obj.queued(), 2);
        assert_eq!(obj.call_state(CallId(1)), Some(CallState::Scheduled));
        assert!(bus.calls.is_empty());

        ctx.now = Duration::from_secs(5);
        assert!(obj.on_connected(address(), &mut bus, &mut ctx).is_empty());
        assert_eq!(
            bus.calls,
            vec![
                ("bar/services".to_string(), "start".to_string()),
                ("bar/services".to_string(), "status".to_string()),
            ]
        );
        assert_eq!(obj.call_state(CallId(2)), Some(CallState::Running));
        // fresh timers run from the connect time
        let armed = ctx.armed();
        assert_eq!(armed.len(), 2);
        assert!(armed.iter().all(|(_, at, _)| *at == Duration::from_secs(25)));

        ctx.now = Duration::from_secs(6);
        let done = obj
            .on_response(CorrelationId(1), Ok(json!({"rc": 0}).as_object().unwrap().clone()), &mut ctx)
            .unwrap();
        assert_eq!(done.user_data, "a");
        assert_eq!(done.queued_for, Duration::from_secs(5));
        assert_eq!(done.executed_for, Duration::from_secs(1));
        assert!(matches!(done.result, CallResult::Ok(_)));
        assert_eq!(ctx.armed().len(), 1);
    }

    #[test]
    fn test_queued_timeout_is_not_connected() {
        let mut obj = object();
        let mut bus = RecordingBus::default();
        let mut ctx = FakeContext::default();
        obj.call_async(CallId(1), "start", Map::new(), "a", TIMEOUT, &mut bus, &mut ctx);

        let wakeup = ctx.fire_next().unwrap();
        assert_eq!(wakeup, Wakeup::Timeout(1));
        let done = obj.on_timeout(CallId(1), &mut ctx).unwrap();
        assert_eq!(done.result, CallResult::NotConnected);
        assert_eq!(obj.queued(), 0);

        obj.on_connected(address(), &mut bus, &mut ctx);
        assert!(bus.calls.is_empty());
    }

    #[test]
    fn test_late_response_is_ignored() {
        let mut obj = object();
        let mut bus = RecordingBus::default();
        let mut ctx = FakeContext::default();
        obj.on_connected(address(), &mut bus, &mut ctx);
        obj.call_async(CallId(7), "stop", Map::new(), "a", TIMEOUT, &mut bus, &mut ctx);

        let done = obj.on_timeout(CallId(7), &mut ctx).unwrap();
        assert_eq!(done.result, CallResult::Timeout);
        assert!(obj.on_response(CorrelationId(1), Ok(Map::new()), &mut ctx).is_none());
        assert!(obj.on_timeout(CallId(7), &mut ctx).is_none());
    }

    #[test]
    fn test_response_just_before_timeout_wins() {
        let mut obj = object();
        let mut bus = RecordingBus::default();
        let mut ctx = FakeContext::default();
        obj.on_connected(address(), &mut bus, &mut ctx);
        obj.call_async(CallId(1), "start", Map::new(), "a", TIMEOUT, &mut bus, &mut ctx);
        obj.call_async(CallId(2), "status", Map::new(), "b", TIMEOUT, &mut bus, &mut ctx);

        ctx.now = TIMEOUT - Duration::from_millis(1);
        let done = obj.on_response(CorrelationId(1), Ok(Map::new()), &mut ctx).unwrap();
        assert_eq!(done.call, CallId(1));
        assert!(matches!(done.result, CallResult::Ok(_)));
        assert!(!obj.owns(CallId(1)));
        assert_eq!(ctx.armed().len(), 1);

        // The timer of the answered call fires anyway.
        ctx.now = TIMEOUT;
        assert!(obj.on_timeout(CallId(1), &mut ctx).is_none());
        assert_eq!(obj.outstanding(), 1);
        assert_eq!(obj.call_state(CallId(2)), Some(CallState::Running));
        assert!(obj.owns_correlation(CorrelationId(2)));
    }

    #[test]
    fn test_timeout_before_response_wins() {
        let mut obj = object();
        let mut bus = RecordingBus::default();
        let mut ctx = FakeContext::default();
        obj.on_connected(address(), &mut bus, &mut ctx);
        obj.call_async(CallId(1), "start", Map::new(), "a", TIMEOUT, &mut bus, &mut ctx);
        obj.call_async(CallId(2), "status", Map::new(), "b", TIMEOUT, &mut bus, &mut ctx);

        ctx.now = TIMEOUT;
        let done = obj.on_timeout(CallId(1), &mut ctx).unwrap();
        assert_eq!(done.result, CallResult::Timeout);
        assert_eq!(done.user_data, "a");
        assert!(!obj.owns_correlation(CorrelationId(1)));

        ctx.now = TIMEOUT + Duration::from_millis(1);
        assert!(obj.on_response(CorrelationId(1), Ok(Map::new()), &mut ctx).is_none());
        assert_eq!(obj.outstanding(), 1);
        assert_eq!(obj.call_state(CallId(2)), Some(CallState::Running));
        assert_eq!(ctx.armed().len(), 1);
    }

    #[test]
    fn test_disconnect_cancels_outstanding_only() {
        let mut obj = object();
        let mut bus = RecordingBus::default();
        let mut ctx = FakeContext::default();
        obj.on_connected(address(), &mut bus, &mut ctx);
        obj.call_async(CallId(1), "start", Map::new(), "a", TIMEOUT, &mut bus, &mut ctx);
        obj.call_async(CallId(2), "stop", Map::new(), "b", TIMEOUT, &mut bus, &mut ctx);

        let cancelled = obj.on_disconnected(&mut ctx);
        assert_eq!(cancelled.len(), 2);
        assert!(cancelled.iter().all(|c| c.result == CallResult::Cancelled));
        assert_eq!(cancelled[0].call, CallId(1));

        obj.call_async(CallId(3), "status", Map::new(), "c", TIMEOUT, &mut bus, &mut ctx);
        assert!(obj.on_disconnected(&mut ctx).is_empty());
        assert_eq!(obj.queued(), 1);

        let everything = obj.cancel_all(&mut ctx);
        assert_eq!(everything.len(), 1);
        assert!(ctx.armed().is_empty());
    }

    #[test]
    fn test_issue_error_is_an_exception() {
        let mut obj = object();
        let mut bus = RecordingBus::default();
        let mut ctx = FakeContext::default();
        obj.on_connected(address(), &mut bus, &mut ctx);
        bus.closed = true;

        let done = obj
            .call_async(CallId(1), "start", Map::new(), "a", TIMEOUT, &mut bus, &mut ctx)
            .unwrap();
        assert!(matches!(done.result, CallResult::Exception(_)));
        assert!(!obj.owns(CallId(1)));
        assert!(ctx.armed().is_empty());
    }

    #[test]
    fn test_remote_exception() {
        let mut obj = object();
        let mut bus = RecordingBus::default();
        let mut ctx = FakeContext::default();
        obj.on_connected(address(), &mut bus, &mut ctx);
        obj.call_async(CallId(1), "start", Map::new(), "a", TIMEOUT, &mut bus, &mut ctx);

        let done = obj
            .on_response(CorrelationId(1), Err("no such service".to_string()), &mut ctx)
            .unwrap();
        assert_eq!(done.result, CallResult::Exception("no such service".to_string()));
    }
}
