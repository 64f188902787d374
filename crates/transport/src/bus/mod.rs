//! Message bus transport.
//!
//! Each node runs agents that publish three objects on a bus: the host
//! (which sends heartbeats), the service manager and the resource agent
//! runner. The node counts as reachable once all three are present and
//! heartbeats arrive in sequence and on time.

mod channel;
mod queue;

use std::fmt;
use std::time::Duration;

use cape_core::{Method, OcfExitCode, OpHandle, RecoveryState};
use cape_mainloop::{Priority, TimerId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use channel::{BusRequest, ChannelBus};
pub use queue::{CallId, CallResult, CallState, Completion, RemoteObject};

use crate::error::Result;
use crate::transport::{
    NodeInfo, Transport, TransportContext, TransportFactory, TransportInput, Wakeup,
};

/// Transport kind of bus assemblies in a topology.
pub const KIND: &str = "bus";

/// Default time without a heartbeat after which the node is lost.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(20);
/// Period of the liveness check.
pub const HEARTBEAT_CHECK: Duration = Duration::from_millis(4000);

/// Matches the reply to a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Bus address of an agent object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectAddress(String);

impl ObjectAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The agent objects a node publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Host,
    Services,
    Resources,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Host => "host",
            Self::Services => "services",
            Self::Resources => "resources",
        })
    }
}

/// Sends method calls to objects on the bus.
pub trait BusConnection {
    /// Hand a call to the bus. The reply comes back later as a
    /// [`TransportInput::Response`] with the returned id.
    ///
    /// # Errors
    ///
    /// Returns an error when the bus does not take the call.
    fn call(
        &mut self,
        object: &ObjectAddress,
        method: &str,
        args: &Map<String, Value>,
    ) -> Result<CorrelationId>;
}

/// Liveness as judged from heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    /// Nothing received yet.
    Init,
    Ok,
    /// A sequence number was skipped.
    SeqBad,
    /// The last heartbeat is too old.
    NotReceived,
}

struct PendingAction {
    op: OpHandle,
    lsb_action: Option<&'static str>,
}

/// Runs resource actions through bus agents.
pub struct BusTransport<B: BusConnection> {
    node: NodeInfo,
    bus: B,
    heartbeat_timeout: Duration,
    host: RemoteObject<()>,
    services: RemoteObject<PendingAction>,
    resources: RemoteObject<PendingAction>,
    heartbeat: HeartbeatState,
    last_sequence: u32,
    last_heartbeat: Duration,
    online: bool,
    started: bool,
    check_timer: Option<TimerId>,
    next_call: u64,
}

impl<B: BusConnection> BusTransport<B> {
    pub fn new(node: NodeInfo, bus: B, heartbeat_timeout: Duration) -> Self {
        Self {
            node,
            bus,
            heartbeat_timeout,
            host: RemoteObject::new(ObjectKind::Host),
            services: RemoteObject::new(ObjectKind::Services),
            resources: RemoteObject::new(ObjectKind::Resources),
            heartbeat: HeartbeatState::Init,
            last_sequence: 0,
            last_heartbeat: Duration::ZERO,
            online: false,
            started: false,
            check_timer: None,
            next_call: 0,
        }
    }

    #[must_use]
    pub const fn heartbeat(&self) -> HeartbeatState {
        self.heartbeat
    }

    fn heartbeat_received(&mut self, sequence: u32, now: Duration) {
        if self.heartbeat != HeartbeatState::Ok {
            info!(assembly = %self.node.name, sequence, "got the first heartbeat");
            self.heartbeat = HeartbeatState::Ok;
            self.last_sequence = sequence;
            self.last_heartbeat = now;
            return;
        }
        if sequence > self.last_sequence.saturating_add(1) {
            warn!(assembly = %self.node.name, sequence, last = self.last_sequence, "heartbeat missed a sequence");
            self.heartbeat = HeartbeatState::SeqBad;
            return;
        }
        self.last_sequence = sequence;
        let elapsed = now.saturating_sub(self.last_heartbeat);
        self.last_heartbeat = now;
        if elapsed > self.heartbeat_timeout {
            warn!(assembly = %self.node.name, ?elapsed, "heartbeat too late");
            self.heartbeat = HeartbeatState::NotReceived;
        }
    }

    fn check_state(&mut self, ctx: &mut dyn TransportContext) {
        if self.online {
            if self.heartbeat == HeartbeatState::Ok {
                let elapsed = ctx.now().saturating_sub(self.last_heartbeat);
                if elapsed > self.heartbeat_timeout {
                    warn!(assembly = %self.node.name, ?elapsed, "heartbeat too late");
                    self.heartbeat = HeartbeatState::NotReceived;
                }
            }
            if self.heartbeat != HeartbeatState::Ok {
                self.online = false;
                if let Some(timer) = self.check_timer.take() {
                    ctx.cancel_timer(timer);
                }
                ctx.node_state(RecoveryState::Failed, "heartbeat lost");
            }
            return;
        }
        if self.started
            && self.heartbeat == HeartbeatState::Ok
            && self.host.is_connected()
            && self.services.is_connected()
            && self.resources.is_connected()
        {
            self.online = true;
            self.arm_check(ctx);
            ctx.node_state(RecoveryState::Running, "agents connected");
        }
    }

    fn arm_check(&mut self, ctx: &mut dyn TransportContext) {
        if let Some(timer) = self.check_timer.take() {
            ctx.cancel_timer(timer);
        }
        self.check_timer = Some(ctx.start_timer(Priority::Med, HEARTBEAT_CHECK, Wakeup::Healthcheck));
    }

    fn complete(
        &self,
        completion: Completion<PendingAction>,
        ctx: &mut dyn TransportContext,
    ) {
        let Completion {
            method,
            result,
            user_data: PendingAction { op, lsb_action },
            ..
        } = completion;
        let rc = match result {
            CallResult::Ok(args) => match args.get("rc").and_then(Value::as_i64) {
                Some(rc) => {
                    let rc = i32::try_from(rc).unwrap_or(i32::MAX);
                    lsb_action.map_or_else(
                        || OcfExitCode::from_agent(rc),
                        |action| OcfExitCode::from_lsb(action, rc),
                    )
                }
                None => {
                    warn!(assembly = %self.node.name, %method, "reply without rc");
                    OcfExitCode::UnknownError
                }
            },
            other => {
                debug!(assembly = %self.node.name, %method, result = ?other, "call failed");
                OcfExitCode::UnknownError
            }
        };
        ctx.action_completed(op, rc);
    }

    fn complete_all(
        &self,
        completions: impl IntoIterator<Item = Completion<PendingAction>>,
        ctx: &mut dyn TransportContext,
    ) {
        for completion in completions {
            self.complete(completion, ctx);
        }
    }

    fn object_connected(&mut self, kind: ObjectKind, address: ObjectAddress, ctx: &mut dyn TransportContext) {
        match kind {
            ObjectKind::Host => {
                self.host.on_connected(address, &mut self.bus, ctx);
            }
            ObjectKind::Services => {
                let failed = self.services.on_connected(address, &mut self.bus, ctx);
                self.complete_all(failed, ctx);
            }
            ObjectKind::Resources => {
                let failed = self.resources.on_connected(address, &mut self.bus, ctx);
                self.complete_all(failed, ctx);
            }
        }
        self.check_state(ctx);
    }

    fn object_lost(&mut self, kind: ObjectKind, ctx: &mut dyn TransportContext) {
        match kind {
            ObjectKind::Host => {
                self.host.on_disconnected(ctx);
            }
            ObjectKind::Services => {
                let cancelled = self.services.on_disconnected(ctx);
                self.complete_all(cancelled, ctx);
            }
            ObjectKind::Resources => {
                let cancelled = self.resources.on_disconnected(ctx);
                self.complete_all(cancelled, ctx);
            }
        }
        if self.online {
            warn!(assembly = %self.node.name, object = %kind, "agent object lost");
            self.online = false;
            if let Some(timer) = self.check_timer.take() {
                ctx.cancel_timer(timer);
            }
            ctx.node_state(RecoveryState::Failed, "agent object lost");
        }
    }

    fn call_args(op: &OpHandle) -> (ObjectKind, &'static str, Option<&'static str>, Map<String, Value>) {
        let mut args = Map::new();
        args.insert("timeout".to_string(), json!(op.timeout_ms));
        if op.class == "lsb" {
            let method = match op.method {
                Method::Start => "start",
                Method::Stop => "stop",
                Method::Monitor | Method::Delete => "status",
            };
            args.insert("name".to_string(), json!(op.kind));
            args.insert("interval".to_string(), json!(0));
            return (ObjectKind::Services, method, Some(method), args);
        }

        let method = if op.method == Method::Monitor {
            "monitor"
        } else {
            args.insert("action".to_string(), json!(op.method.as_str()));
            "invoke"
        };
        args.insert("interval".to_string(), json!(0));
        args.insert("name".to_string(), json!(op.resource));
        args.insert("class".to_string(), json!(op.class));
        args.insert(
            "provider".to_string(),
            json!(op.provider.as_deref().unwrap_or("heartbeat")),
        );
        args.insert("type".to_string(), json!(op.kind));
        args.insert("parameters".to_string(), json!(op.params));
        (ObjectKind::Resources, method, None, args)
    }
}

impl<B: BusConnection> Transport for BusTransport<B> {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn is_connected(&self) -> bool {
        self.online
    }

    fn connect(&mut self, ctx: &mut dyn TransportContext) {
        if self.started {
            return;
        }
        info!(assembly = %self.node.name, uuid = %self.node.uuid, "waiting for bus agents");
        self.started = true;
        self.check_state(ctx);
    }

    fn disconnect(&mut self, ctx: &mut dyn TransportContext) {
        info!(assembly = %self.node.name, "disconnecting bus agents");
        if let Some(timer) = self.check_timer.take() {
            ctx.cancel_timer(timer);
        }
        self.host.cancel_all(ctx);
        let services = self.services.cancel_all(ctx);
        self.complete_all(services, ctx);
        let resources = self.resources.cancel_all(ctx);
        self.complete_all(resources, ctx);
        self.heartbeat = HeartbeatState::Init;
        self.online = false;
        self.started = false;
    }

    fn resource_action(&mut self, op: OpHandle, ctx: &mut dyn TransportContext) {
        if op.method == Method::Delete {
            ctx.action_completed(op, OcfExitCode::UnimplementFeature);
            return;
        }
        let (kind, method, lsb_action, args) = Self::call_args(&op);
        let call = CallId(self.next_call);
        self.next_call = self.next_call.wrapping_add(1);
        let timeout = op.timeout();
        debug!(assembly = %self.node.name, op = %*op, object = %kind, method, "bus call");

        let pending = PendingAction { op, lsb_action };
        let object = if kind == ObjectKind::Services {
            &mut self.services
        } else {
            &mut self.resources
        };
        if let Some(failed) = object.call_async(call, method, args, pending, timeout, &mut self.bus, ctx) {
            self.complete(failed, ctx);
        }
    }

    fn healthcheck(&mut self, ctx: &mut dyn TransportContext) {
        self.check_state(ctx);
        if self.online {
            self.arm_check(ctx);
        }
    }

    fn wakeup(&mut self, wakeup: Wakeup, ctx: &mut dyn TransportContext) {
        match wakeup {
            Wakeup::Healthcheck => {
                self.check_timer = None;
                self.healthcheck(ctx);
            }
            Wakeup::Timeout(id) => {
                let call = CallId(id);
                if let Some(done) = self.services.on_timeout(call, ctx) {
                    self.complete(done, ctx);
                } else if let Some(done) = self.resources.on_timeout(call, ctx) {
                    self.complete(done, ctx);
                }
            }
            other => debug!(assembly = %self.node.name, wakeup = %other, "ignored"),
        }
    }

    fn deliver(&mut self, input: TransportInput, ctx: &mut dyn TransportContext) {
        match input {
            TransportInput::ObjectConnected { kind, address } => self.object_connected(kind, address, ctx),
            TransportInput::ObjectLost { kind } => self.object_lost(kind, ctx),
            TransportInput::Response { correlation, result } => {
                if self.services.owns_correlation(correlation) {
                    if let Some(done) = self.services.on_response(correlation, result, ctx) {
                        self.complete(done, ctx);
                    }
                } else if let Some(done) = self.resources.on_response(correlation, result, ctx) {
                    self.complete(done, ctx);
                }
            }
            TransportInput::Heartbeat { sequence } => {
                self.heartbeat_received(sequence, ctx.now());
                self.check_state(ctx);
            }
        }
    }
}

/// Creates [`BusTransport`]s whose calls go down one channel.
#[derive(Debug, Clone)]
pub struct BusFactory {
    sender: mpsc::UnboundedSender<BusRequest>,
    heartbeat_timeout: Duration,
}

impl BusFactory {
    pub const fn new(sender: mpsc::UnboundedSender<BusRequest>, heartbeat_timeout: Duration) -> Self {
        Self {
            sender,
            heartbeat_timeout,
        }
    }
}

impl TransportFactory for BusFactory {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn supports_class(&self, class: &str) -> bool {
        matches!(class, "lsb" | "ocf")
    }

    fn create(&self, node: &NodeInfo) -> Box<dyn Transport> {
        Box::new(BusTransport::new(
            node.clone(),
            ChannelBus::new(node.name.clone(), self.sender.clone()),
            self.heartbeat_timeout,
        ))
    }
}
