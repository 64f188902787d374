//! CIM service management transport.
//!
//! Services are queried and driven through a management client instead of
//! a shell, so only LSB-style services are reachable. Each action runs as a
//! single deferred job.

use std::collections::BTreeMap;
use std::time::Duration;

use cape_core::{Method, OcfExitCode, OpHandle, RecoveryState};
use cape_mainloop::{Priority, TimerId};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::transport::{NodeInfo, Transport, TransportContext, TransportFactory, Wakeup};

/// Pause before retrying a failed connection.
const CONNECT_RETRY: Duration = Duration::from_millis(1000);

/// Service operations of a CIM management endpoint.
#[allow(clippy::missing_errors_doc)]
pub trait CimClient {
    /// Check if the service is running.
    fn service_started(&mut self, service: &str) -> Result<bool>;

    fn service_start(&mut self, service: &str) -> Result<()>;

    fn service_stop(&mut self, service: &str) -> Result<()>;
}

/// Opens clients to nodes.
pub trait CimConnector {
    type Client: CimClient;

    /// # Errors
    ///
    /// Returns an error when the endpoint cannot be reached.
    fn connect(&self, node: &NodeInfo) -> Result<Self::Client>;
}

/// Runs LSB services through a [`CimClient`].
pub struct CimTransport<C: CimConnector> {
    node: NodeInfo,
    connector: C,
    client: Option<C::Client>,
    connecting: bool,
    connect_timer: Option<TimerId>,
    pending: BTreeMap<u64, OpHandle>,
    next_action: u64,
}

impl<C: CimConnector> CimTransport<C> {
    pub const fn new(node: NodeInfo, connector: C) -> Self {
        Self {
            node,
            connector,
            client: None,
            connecting: false,
            connect_timer: None,
            pending: BTreeMap::new(),
            next_action: 0,
        }
    }

    fn try_connect(&mut self, ctx: &mut dyn TransportContext) {
        self.connect_timer = None;
        if !self.connecting {
            return;
        }
        match self.connector.connect(&self.node) {
            Ok(client) => {
                info!(assembly = %self.node.name, address = %self.node.address, "cim connected");
                self.client = Some(client);
                self.connecting = false;
                ctx.node_state(RecoveryState::Running, "connected");
            }
            Err(e) => {
                debug!(assembly = %self.node.name, error = %e, "cim endpoint not reachable yet");
                self.connect_timer = Some(ctx.start_timer(Priority::Low, CONNECT_RETRY, Wakeup::Connect));
            }
        }
    }

    fn perform_action(&mut self, id: u64, ctx: &mut dyn TransportContext) {
        let Some(op) = self.pending.remove(&id) else {
            return;
        };
        let Some(client) = self.client.as_mut() else {
            ctx.action_completed(op, OcfExitCode::UnknownError);
            return;
        };

        let service = op.kind.as_str();
        let result = match op.method {
            Method::Monitor => client.service_started(service).map(|running| {
                if running {
                    OcfExitCode::Ok
                } else {
                    OcfExitCode::NotRunning
                }
            }),
            Method::Start => client.service_start(service).map(|()| OcfExitCode::Ok),
            Method::Stop => client.service_stop(service).map(|()| OcfExitCode::Ok),
            Method::Delete => Ok(OcfExitCode::UnimplementFeature),
        };
        let rc = result.unwrap_or_else(|e| {
            warn!(assembly = %self.node.name, op = %*op, error = %e, "cim request failed");
            OcfExitCode::UnknownError
        });
        ctx.action_completed(op, rc);
    }
}

impl<C: CimConnector> Transport for CimTransport<C> {
    fn kind(&self) -> &'static str {
        "cim"
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    fn connect(&mut self, ctx: &mut dyn TransportContext) {
        if self.client.is_some() || self.connecting {
            return;
        }
        self.connecting = true;
        self.try_connect(ctx);
    }

    fn disconnect(&mut self, ctx: &mut dyn TransportContext) {
        info!(assembly = %self.node.name, "cim disconnecting");
        if let Some(timer) = self.connect_timer.take() {
            ctx.cancel_timer(timer);
        }
        self.connecting = false;
        self.client = None;
        for (_, op) in std::mem::take(&mut self.pending) {
            ctx.action_completed(op, OcfExitCode::UnknownError);
        }
    }

    fn resource_action(&mut self, op: OpHandle, ctx: &mut dyn TransportContext) {
        if op.class != "lsb" {
            warn!(assembly = %self.node.name, op = %*op, "cim only runs lsb services");
            ctx.action_completed(op, OcfExitCode::UnimplementFeature);
            return;
        }
        if self.client.is_none() {
            warn!(assembly = %self.node.name, op = %*op, "cim not connected");
            ctx.node_state(RecoveryState::Failed, "cim not connected");
            ctx.action_completed(op, OcfExitCode::UnknownError);
            return;
        }
        let id = self.next_action;
        self.next_action = self.next_action.wrapping_add(1);
        self.pending.insert(id, op);
        ctx.defer(Priority::Low, Wakeup::Step(id));
    }

    fn wakeup(&mut self, wakeup: Wakeup, ctx: &mut dyn TransportContext) {
        match wakeup {
            Wakeup::Connect => self.try_connect(ctx),
            Wakeup::Step(id) => self.perform_action(id, ctx),
            other => debug!(assembly = %self.node.name, wakeup = %other, "ignored"),
        }
    }
}

/// Creates [`CimTransport`]s.
#[derive(Debug, Clone)]
pub struct CimFactory<C> {
    connector: C,
}

impl<C> CimFactory<C> {
    pub const fn new(connector: C) -> Self {
        Self { connector }
    }
}

impl<C> TransportFactory for CimFactory<C>
where
    C: CimConnector + Clone + 'static,
{
    fn kind(&self) -> &'static str {
        "cim"
    }

    fn supports_class(&self, class: &str) -> bool {
        class == "lsb"
    }

    fn create(&self, node: &NodeInfo) -> Box<dyn Transport> {
        Box::new(CimTransport::new(node.clone(), self.connector.clone()))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::cell::RefCell;
    use std::collections::BTreeSet;
    use std::rc::Rc;

    use cape_core::Operation;

    use super::*;
    use crate::error::TransportError;
    use crate::transport::testing::{FakeContext, drain};

    #[derive(Default)]
    struct Services {
        running: BTreeSet<String>,
        broken: bool,
        refuse: u32,
    }

    #[derive(Clone, Default)]
    struct FakeCim(Rc<RefCell<Services>>);

    impl CimClient for FakeCim {
        fn service_started(&mut self, service: &str) -> Result<bool> {
            let services = self.0.borrow();
            if services.broken {
                return Err(TransportError::cim("endpoint gone"));
            }
            Ok(services.running.contains(service))
        }

        fn service_start(&mut self, service: &str) -> Result<()> {
            self.0.borrow_mut().running.insert(service.to_string());
            Ok(())
        }

        fn service_stop(&mut self, service: &str) -> Result<()> {
            self.0.borrow_mut().running.remove(service);
            Ok(())
        }
    }

    impl CimConnector for FakeCim {
        type Client = Self;

        fn connect(&self, node: &NodeInfo) -> Result<Self> {
            let mut services = self.0.borrow_mut();
            if services.refuse > 0 {
                services.refuse -= 1;
                return Err(TransportError::connect_failed(&node.address, "refused"));
            }
            Ok(self.clone())
        }
    }

    fn op(method: Method) -> OpHandle {
        OpHandle::new(Operation::new("bar", "rsc_bar_angus", method).with_agent("lsb", "httpd", None))
    }

    fn transport() -> (CimTransport<FakeCim>, FakeCim, FakeContext) {
        let cim = FakeCim::default();
        let transport = CimTransport::new(NodeInfo::new("bar", "uuid", "10.0.0.2"), cim.clone());
        (transport, cim, FakeContext::default())
    }

    #[test]
    fn test_actions_complete_through_jobs() {
        let (mut transport, _cim, mut ctx) = transport();
        transport.connect(&mut ctx);
        assert_eq!(ctx.last_node_state(), Some(RecoveryState::Running));

        transport.resource_action(op(Method::Monitor), &mut ctx);
        transport.resource_action(op(Method::Start), &mut ctx);
        transport.resource_action(op(Method::Monitor), &mut ctx);
        assert!(ctx.completions.is_empty());
        drain(&mut transport, &mut ctx, 10);

        let rcs: Vec<_> = ctx.completions.iter().map(|(_, rc)| *rc).collect();
        assert_eq!(
            rcs,
            vec![OcfExitCode::NotRunning, OcfExitCode::Ok, OcfExitCode::Ok]
        );
    }

    #[test]
    fn test_client_error_is_unknown_error() {
        let (mut transport, cim, mut ctx) = transport();
        transport.connect(&mut ctx);
        cim.0.borrow_mut().broken = true;

        transport.resource_action(op(Method::Monitor), &mut ctx);
        drain(&mut transport, &mut ctx, 10);
        assert_eq!(ctx.completions[0].1, OcfExitCode::UnknownError);
    }

    #[test]
    fn test_not_connected_fails_node() {
        let (mut transport, _cim, mut ctx) = transport();
        let handle = op(Method::Start);
        let keep = handle.retain();
        transport.resource_action(handle, &mut ctx);

        assert_eq!(ctx.last_node_state(), Some(RecoveryState::Failed));
        assert_eq!(ctx.completions[0].1, OcfExitCode::UnknownError);
        ctx.handles.clear();
        assert_eq!(keep.refcount(), 1);
    }

    #[test]
    fn test_unsupported_class() {
        let (mut transport, _cim, mut ctx) = transport();
        transport.connect(&mut ctx);
        let ocf = Operation::new("bar", "rsc_bar_web", Method::Start).with_agent(
            "ocf",
            "apache",
            Some("heartbeat".to_string()),
        );
        transport.resource_action(OpHandle::new(ocf), &mut ctx);
        assert_eq!(ctx.completions[0].1, OcfExitCode::UnimplementFeature);
    }

    #[test]
    fn test_connect_retries_and_disconnect_cancels() {
        let (mut transport, cim, mut ctx) = transport();
        cim.0.borrow_mut().refuse = 1;
        transport.connect(&mut ctx);
        assert!(!transport.is_connected());
        assert!(ctx.node_states.is_empty());

        let wakeup = ctx.fire_next().unwrap();
        transport.wakeup(wakeup, &mut ctx);
        assert!(transport.is_connected());

        transport.resource_action(op(Method::Stop), &mut ctx);
        transport.disconnect(&mut ctx);
        assert!(!transport.is_connected());
        assert_eq!(ctx.completions[0].1, OcfExitCode::UnknownError);

        // the queued job finds nothing left to do
        drain(&mut transport, &mut ctx, 10);
        assert_eq!(ctx.completions.len(), 1);
    }
}
