//! In-memory nodes, transport and provider shared by the engine tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::time::Duration;

use cape_core::{Method, OcfExitCode, OpHandle, RecoveryState};
use cape_events::RecordingSink;
use cape_mainloop::{Priority, Reactor};
use cape_reconciler::{
    Assembly, BasicPlanner, Confirmation, Engine, EngineBuilder, EngineConfig, InstanceProvider,
    InstanceState, PlanStep, Planner, StatusSnapshot, Topology,
};
use cape_transport::{NodeInfo, Transport, TransportContext, TransportFactory, Wakeup};

/// What every fake node is doing, shared by all transports.
#[derive(Debug, Default)]
pub struct World {
    /// Resources currently running.
    pub running: BTreeSet<String>,
    /// History keys of every executed action, in order.
    pub executed: Vec<String>,
    pub connects: usize,
    pub disconnects: usize,
}

impl World {
    fn run(&mut self, op: &OpHandle) -> OcfExitCode {
        self.executed.push(op.history_key());
        match op.method {
            Method::Start => {
                self.running.insert(op.resource.clone());
                OcfExitCode::Ok
            }
            Method::Stop => {
                self.running.remove(&op.resource);
                OcfExitCode::Ok
            }
            Method::Monitor if self.running.contains(&op.resource) => OcfExitCode::Ok,
            Method::Monitor => OcfExitCode::NotRunning,
            Method::Delete => OcfExitCode::Ok,
        }
    }
}

pub type Nodes = Rc<RefCell<World>>;

/// Runs every action one deferred step after it was asked for.
pub struct FakeTransport {
    node: NodeInfo,
    world: Nodes,
    connected: bool,
    pending: BTreeMap<u64, OpHandle>,
    next_id: u64,
}

impl Transport for FakeTransport {
    fn kind(&self) -> &'static str {
        "fake"
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn connect(&mut self, ctx: &mut dyn TransportContext) {
        if self.connected {
            return;
        }
        self.connected = true;
        self.world.borrow_mut().connects += 1;
        ctx.node_state(RecoveryState::Running, "connected");
    }

    fn disconnect(&mut self, ctx: &mut dyn TransportContext) {
        self.connected = false;
        self.world.borrow_mut().disconnects += 1;
        for (_, op) in std::mem::take(&mut self.pending) {
            ctx.action_completed(op, OcfExitCode::UnknownError);
        }
    }

    fn resource_action(&mut self, op: OpHandle, ctx: &mut dyn TransportContext) {
        self.next_id += 1;
        self.pending.insert(self.next_id, op);
        ctx.defer(Priority::Med, Wakeup::Step(self.next_id));
    }

    fn wakeup(&mut self, wakeup: Wakeup, ctx: &mut dyn TransportContext) {
        let Wakeup::Step(id) = wakeup else {
            return;
        };
        if let Some(op) = self.pending.remove(&id) {
            let rc = self.world.borrow_mut().run(&op);
            tracing::debug!(node = %self.node.name, op = %*op, %rc, "fake action ran");
            ctx.action_completed(op, rc);
        }
    }
}

pub struct FakeFactory {
    pub world: Nodes,
}

impl TransportFactory for FakeFactory {
    fn kind(&self) -> &'static str {
        "fake"
    }

    fn supports_class(&self, class: &str) -> bool {
        matches!(class, "lsb" | "ocf")
    }

    fn create(&self, node: &NodeInfo) -> Box<dyn Transport> {
        Box::new(FakeTransport {
            node: node.clone(),
            world: Rc::clone(&self.world),
            connected: false,
            pending: BTreeMap::new(),
            next_id: 0,
        })
    }
}

/// Instances created and destroyed by the engine.
#[derive(Debug, Default)]
pub struct Instances {
    pub created: Vec<String>,
    pub destroyed: Vec<String>,
    /// Polls answered with `Pending` before an instance runs.
    pub pending_polls: u32,
}

#[derive(Clone, Default)]
pub struct FakeProvider {
    pub instances: Rc<RefCell<Instances>>,
}

impl InstanceProvider for FakeProvider {
    fn create_instance(&mut self, assembly: &Assembly) -> cape_reconciler::Result<String> {
        let mut instances = self.instances.borrow_mut();
        instances.created.push(assembly.name.clone());
        Ok(format!("i-{}", instances.created.len()))
    }

    fn instance_state(&mut self, instance_id: &str) -> cape_reconciler::Result<InstanceState> {
        let mut instances = self.instances.borrow_mut();
        if instances.pending_polls > 0 {
            instances.pending_polls -= 1;
            return Ok(InstanceState::Pending);
        }
        Ok(InstanceState::Running {
            address: format!("10.0.0.{}", instance_id.trim_start_matches("i-")),
        })
    }

    fn destroy_instance(&mut self, instance_id: &str) -> cape_reconciler::Result<()> {
        self.instances.borrow_mut().destroyed.push(instance_id.to_string());
        Ok(())
    }
}

/// Wraps a planner and counts the passes it is asked for.
pub struct CountingPlanner<P> {
    pub inner: P,
    pub passes: Rc<RefCell<usize>>,
}

impl<P: Planner> Planner for CountingPlanner<P> {
    fn is_busy(&self) -> bool {
        self.inner.is_busy()
    }

    fn plan(&mut self, topology: &Topology, snapshot: &StatusSnapshot) -> PlanStep {
        *self.passes.borrow_mut() += 1;
        self.inner.plan(topology, snapshot)
    }

    fn confirm(&mut self, confirmation: Confirmation) -> PlanStep {
        self.inner.confirm(confirmation)
    }
}

pub struct Harness {
    pub engine: Engine,
    pub world: Nodes,
    pub provider: FakeProvider,
    pub events: RecordingSink,
    pub passes: Rc<RefCell<usize>>,
}

impl Harness {
    /// Engine with the basic planner, counting its passes.
    pub fn new(topology: Topology) -> Result<Self, String> {
        let passes = Rc::new(RefCell::new(0));
        let planner = CountingPlanner {
            inner: BasicPlanner::new(),
            passes: Rc::clone(&passes),
        };
        let mut harness = Self::with_planner(topology, planner)?;
        harness.passes = passes;
        Ok(harness)
    }

    pub fn with_planner(topology: Topology, planner: impl Planner + 'static) -> Result<Self, String> {
        let world = Nodes::default();
        let provider = FakeProvider::default();
        let events = RecordingSink::new();
        let engine = EngineBuilder::new()
            .with_config(EngineConfig::for_testing().with_default_transport("fake"))
            .with_transport(FakeFactory {
                world: Rc::clone(&world),
            })
            .with_provider(provider.clone())
            .with_sink(events.clone())
            .with_planner(planner)
            .build(topology)
            .map_err(|e| e.to_string())?;
        Ok(Self {
            engine,
            world,
            provider,
            events,
            passes: Rc::default(),
        })
    }

    /// Build, start and run until the application settles.
    pub fn started(topology: Topology) -> Result<Self, String> {
        let mut harness = Self::new(topology)?;
        harness.engine.start();
        harness.advance_ms(1_000);
        Ok(harness)
    }

    pub fn advance_ms(&mut self, ms: u64) {
        self.engine.advance(Duration::from_millis(ms));
    }

    pub fn crash(&self, resource: &str) {
        self.world.borrow_mut().running.remove(resource);
    }

    pub fn is_running(&self, resource: &str) -> bool {
        self.world.borrow().running.contains(resource)
    }

    pub fn executed(&self, key: &str) -> usize {
        self.world
            .borrow()
            .executed
            .iter()
            .filter(|executed| executed.as_str() == key)
            .count()
    }

    pub fn passes(&self) -> usize {
        *self.passes.borrow()
    }

    pub fn assembly_state(&self, name: &str) -> Result<RecoveryState, String> {
        self.engine
            .assembly_state(name)
            .ok_or_else(|| format!("no assembly '{name}'"))
    }

    pub fn resource_state(&self, name: &str) -> Result<RecoveryState, String> {
        self.engine
            .resource_state(name)
            .ok_or_else(|| format!("no resource '{name}'"))
    }
}
