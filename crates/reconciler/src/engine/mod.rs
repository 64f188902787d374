//! The reconciliation engine.
//!
//! One [`Engine`] owns the whole live model: the registry of assemblies and
//! resources, the operation history, the planner, the instance provider, the
//! transports and the reactor they all run on. Every piece of state is
//! touched from the loop only.
//!
//! A pass goes: render a [`StatusSnapshot`], ask the planner for a graph,
//! dispatch its operations, feed outcomes back as confirmations. Outcomes
//! that miss their target, recovery remedies and node state changes all ask
//! for another pass through [`Engine::schedule_processing`], which debounces
//! bursts into a single pass.

mod dispatch;
mod node;

use std::collections::BTreeSet;
use std::time::Duration;

use cape_core::{Operation, RecoveryState, Remedy};
use cape_events::{EventSink, LogSink, RecoveryEvent};
use cape_mainloop::{Mainloop, Priority, Reactor, TimerId};
use cape_transport::{TransportFactory, TransportInput};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::history::OperationHistory;
use crate::planner::{BasicPlanner, Confirmation, PlanStep, Planner, Verdict};
use crate::provider::{InstanceProvider, StaticProvider};
use crate::registry::{Application, Registry};
use crate::status::StatusSnapshot;
use crate::topology::{AssemblySpec, Topology, resource_name};
use crate::transports::TransportSet;

/// Message from outside the loop.
#[derive(Debug)]
pub enum EngineCommand {
    /// Bus traffic for an assembly's transport.
    Deliver {
        assembly: String,
        input: TransportInput,
    },
    /// Switch to a new topology.
    Reload(Box<Topology>),
    /// Disconnect everything and leave the loop.
    Shutdown,
}

/// Sends commands to a running engine from any task.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    sender: mpsc::UnboundedSender<EngineCommand>,
}

impl EngineHandle {
    /// Create a handle and the receiver to hand to [`cape_mainloop::run`].
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineCommand>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// # Errors
    ///
    /// Returns an error when the engine is gone.
    pub fn deliver(&self, assembly: impl Into<String>, input: TransportInput) -> Result<()> {
        self.send(EngineCommand::Deliver {
            assembly: assembly.into(),
            input,
        })
    }

    /// # Errors
    ///
    /// Returns an error when the engine is gone.
    pub fn reload(&self, topology: Topology) -> Result<()> {
        self.send(EngineCommand::Reload(Box::new(topology)))
    }

    /// # Errors
    ///
    /// Returns an error when the engine is gone.
    pub fn shutdown(&self) -> Result<()> {
        self.send(EngineCommand::Shutdown)
    }

    fn send(&self, command: EngineCommand) -> Result<()> {
        self.sender.send(command).map_err(|_| Error::EngineStopped)
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    planner: Option<Box<dyn Planner>>,
    provider: Option<Box<dyn InstanceProvider>>,
    sink: Option<Box<dyn EventSink>>,
    transports: TransportSet,
}

impl EngineBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            planner: None,
            provider: None,
            sink: None,
            transports: TransportSet::new(),
        }
    }

    /// Set the configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the planner; [`BasicPlanner`] otherwise.
    #[must_use]
    pub fn with_planner(mut self, planner: impl Planner + 'static) -> Self {
        self.planner = Some(Box::new(planner));
        self
    }

    /// Set the instance provider; [`StaticProvider`] otherwise.
    #[must_use]
    pub fn with_provider(mut self, provider: impl InstanceProvider + 'static) -> Self {
        self.provider = Some(Box::new(provider));
        self
    }

    /// Set the event sink; [`LogSink`] otherwise.
    #[must_use]
    pub fn with_sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Add a transport factory.
    #[must_use]
    pub fn with_transport(mut self, factory: impl TransportFactory + 'static) -> Self {
        self.transports.insert(Box::new(factory));
        self
    }

    /// Replace the transport factories.
    #[must_use]
    pub fn with_transports(mut self, transports: TransportSet) -> Self {
        self.transports = transports;
        self
    }

    /// Build the engine for `topology`.
    ///
    /// # Errors
    ///
    /// Returns an error when no transport is configured or the topology does
    /// not validate against the configured transports.
    pub fn build(self, topology: Topology) -> Result<Engine> {
        if self.transports.is_empty() {
            return Err(Error::invalid_config("no transport configured"));
        }
        topology.validate(&self.transports, &self.config.default_transport)?;

        let registry = Registry::from_topology(&topology, &self.config.default_transport);
        Ok(Engine {
            mainloop: Mainloop::new(),
            crmd_uuid: Uuid::new_v4().to_string(),
            topology,
            registry,
            history: OperationHistory::new(),
            planner: self.planner.unwrap_or_else(|| Box::new(BasicPlanner::new())),
            provider: self.provider.unwrap_or_else(|| Box::new(StaticProvider)),
            sink: self.sink.unwrap_or_else(|| Box::new(LogSink)),
            transports: self.transports,
            config: self.config,
            processing_timer: None,
            processing_pending: false,
            stopping: false,
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Owner of all reconciliation state.
pub struct Engine {
    mainloop: Mainloop<Self>,
    config: EngineConfig,
    crmd_uuid: String,
    topology: Topology,
    registry: Registry,
    history: OperationHistory,
    planner: Box<dyn Planner>,
    provider: Box<dyn InstanceProvider>,
    sink: Box<dyn EventSink>,
    transports: TransportSet,
    processing_timer: Option<TimerId>,
    /// Set while a pass is armed or due but not yet running. The timer may
    /// already have left the timer queue for the job queue.
    processing_pending: bool,
    stopping: bool,
}

impl Engine {
    /// Provision every assembly and schedule the first pass.
    pub fn start(&mut self) {
        info!(
            application = %self.registry.application.name,
            assemblies = self.topology.assemblies.len(),
            "engine starting"
        );
        for name in self.registry.assembly_names() {
            self.provision(&name);
        }
        self.schedule_processing();
    }

    /// Ask for a planning pass. Calls made while a pass is already pending
    /// are absorbed by it.
    pub fn schedule_processing(&mut self) {
        if self.stopping {
            return;
        }
        if self.processing_scheduled() {
            debug!("processing already scheduled");
            return;
        }
        let timer = self
            .mainloop
            .add_timer(Priority::Low, self.config.schedule_delay(), |engine: &mut Self| {
                engine.processing_timer = None;
                engine.processing_pending = false;
                engine.process();
            });
        self.processing_timer = Some(timer);
        self.processing_pending = true;
    }

    /// Run one planning pass, unless the previous graph is still running.
    pub fn process(&mut self) {
        // A due pass can outlive its cancelled timer by one job.
        if self.stopping {
            return;
        }
        if self.planner.is_busy() {
            debug!("planner busy, processing deferred");
            self.schedule_processing();
            return;
        }
        let snapshot = self.status_snapshot();
        debug!(nodes = snapshot.nodes.len(), "planning pass");
        let step = self.planner.plan(&self.topology, &snapshot);
        self.apply_step(step);
    }

    fn apply_step(&mut self, step: PlanStep) {
        for action in step.actions {
            self.dispatch(action);
        }
        match step.verdict {
            Some(Verdict::Complete) => debug!("transition graph complete"),
            Some(verdict @ (Verdict::Partial | Verdict::NeedsReevaluation)) => {
                info!(?verdict, "transition graph needs another pass");
                self.schedule_processing();
            }
            None => {}
        }
    }

    /// Report an outcome to the planner and run whatever it releases.
    fn confirm(&mut self, op: &Operation, rc: cape_core::OcfExitCode) {
        let step = self.planner.confirm(Confirmation::new(op, rc));
        self.apply_step(step);
    }

    /// Switch to a new topology.
    ///
    /// New assemblies are provisioned, removed ones torn down. On kept
    /// assemblies new services are registered and vanished ones are marked
    /// orphaned, for the planner to stop and delete.
    ///
    /// # Errors
    ///
    /// Returns an error when the topology does not validate; nothing changes
    /// in that case.
    pub fn reload(&mut self, topology: Topology) -> Result<()> {
        let default = self.config.default_transport.clone();
        topology.validate(&self.transports, &default)?;
        info!(assemblies = topology.assemblies.len(), "reloading topology");

        for name in self.registry.assembly_names() {
            let kept = match (topology.assembly(&name), self.registry.assembly(&name)) {
                (Some(spec), Some(current)) => spec.transport_kind(&default) == current.transport_kind,
                _ => false,
            };
            if !kept {
                self.remove_assembly(&name);
            }
        }

        for spec in &topology.assemblies {
            if self.registry.assembly(&spec.name).is_some() {
                self.sync_resources(spec);
            } else {
                info!(assembly = %spec.name, "assembly added");
                self.registry.add_assembly(spec, &default);
                self.provision(&spec.name);
            }
        }

        self.topology = topology;
        self.schedule_processing();
        Ok(())
    }

    fn sync_resources(&mut self, spec: &AssemblySpec) {
        let wanted: BTreeSet<String> = spec
            .services
            .iter()
            .map(|service| resource_name(&spec.name, &service.name))
            .collect();

        for name in self.registry.resource_names_of(&spec.name) {
            if wanted.contains(&name) {
                continue;
            }
            match self.registry.resource_mut(&name) {
                Some(resource) if !resource.orphaned => {
                    info!(resource = %name, "resource orphaned, waiting for its delete");
                    resource.orphaned = true;
                }
                _ => {}
            }
        }

        for service in &spec.services {
            let name = resource_name(&spec.name, &service.name);
            match self.registry.resource_mut(&name) {
                Some(resource) => resource.update(service),
                None => {
                    info!(resource = %name, "resource added");
                    self.registry.add_resource(&spec.name, service);
                }
            }
        }
    }

    /// Disconnect every assembly and stop the loop.
    pub fn shutdown(&mut self) {
        info!("engine shutting down");
        self.stopping = true;
        if let Some(timer) = self.processing_timer.take() {
            self.mainloop.cancel_timer(timer);
        }
        self.processing_pending = false;
        for name in self.registry.assembly_names() {
            self.set_assembly_state(&name, RecoveryState::Stopped, "engine shutting down");
            self.disconnect(&name);
            self.drop_transport(&name);
        }
    }

    /// Render the current status snapshot.
    #[must_use]
    pub fn status_snapshot(&self) -> StatusSnapshot {
        StatusSnapshot::render(&self.crmd_uuid, &self.registry, &self.history)
    }

    pub(crate) fn set_resource_state(&mut self, name: &str, state: RecoveryState, reason: &str) {
        let now = self.mainloop.now();
        let Some(resource) = self.registry.resource_mut(name) else {
            return;
        };
        let Some(change) = resource.recovery.set_state(state, now) else {
            return;
        };
        let assembly = resource.assembly.clone();
        info!(
            resource = %name,
            from = %change.from,
            to = %change.to,
            reason,
            "resource state changed"
        );
        self.sink.emit(&RecoveryEvent::for_resource(
            &self.registry.application.name,
            &assembly,
            name,
            state,
            reason,
        ));

        match change.remedy {
            Some(Remedy::Restart) => self.schedule_processing(),
            Some(Remedy::Escalate) => {
                warn!(resource = %name, assembly = %assembly, "resource failing repeatedly, escalating");
                let reason = format!("resource {name} escalated");
                self.set_assembly_state(&assembly, RecoveryState::Failed, &reason);
            }
            None => {}
        }
    }

    pub(crate) fn set_assembly_state(&mut self, name: &str, state: RecoveryState, reason: &str) {
        let now = self.mainloop.now();
        let Some(assembly) = self.registry.assembly_mut(name) else {
            return;
        };
        let Some(change) = assembly.recovery.set_state(state, now) else {
            return;
        };
        info!(
            assembly = %name,
            from = %change.from,
            to = %change.to,
            reason,
            "assembly state changed"
        );
        self.sink.emit(&RecoveryEvent::for_assembly(
            &self.registry.application.name,
            name,
            state,
            reason,
        ));

        match change.remedy {
            Some(Remedy::Restart) => self.restart_assembly(name),
            Some(Remedy::Escalate) => self.escalate_assembly(name),
            None => {}
        }
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub const fn topology(&self) -> &Topology {
        &self.topology
    }

    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub const fn history(&self) -> &OperationHistory {
        &self.history
    }

    #[must_use]
    pub const fn application(&self) -> &Application {
        &self.registry.application
    }

    #[must_use]
    pub fn crmd_uuid(&self) -> &str {
        &self.crmd_uuid
    }

    /// Current loop time.
    #[must_use]
    pub const fn now(&self) -> Duration {
        self.mainloop.now()
    }

    #[must_use]
    pub fn assembly_state(&self, name: &str) -> Option<RecoveryState> {
        self.registry.assembly(name).map(|assembly| assembly.state())
    }

    #[must_use]
    pub fn resource_state(&self, name: &str) -> Option<RecoveryState> {
        self.registry.resource(name).map(|resource| resource.state())
    }

    /// Check if a planning pass is pending.
    #[must_use]
    pub const fn processing_scheduled(&self) -> bool {
        self.processing_pending
    }
}

impl Reactor for Engine {
    type Command = EngineCommand;

    fn mainloop(&mut self) -> &mut Mainloop<Self> {
        &mut self.mainloop
    }

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Deliver { assembly, input } => self.deliver(&assembly, input),
            EngineCommand::Reload(topology) => {
                if let Err(e) = self.reload(*topology) {
                    error!(error = %e, "topology reload rejected");
                }
            }
            EngineCommand::Shutdown => self.shutdown(),
        }
    }

    fn should_stop(&self) -> bool {
        self.stopping
    }
}
