//! Assembly lifecycle: provisioning, connecting, restarting and tearing down
//! the node a transport talks to.

use std::time::Duration;

use cape_core::{OcfExitCode, OpHandle, RecoveryState, ResultExt};
use cape_mainloop::{Mainloop, Priority, TimerId};
use cape_transport::{Transport, TransportContext, TransportInput, Wakeup};
use tracing::{debug, error, info, warn};

use super::Engine;
use crate::provider::InstanceState;

/// Something a transport reported while it ran.
enum NodeOutput {
    Completed(OpHandle, OcfExitCode),
    State(RecoveryState, String),
}

/// The [`TransportContext`] handed to one assembly's transport.
///
/// Callbacks are queued on the loop tagged with the transport generation.
/// Completions and state reports are buffered and applied once the
/// transport call returns.
pub(super) struct NodeContext<'a> {
    assembly: &'a str,
    generation: u64,
    mainloop: &'a mut Mainloop<Engine>,
    outputs: Vec<NodeOutput>,
}

impl TransportContext for NodeContext<'_> {
    fn now(&self) -> Duration {
        self.mainloop.now()
    }

    fn defer(&mut self, priority: Priority, wakeup: Wakeup) {
        let name = self.assembly.to_string();
        let generation = self.generation;
        self.mainloop.add_job(priority, move |engine: &mut Engine| {
            engine.transport_wakeup(&name, generation, wakeup);
        });
    }

    fn start_timer(&mut self, priority: Priority, after: Duration, wakeup: Wakeup) -> TimerId {
        let name = self.assembly.to_string();
        let generation = self.generation;
        self.mainloop
            .add_timer(priority, after, move |engine: &mut Engine| {
                engine.transport_wakeup(&name, generation, wakeup);
            })
    }

    fn cancel_timer(&mut self, timer: TimerId) {
        self.mainloop.cancel_timer(timer);
    }

    fn action_completed(&mut self, op: OpHandle, rc: OcfExitCode) {
        self.outputs.push(NodeOutput::Completed(op, rc));
    }

    fn node_state(&mut self, state: RecoveryState, reason: &str) {
        self.outputs.push(NodeOutput::State(state, reason.to_string()));
    }
}

impl Engine {
    /// Run `f` against the transport of `name`, then apply what it reported.
    /// Returns `None` when the assembly has no transport.
    pub(super) fn with_transport<R>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut dyn Transport, &mut NodeContext<'_>) -> R,
    ) -> Option<R> {
        let assembly = self.registry.assembly_mut(name)?;
        let generation = assembly.generation;
        let transport = assembly.transport.as_mut()?;
        let mut ctx = NodeContext {
            assembly: name,
            generation,
            mainloop: &mut self.mainloop,
            outputs: Vec::new(),
        };
        let result = f(transport.as_mut(), &mut ctx);
        let outputs = ctx.outputs;

        for output in outputs {
            match output {
                NodeOutput::State(state, reason) => self.node_reported(name, state, &reason),
                NodeOutput::Completed(op, rc) => self.resource_action_completed(op, rc),
            }
        }
        Some(result)
    }

    fn transport_wakeup(&mut self, name: &str, generation: u64, wakeup: Wakeup) {
        let current = self.registry.assembly(name).map(|assembly| assembly.generation);
        if current != Some(generation) {
            debug!(assembly = name, %wakeup, "wakeup for a dropped transport");
            return;
        }
        self.with_transport(name, |transport, ctx| transport.wakeup(wakeup, ctx));
    }

    /// Hand bus traffic to the transport of `name`.
    pub(super) fn deliver(&mut self, name: &str, input: TransportInput) {
        if self
            .with_transport(name, |transport, ctx| transport.deliver(input, ctx))
            .is_none()
        {
            warn!(assembly = name, "inbound traffic for an assembly without transport");
        }
    }

    /// Ask the provider for an instance and start polling it.
    pub(super) fn provision(&mut self, name: &str) {
        let now = self.mainloop.now();
        let Some(assembly) = self.registry.assembly_mut(name) else {
            return;
        };
        if !assembly.provisioning.is_running() {
            assembly.provisioning.start(now);
        }

        match self.provider.create_instance(assembly) {
            Ok(instance_id) => {
                info!(assembly = name, instance = %instance_id, "instance requested");
                assembly.instance_id = Some(instance_id);
                self.set_assembly_state(name, RecoveryState::Unknown, "provisioning");
                self.arm_poll(name, Duration::ZERO, Self::poll_instance);
            }
            Err(e) => {
                warn!(assembly = name, error = %e, "instance request failed, retrying");
                let retry = self.config.pending_poll_interval();
                self.arm_poll(name, retry, Self::provision);
            }
        }
    }

    fn arm_poll(&mut self, name: &str, after: Duration, poll: fn(&mut Self, &str)) {
        let owned = name.to_string();
        let timer = self
            .mainloop
            .add_timer(Priority::Med, after, move |engine: &mut Self| {
                if let Some(assembly) = engine.registry.assembly_mut(&owned) {
                    assembly.poll_timer = None;
                }
                poll(engine, &owned);
            });
        match self.registry.assembly_mut(name) {
            Some(assembly) => {
                if let Some(previous) = assembly.poll_timer.replace(timer) {
                    self.mainloop.cancel_timer(previous);
                }
            }
            None => {
                self.mainloop.cancel_timer(timer);
            }
        }
    }

    fn poll_instance(&mut self, name: &str) {
        let Some(instance_id) = self
            .registry
            .assembly(name)
            .and_then(|assembly| assembly.instance_id.clone())
        else {
            return;
        };

        match self.provider.instance_state(&instance_id) {
            Ok(InstanceState::Pending) => {
                debug!(assembly = name, instance = %instance_id, "instance pending");
                let retry = self.config.pending_poll_interval();
                self.arm_poll(name, retry, Self::poll_instance);
            }
            Err(e) => {
                warn!(assembly = name, error = %e, "instance state unavailable, polling again");
                let retry = self.config.pending_poll_interval();
                self.arm_poll(name, retry, Self::poll_instance);
            }
            Ok(InstanceState::Running { address }) => {
                let now = self.mainloop.now();
                if let Some(assembly) = self.registry.assembly_mut(name) {
                    let took = assembly.provisioning.stop(now);
                    info!(assembly = name, %address, took = ?took, "instance running");
                    assembly.address = Some(address);
                    assembly.connecting.start(now);
                }
                self.connect_assembly(name);
            }
            Ok(InstanceState::Failed { reason }) => {
                let now = self.mainloop.now();
                if let Some(assembly) = self.registry.assembly_mut(name) {
                    assembly.provisioning.stop(now);
                }
                let reason = format!("provisioning failed: {reason}");
                self.set_assembly_state(name, RecoveryState::Failed, &reason);
            }
        }
    }

    /// Create the transport if needed and start connecting.
    fn connect_assembly(&mut self, name: &str) {
        let Some(assembly) = self.registry.assembly_mut(name) else {
            return;
        };
        if assembly.transport.is_none() {
            let Some(factory) = self.transports.get(&assembly.transport_kind) else {
                let reason = format!("no '{}' transport", assembly.transport_kind);
                error!(assembly = name, %reason, "cannot connect");
                self.set_assembly_state(name, RecoveryState::Unrecoverable, &reason);
                return;
            };
            debug!(assembly = name, kind = factory.kind(), "creating transport");
            assembly.transport = Some(factory.create(&assembly.node_info()));
        }
        self.with_transport(name, |transport, ctx| transport.connect(ctx));
    }

    /// Take a liveness report from a transport.
    fn node_reported(&mut self, name: &str, state: RecoveryState, reason: &str) {
        let now = self.mainloop.now();
        let Some(assembly) = self.registry.assembly_mut(name) else {
            return;
        };
        if self.stopping || assembly.state() == RecoveryState::Unrecoverable {
            debug!(assembly = name, %state, "report ignored");
            return;
        }
        if state == RecoveryState::Running && assembly.connecting.is_running() {
            let took = assembly.connecting.stop(now);
            info!(assembly = name, took = ?took, "assembly connected");
        }
        self.set_assembly_state(name, state, reason);
        if state == RecoveryState::Running {
            self.schedule_processing();
        }
    }

    /// Throw the instance away and provision a fresh one.
    pub(super) fn restart_assembly(&mut self, name: &str) {
        warn!(assembly = name, "restarting assembly");
        self.disconnect(name);
        self.reset_resources(name, true);
        self.destroy_instance(name);
        self.drop_transport(name);
        if let Some(assembly) = self.registry.assembly_mut(name) {
            assembly.address = None;
        }
        self.provision(name);
    }

    /// Give up on an assembly for good.
    pub(super) fn escalate_assembly(&mut self, name: &str) {
        error!(assembly = name, "assembly failing repeatedly, giving up");
        self.set_assembly_state(name, RecoveryState::Unrecoverable, "escalated");
        self.disconnect(name);
        self.reset_resources(name, false);
        self.drop_transport(name);
    }

    /// Tear down an assembly that left the topology.
    pub(super) fn remove_assembly(&mut self, name: &str) {
        info!(assembly = name, "assembly removed");
        self.set_assembly_state(name, RecoveryState::Stopped, "removed from topology");
        self.disconnect(name);
        for resource in self.registry.resource_names_of(name) {
            self.recurring_monitor_stop(&resource);
            self.history.remove_resource(&resource);
        }
        self.destroy_instance(name);
        self.drop_transport(name);
        self.registry.remove_assembly(name);
    }

    /// Stop polling and close the connection. In-flight actions complete
    /// with an error.
    pub(super) fn disconnect(&mut self, name: &str) {
        if let Some(timer) = self
            .registry
            .assembly_mut(name)
            .and_then(|assembly| assembly.poll_timer.take())
        {
            self.mainloop.cancel_timer(timer);
        }
        self.with_transport(name, |transport, ctx| transport.disconnect(ctx));
    }

    /// Drop the transport. Wakeups it queued are discarded when they fire.
    pub(super) fn drop_transport(&mut self, name: &str) {
        if let Some(assembly) = self.registry.assembly_mut(name) {
            assembly.transport = None;
            assembly.generation = assembly.generation.wrapping_add(1);
        }
    }

    fn reset_resources(&mut self, name: &str, forget_history: bool) {
        for resource in self.registry.resource_names_of(name) {
            self.recurring_monitor_stop(&resource);
            if forget_history {
                self.history.remove_resource(&resource);
            }
            self.set_resource_state(&resource, RecoveryState::Unknown, "assembly restarting");
        }
    }

    fn destroy_instance(&mut self, name: &str) {
        let Some(instance_id) = self
            .registry
            .assembly_mut(name)
            .and_then(|assembly| assembly.instance_id.take())
        else {
            return;
        };
        if self
            .provider
            .destroy_instance(&instance_id)
            .into_option_logged("destroying instance")
            .is_some()
        {
            info!(assembly = name, instance = %instance_id, "instance destroyed");
        }
    }
}
