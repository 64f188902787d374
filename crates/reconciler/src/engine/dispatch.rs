//! Running planned operations and taking their outcomes back.

use cape_core::{Method, OcfExitCode, OpHandle, Operation, RecoveryState, state_for_outcome};
use cape_mainloop::Priority;
use tracing::{debug, error, info, warn};

use super::Engine;
use crate::registry::Assembly;

impl Engine {
    /// Route one planned operation.
    ///
    /// Operations that cannot run are confirmed with an error right away so
    /// the planner never waits on them.
    pub(super) fn dispatch(&mut self, op: Operation) {
        let op = OpHandle::new(op);
        debug!(op = %*op, "dispatching");

        let Some(running) = self.registry.assembly(&op.hostname).map(Assembly::is_running) else {
            error!(op = %*op, "operation for an unknown assembly");
            self.confirm(&op, OcfExitCode::UnknownError);
            return;
        };
        match self.registry.resource(&op.resource) {
            None => {
                error!(op = %*op, "operation for an unknown resource");
                self.confirm(&op, OcfExitCode::UnknownError);
                return;
            }
            Some(resource) if resource.assembly != op.hostname => {
                warn!(
                    op = %*op,
                    owner = %resource.assembly,
                    "resource lives on another assembly"
                );
                let rc = if op.method == Method::Monitor {
                    OcfExitCode::NotRunning
                } else {
                    OcfExitCode::UnknownError
                };
                self.confirm(&op, rc);
                return;
            }
            Some(_) => {}
        }

        if op.method == Method::Delete {
            self.op_history_delete_for_resource(op);
            return;
        }
        if !running {
            warn!(op = %*op, "assembly not running");
            self.confirm(&op, OcfExitCode::UnknownError);
            return;
        }

        match op.method {
            Method::Monitor if op.is_recurring() => self.recurring_monitor_start(op),
            Method::Stop => {
                self.recurring_monitor_stop(&op.resource);
                self.execute(op);
            }
            _ => self.execute(op),
        }
    }

    /// Hand an operation to the transport of its assembly.
    fn execute(&mut self, op: OpHandle) {
        op.start_timing(self.mainloop.now());
        let connected = self
            .registry
            .assembly(&op.hostname)
            .is_some_and(Assembly::has_transport);
        if !connected {
            warn!(op = %*op, "no transport");
            self.resource_action_completed(op, OcfExitCode::UnknownError);
            return;
        }
        let name = op.hostname.clone();
        self.with_transport(&name, move |transport, ctx| transport.resource_action(op, ctx));
    }

    /// Take the outcome of an execution.
    ///
    /// One-shot operations, and the first run of a recurring one, are
    /// confirmed to the planner. Every run updates history and the resource
    /// state.
    pub(super) fn resource_action_completed(&mut self, op: OpHandle, rc: OcfExitCode) {
        let now = self.mainloop.now();
        let first = op.mark_executed() == 1;
        let took = op.stop_timing(now);
        let confirm_now = !op.is_recurring() || first;
        debug!(op = %*op, %rc, took = ?took, "action completed");

        let Some(running) = self.registry.assembly(&op.hostname).map(Assembly::is_running) else {
            warn!(op = %*op, "completion for an unknown assembly");
            if confirm_now {
                self.confirm(&op, OcfExitCode::UnknownError);
            }
            return;
        };
        if self.registry.resource(&op.resource).is_none() {
            warn!(op = %*op, "completion for an unknown resource");
            if confirm_now {
                self.confirm(&op, OcfExitCode::UnknownError);
            }
            return;
        }

        if !running {
            info!(op = %*op, %rc, "assembly went down, outcome discarded");
            self.set_resource_state(&op.resource, RecoveryState::Unknown, "assembly not running");
            if confirm_now {
                self.confirm(&op, OcfExitCode::UnknownError);
            }
            self.schedule_processing();
            return;
        }

        if self.registry.owns(&op.hostname, &op.resource) {
            self.history.record(&op, rc, now);
        } else {
            warn!(op = %*op, "resource not owned by this assembly, history untouched");
        }
        if confirm_now {
            self.confirm(&op, rc);
        }
        if let Some(state) = state_for_outcome(op.method, rc, op.interval_ms) {
            self.set_resource_state(&op.resource, state, rc.reason());
        }
        if rc != op.target {
            info!(op = %*op, %rc, target = %op.target, "action missed its target");
            self.schedule_processing();
        }
        if op.is_recurring() {
            self.monitor_completed(op, rc);
        }
    }

    /// Start a recurring monitor unless one already runs for the resource.
    fn recurring_monitor_start(&mut self, op: OpHandle) {
        let Some(resource) = self.registry.resource_mut(&op.resource) else {
            self.confirm(&op, OcfExitCode::UnknownError);
            return;
        };
        if resource.monitor.is_some() {
            debug!(op = %*op, "recurring monitor already running");
            self.confirm(&op, OcfExitCode::Ok);
            op.release();
            return;
        }
        resource.monitor = Some(op.retain());
        self.execute(op);
    }

    /// Cancel the recurring monitor of a resource, if any.
    pub(super) fn recurring_monitor_stop(&mut self, name: &str) {
        let Some(resource) = self.registry.resource_mut(name) else {
            return;
        };
        if let Some(timer) = resource.monitor_timer.take() {
            self.mainloop.cancel_timer(timer);
        }
        if let Some(monitor) = resource.monitor.take() {
            debug!(resource = name, "recurring monitor stopped");
            monitor.release();
        }
    }

    /// Schedule the next run, or stop the monitor when it missed its target.
    fn monitor_completed(&mut self, op: OpHandle, rc: OcfExitCode) {
        let Some(resource) = self.registry.resource_mut(&op.resource) else {
            return;
        };
        if !resource.monitor.as_ref().is_some_and(|monitor| monitor.same_as(&op)) {
            debug!(op = %*op, "completion of a stopped monitor");
            return;
        }
        if rc != op.target {
            self.recurring_monitor_stop(&op.resource);
            return;
        }
        let name = op.resource.clone();
        let timer = self
            .mainloop
            .add_timer(Priority::Med, op.interval(), move |engine: &mut Self| {
                engine.monitor_due(&name);
            });
        resource.monitor_timer = Some(timer);
    }

    fn monitor_due(&mut self, name: &str) {
        let Some(resource) = self.registry.resource_mut(name) else {
            return;
        };
        resource.monitor_timer = None;
        let Some(monitor) = resource.monitor.as_ref().map(OpHandle::retain) else {
            return;
        };
        let running = self
            .registry
            .assembly(&monitor.hostname)
            .is_some_and(Assembly::is_running);
        if !running {
            debug!(resource = name, "assembly not running, monitor stopped");
            self.recurring_monitor_stop(name);
            return;
        }
        self.execute(monitor);
    }

    /// Forget everything about a resource. An orphaned resource leaves the
    /// registry with it.
    fn op_history_delete_for_resource(&mut self, op: OpHandle) {
        let removed = self.history.remove_resource(&op.resource);
        self.recurring_monitor_stop(&op.resource);
        if self
            .registry
            .resource(&op.resource)
            .is_some_and(|resource| resource.orphaned)
        {
            self.registry.remove_resource(&op.resource);
            info!(resource = %op.resource, "orphaned resource removed");
        }
        debug!(resource = %op.resource, removed, "history deleted");
        self.confirm(&op, OcfExitCode::Ok);
        op.release();
    }
}
