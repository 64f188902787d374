//! A graph planner that works one chain of operations per resource.
//!
//! Each resource on an online assembly gets at most one chain, decided from
//! the most recent record in its history. Chains run side by side with one
//! operation in flight each; an outcome other than the target aborts the
//! rest of its chain.

use std::collections::VecDeque;

use cape_core::{Method, OcfExitCode, Operation};
use tracing::{debug, info};

use super::{Confirmation, PlanStep, Planner, Verdict};
use crate::status::{NodeState, ResourceStatus, StatusSnapshot};
use crate::topology::{ServiceSpec, Topology, resource_name};

/// What a resource needs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Probe,
    Start,
    Monitor,
    Restart,
    Remove,
    Nothing,
}

fn decide(resource: &ResourceStatus) -> Next {
    let Some(latest) = resource.latest() else {
        return Next::Probe;
    };
    let rc = OcfExitCode::from_agent(latest.rc_code);
    if rc.is_hard_error() {
        return Next::Nothing;
    }
    let ok = rc == OcfExitCode::Ok;
    match latest.operation {
        Method::Monitor if latest.interval == 0 => match rc {
            OcfExitCode::NotRunning => Next::Start,
            OcfExitCode::Ok => Next::Monitor,
            _ => Next::Restart,
        },
        Method::Monitor if ok => Next::Nothing,
        Method::Start if ok => Next::Monitor,
        Method::Stop if ok => Next::Start,
        Method::Monitor | Method::Start | Method::Stop => Next::Restart,
        Method::Delete => Next::Nothing,
    }
}

#[derive(Debug)]
struct Chain {
    resource: String,
    steps: VecDeque<Operation>,
    in_flight: Option<u32>,
    aborted: bool,
    /// The chain only gathers facts; its results need another pass.
    reevaluate: bool,
}

impl Chain {
    fn issue(&mut self, graph_id: u32, next_action_id: &mut u32) -> Option<Operation> {
        let mut op = self.steps.pop_front()?;
        let action_id = *next_action_id;
        *next_action_id = next_action_id.wrapping_add(1);
        op.graph_id = graph_id;
        op.action_id = action_id;
        self.in_flight = Some(action_id);
        Some(op)
    }
}

/// Builds the operations for one resource.
struct Agent<'a> {
    host: &'a str,
    resource: &'a ResourceStatus,
    service: Option<&'a ServiceSpec>,
}

impl Agent<'_> {
    fn op(&self, method: Method, interval_ms: u64, target: OcfExitCode) -> Operation {
        let op = Operation::new(self.host, &self.resource.id, method)
            .with_agent(
                &self.resource.class,
                &self.resource.kind,
                self.resource.provider.clone(),
            )
            .with_interval_ms(interval_ms)
            .with_target(target);
        match self.service {
            Some(service) => op
                .with_agent(&service.class, &service.kind, service.provider.clone())
                .with_timeout_ms(service.timeout_ms())
                .with_params(service.params()),
            None => op,
        }
    }

    fn monitor_interval_ms(&self) -> u64 {
        self.service.map_or(0, ServiceSpec::monitor_interval_ms)
    }

    fn start_and_monitor(&self, steps: &mut VecDeque<Operation>) {
        steps.push_back(self.op(Method::Start, 0, OcfExitCode::Ok));
        self.monitor(steps);
    }

    fn monitor(&self, steps: &mut VecDeque<Operation>) {
        let interval = self.monitor_interval_ms();
        if interval > 0 {
            steps.push_back(self.op(Method::Monitor, interval, OcfExitCode::Ok));
        }
    }

    fn chain(&self, next: Next) -> Option<Chain> {
        let mut steps = VecDeque::new();
        match next {
            Next::Probe => steps.push_back(self.op(Method::Monitor, 0, OcfExitCode::NotRunning)),
            Next::Start => self.start_and_monitor(&mut steps),
            Next::Monitor => self.monitor(&mut steps),
            Next::Restart => {
                steps.push_back(self.op(Method::Stop, 0, OcfExitCode::Ok));
                self.start_and_monitor(&mut steps);
            }
            Next::Remove => {
                steps.push_back(self.op(Method::Stop, 0, OcfExitCode::Ok));
                steps.push_back(self.op(Method::Delete, 0, OcfExitCode::Ok));
            }
            Next::Nothing => {}
        }
        if steps.is_empty() {
            return None;
        }
        debug!(resource = %self.resource.id, ?next, steps = steps.len(), "planned chain");
        Some(Chain {
            resource: self.resource.id.clone(),
            steps,
            in_flight: None,
            aborted: false,
            reevaluate: next == Next::Probe,
        })
    }
}

/// Reference planner: check, start, monitor, and restart on failure.
#[derive(Debug, Default)]
pub struct BasicPlanner {
    graph_id: u32,
    next_action_id: u32,
    chains: Vec<Chain>,
}

impl BasicPlanner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the current graph.
    #[must_use]
    pub const fn graph_id(&self) -> u32 {
        self.graph_id
    }

    fn chains_for_node(node: &NodeState, topology: &Topology) -> Vec<Chain> {
        let assembly = topology.assembly(&node.uname);
        node.resources
            .iter()
            .filter_map(|resource| {
                let service = assembly.and_then(|assembly| {
                    assembly
                        .services
                        .iter()
                        .find(|service| resource_name(&assembly.name, &service.name) == resource.id)
                });
                let next = if service.is_some() {
                    decide(resource)
                } else {
                    Next::Remove
                };
                Agent {
                    host: &node.uname,
                    resource,
                    service,
                }
                .chain(next)
            })
            .collect()
    }

    fn verdict(&self) -> Verdict {
        if self.chains.iter().any(|chain| chain.aborted) {
            Verdict::Partial
        } else if self.chains.iter().any(|chain| chain.reevaluate) {
            Verdict::NeedsReevaluation
        } else {
            Verdict::Complete
        }
    }
}

impl Planner for BasicPlanner {
    fn is_busy(&self) -> bool {
        self.chains.iter().any(|chain| chain.in_flight.is_some())
    }

    fn plan(&mut self, topology: &Topology, snapshot: &StatusSnapshot) -> PlanStep {
        self.graph_id = self.graph_id.wrapping_add(1);
        self.next_action_id = 0;
        self.chains = snapshot
            .nodes
            .iter()
            .filter(|node| node.is_online())
            .flat_map(|node| Self::chains_for_node(node, topology))
            .collect();

        if self.chains.is_empty() {
            debug!(graph = self.graph_id, "nothing to do");
            return PlanStep::done(Verdict::Complete);
        }

        let graph_id = self.graph_id;
        let mut actions = Vec::with_capacity(self.chains.len());
        for chain in &mut self.chains {
            actions.extend(chain.issue(graph_id, &mut self.next_action_id));
        }
        info!(graph = graph_id, chains = self.chains.len(), "new transition graph");
        PlanStep::new(actions)
    }

    fn confirm(&mut self, confirmation: Confirmation) -> PlanStep {
        if confirmation.graph_id != self.graph_id {
            debug!(
                graph = confirmation.graph_id,
                current = self.graph_id,
                "confirmation for an old graph"
            );
            return PlanStep::default();
        }
        let Some(chain) = self
            .chains
            .iter_mut()
            .find(|chain| chain.in_flight == Some(confirmation.action_id))
        else {
            debug!(action = confirmation.action_id, "confirmation for no pending action");
            return PlanStep::default();
        };

        chain.in_flight = None;
        if !confirmation.matched() {
            info!(
                resource = %chain.resource,
                method = %confirmation.method,
                rc = %confirmation.rc,
                target = %confirmation.target,
                "action missed its target, chain aborted"
            );
            chain.aborted = true;
            chain.steps.clear();
        }

        let graph_id = self.graph_id;
        let actions: Vec<_> = chain.issue(graph_id, &mut self.next_action_id).into_iter().collect();
        if self.is_busy() {
            return PlanStep::new(actions);
        }
        let verdict = self.verdict();
        info!(graph = graph_id, ?verdict, "transition graph finished");
        PlanStep {
            actions,
            verdict: Some(verdict),
        }
    }
}
