//! The planner boundary.
//!
//! The engine hands the planner the topology and a status snapshot; the
//! planner answers with operations to run. Each operation's outcome is
//! confirmed back, and each confirmation may release further operations.
//! A [`Verdict`] ends a graph.

mod basic;

pub use basic::BasicPlanner;

use cape_core::{Method, OcfExitCode, Operation};

use crate::status::StatusSnapshot;
use crate::topology::Topology;

/// How a graph ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Every action reached its target.
    Complete,
    /// Some actions failed; another pass is needed.
    Partial,
    /// The graph finished but its results call for another pass.
    NeedsReevaluation,
}

/// Operations to run now, and the verdict once the graph is over.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanStep {
    pub actions: Vec<Operation>,
    pub verdict: Option<Verdict>,
}

impl PlanStep {
    #[must_use]
    pub const fn new(actions: Vec<Operation>) -> Self {
        Self {
            actions,
            verdict: None,
        }
    }

    #[must_use]
    pub const fn done(verdict: Verdict) -> Self {
        Self {
            actions: Vec::new(),
            verdict: Some(verdict),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.verdict.is_none()
    }
}

/// Outcome of one planned operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub graph_id: u32,
    pub action_id: u32,
    pub resource: String,
    pub method: Method,
    pub interval_ms: u64,
    pub rc: OcfExitCode,
    pub target: OcfExitCode,
}

impl Confirmation {
    #[must_use]
    pub fn new(op: &Operation, rc: OcfExitCode) -> Self {
        Self {
            graph_id: op.graph_id,
            action_id: op.action_id,
            resource: op.resource.clone(),
            method: op.method,
            interval_ms: op.interval_ms,
            rc,
            target: op.target,
        }
    }

    /// Check if the outcome was the expected one.
    #[must_use]
    pub fn matched(&self) -> bool {
        self.rc == self.target
    }
}

/// Computes the operations that move the application toward its topology.
pub trait Planner {
    /// Check if a graph still has unconfirmed operations.
    fn is_busy(&self) -> bool;

    /// Start a new graph from the current state.
    fn plan(&mut self, topology: &Topology, snapshot: &StatusSnapshot) -> PlanStep;

    /// Take the outcome of one operation of the current graph.
    fn confirm(&mut self, confirmation: Confirmation) -> PlanStep;
}

impl<P: Planner + ?Sized> Planner for Box<P> {
    fn is_busy(&self) -> bool {
        (**self).is_busy()
    }

    fn plan(&mut self, topology: &Topology, snapshot: &StatusSnapshot) -> PlanStep {
        (**self).plan(topology, snapshot)
    }

    fn confirm(&mut self, confirmation: Confirmation) -> PlanStep {
        (**self).confirm(confirmation)
    }
}
