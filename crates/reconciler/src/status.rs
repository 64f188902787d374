//! Status snapshot handed to the planner and to observers.
//!
//! One `node_state` per assembly with its membership flags and, per
//! resource, the operation history records. Transition fields echo the
//! operation that produced each record so the planner can match outcomes
//! to its graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cape_core::Method;

use crate::history::{HistoryEntry, OperationHistory};
use crate::registry::{Assembly, Registry, Resource};

/// Controller liveness as reported per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Crmd {
    Online,
    Offline,
}

/// Membership as reported per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Join {
    Member,
    Down,
}

/// One history record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpStatus {
    /// History key.
    pub id: String,
    pub operation: Method,
    pub call_id: u64,
    pub rc_code: i32,
    pub interval: u64,
    /// Seconds on the engine clock.
    pub last_run: u64,
    pub last_rc_change: u64,
    /// `action:graph:target:crmd_uuid`.
    pub transition_key: String,
    /// `0:rc:transition_key`.
    pub transition_magic: String,
    pub op_digest: String,
    pub op_status: i32,
}

impl OpStatus {
    fn from_entry(key: String, entry: &HistoryEntry, crmd_uuid: &str) -> Self {
        let transition_key = format!(
            "{}:{}:{}:{}",
            entry.action_id,
            entry.graph_id,
            entry.target.code(),
            crmd_uuid
        );
        Self {
            id: key,
            operation: entry.method,
            call_id: entry.call_id,
            rc_code: entry.rc.code(),
            interval: entry.interval_ms,
            last_run: entry.last_run.as_secs(),
            last_rc_change: entry.last_rc_change.as_secs(),
            transition_magic: format!("0:{}:{}", entry.rc.code(), transition_key),
            transition_key,
            op_digest: entry.digest.clone(),
            op_status: 0,
        }
    }
}

/// One resource with its history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Oldest call first.
    pub ops: Vec<OpStatus>,
}

impl ResourceStatus {
    fn render(resource: &Resource, history: &OperationHistory, crmd_uuid: &str) -> Self {
        let ops = history
            .for_resource(&resource.name)
            .into_iter()
            .map(|entry| {
                let key = format!("{}_{}_{}", entry.resource, entry.method, entry.interval_ms);
                OpStatus::from_entry(key, entry, crmd_uuid)
            })
            .collect();
        Self {
            id: resource.name.clone(),
            kind: resource.kind.clone(),
            class: resource.class.clone(),
            provider: resource.provider.clone(),
            ops,
        }
    }

    /// Most recent record.
    #[must_use]
    pub fn latest(&self) -> Option<&OpStatus> {
        self.ops.iter().max_by_key(|op| op.call_id)
    }

    /// Record of `method` at `interval`.
    #[must_use]
    pub fn op(&self, method: Method, interval: u64) -> Option<&OpStatus> {
        self.ops
            .iter()
            .find(|op| op.operation == method && op.interval == interval)
    }
}

/// One assembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub id: String,
    pub uname: String,
    pub ha: String,
    pub expected: String,
    pub in_ccm: bool,
    pub crmd: Crmd,
    pub join: Join,
    pub resources: Vec<ResourceStatus>,
}

impl NodeState {
    fn render(assembly: &Assembly, registry: &Registry, history: &OperationHistory, crmd_uuid: &str) -> Self {
        let online = assembly.is_running();
        Self {
            id: assembly.uuid.clone(),
            uname: assembly.name.clone(),
            ha: "active".to_string(),
            expected: "member".to_string(),
            in_ccm: online,
            crmd: if online { Crmd::Online } else { Crmd::Offline },
            join: if online { Join::Member } else { Join::Down },
            resources: registry
                .resources_of(&assembly.name)
                .map(|resource| ResourceStatus::render(resource, history, crmd_uuid))
                .collect(),
        }
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.crmd == Crmd::Online
    }

    #[must_use]
    pub fn resource(&self, id: &str) -> Option<&ResourceStatus> {
        self.resources.iter().find(|resource| resource.id == id)
    }
}

/// The whole application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub crmd_uuid: String,
    pub generated: DateTime<Utc>,
    pub nodes: Vec<NodeState>,
}

impl StatusSnapshot {
    #[must_use]
    pub fn render(crmd_uuid: &str, registry: &Registry, history: &OperationHistory) -> Self {
        Self {
            crmd_uuid: crmd_uuid.to_string(),
            generated: Utc::now(),
            nodes: registry
                .assemblies()
                .map(|assembly| NodeState::render(assembly, registry, history, crmd_uuid))
                .collect(),
        }
    }

    #[must_use]
    pub fn node(&self, uname: &str) -> Option<&NodeState> {
        self.nodes.iter().find(|node| node.uname == uname)
    }

    /// Find a resource on any node.
    #[must_use]
    pub fn resource(&self, id: &str) -> Option<&ResourceStatus> {
        self.nodes.iter().find_map(|node| node.resource(id))
    }
}
