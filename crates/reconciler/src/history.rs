//! Per-operation execution history.
//!
//! One entry per `{resource}_{method}_{interval}` key, created on the first
//! execution and updated in place afterwards. Every recorded execution takes
//! the next call id from a counter owned by the history.

use std::collections::BTreeMap;
use std::time::Duration;

use itertools::Itertools;

use cape_core::{Method, OcfExitCode, Operation};
use tracing::{debug, info};

/// Last known outcome of one operation key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub resource: String,
    pub method: Method,
    pub interval_ms: u64,
    pub rc: OcfExitCode,
    pub target: OcfExitCode,
    pub last_run: Duration,
    /// Last time `rc` differed from the previous outcome.
    pub last_rc_change: Duration,
    pub call_id: u64,
    pub graph_id: u32,
    pub action_id: u32,
    /// Parameter digest of the last execution.
    pub digest: String,
}

impl HistoryEntry {
    /// Check if the last outcome was the expected one.
    #[must_use]
    pub fn matched(&self) -> bool {
        self.rc == self.target
    }
}

/// What recording an outcome changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    Created,
    Updated { rc_changed: bool, drifted: bool },
}

/// All entries, keyed by history key.
#[derive(Debug, Clone, Default)]
pub struct OperationHistory {
    entries: BTreeMap<String, HistoryEntry>,
    last_call_id: u64,
}

impl OperationHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of an execution of `op` at `now`.
    pub fn record(&mut self, op: &Operation, rc: OcfExitCode, now: Duration) -> Recorded {
        self.last_call_id = self.last_call_id.saturating_add(1);
        let call_id = self.last_call_id;
        let key = op.history_key();
        let digest = op.digest();

        let Some(entry) = self.entries.get_mut(&key) else {
            debug!(key = %key, rc = %rc, call_id, "new history entry");
            self.entries.insert(
                key,
                HistoryEntry {
                    resource: op.resource.clone(),
                    method: op.method,
                    interval_ms: op.interval_ms,
                    rc,
                    target: op.target,
                    last_run: now,
                    last_rc_change: now,
                    call_id,
                    graph_id: op.graph_id,
                    action_id: op.action_id,
                    digest,
                },
            );
            return Recorded::Created;
        };

        let rc_changed = entry.rc != rc;
        if rc_changed {
            entry.last_rc_change = now;
        }
        let drifted = entry.digest != digest;
        if drifted {
            info!(key = %key, "parameters changed since the last run");
            entry.digest = digest;
        }
        entry.rc = rc;
        entry.target = op.target;
        entry.last_run = now;
        entry.call_id = call_id;
        entry.graph_id = op.graph_id;
        entry.action_id = op.action_id;
        Recorded::Updated {
            rc_changed,
            drifted,
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&HistoryEntry> {
        self.entries.get(key)
    }

    /// Entries of one resource, oldest call first.
    #[must_use]
    pub fn for_resource(&self, resource: &str) -> Vec<&HistoryEntry> {
        self.entries
            .values()
            .filter(|entry| entry.resource == resource)
            .sorted_by_key(|entry| entry.call_id)
            .collect()
    }

    /// Drop every entry of `resource`; returns how many went.
    pub fn remove_resource(&mut self, resource: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.resource != resource);
        before.saturating_sub(self.entries.len())
    }

    #[must_use]
    pub const fn last_call_id(&self) -> u64 {
        self.last_call_id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::collections::BTreeMap;

    use super::*;

    fn monitor(interval_ms: u64) -> Operation {
        Operation::new("bar", "rsc_bar_angus", Method::Monitor)
            .with_agent("lsb", "httpd", None)
            .with_interval_ms(interval_ms)
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_create_then_update_in_place() {
        let mut history = OperationHistory::new();
        assert_eq!(history.record(&monitor(1000), OcfExitCode::Ok, secs(1)), Recorded::Created);
        assert_eq!(
            history.record(&monitor(1000), OcfExitCode::Ok, secs(2)),
            Recorded::Updated {
                rc_changed: false,
                drifted: false
            }
        );
        assert_eq!(history.len(), 1);

        let entry = history.get("rsc_bar_angus_monitor_1000").unwrap();
        assert_eq!(entry.last_run, secs(2));
        assert_eq!(entry.last_rc_change, secs(1));
        assert!(entry.matched());
    }

    #[test]
    fn test_rc_change_tracking() {
        let mut history = OperationHistory::new();
        history.record(&monitor(1000), OcfExitCode::Ok, secs(1));
        history.record(&monitor(1000), OcfExitCode::NotRunning, secs(5));
        history.record(&monitor(1000), OcfExitCode::NotRunning, secs(6));

        let entry = history.get("rsc_bar_angus_monitor_1000").unwrap();
        assert_eq!(entry.rc, OcfExitCode::NotRunning);
        assert_eq!(entry.last_rc_change, secs(5));
        assert_eq!(entry.last_run, secs(6));
        assert!(!entry.matched());
    }

    #[test]
    fn test_digest_drift_replaces_digest() {
        let mut history = OperationHistory::new();
        history.record(&monitor(0), OcfExitCode::Ok, secs(1));
        let before = history.get("rsc_bar_angus_monitor_0").unwrap().digest.clone();

        let params = BTreeMap::from([("port".to_string(), "8080".to_string())]);
        let drifted = monitor(0).with_params(params);
        assert_eq!(
            history.record(&drifted, OcfExitCode::Ok, secs(2)),
            Recorded::Updated {
                rc_changed: false,
                drifted: true
            }
        );
        let after = &history.get("rsc_bar_angus_monitor_0").unwrap().digest;
        assert_ne!(&before, after);
        assert_eq!(after, &drifted.digest());
    }

    #[test]
    fn test_call_ids_increase_across_keys() {
        let mut history = OperationHistory::new();
        history.record(&monitor(0), OcfExitCode::NotRunning, secs(1));
        let start = Operation::new("bar", "rsc_bar_angus", Method::Start);
        history.record(&start, OcfExitCode::Ok, secs(2));
        history.record(&monitor(1000), OcfExitCode::Ok, secs(3));
        history.record(&monitor(0), OcfExitCode::Ok, secs(4));

        let ids: Vec<u64> = history
            .for_resource("rsc_bar_angus")
            .iter()
            .map(|entry| entry.call_id)
            .collect();
        assert_eq!(ids, vec![2, 3, 4]);
        assert_eq!(history.last_call_id(), 4);
    }

    #[test]
    fn test_remove_resource() {
        let mut history = OperationHistory::new();
        history.record(&monitor(0), OcfExitCode::Ok, secs(1));
        history.record(&monitor(1000), OcfExitCode::Ok, secs(1));
        history.record(
            &Operation::new("bar", "rsc_bar_db", Method::Start),
            OcfExitCode::Ok,
            secs(1),
        );

        assert_eq!(history.remove_resource("rsc_bar_angus"), 2);
        assert_eq!(history.len(), 1);
        assert!(history.for_resource("rsc_bar_angus").is_empty());
        // call ids keep counting after removal
        history.record(&monitor(0), OcfExitCode::Ok, secs(2));
        assert_eq!(history.get("rsc_bar_angus_monitor_0").unwrap().call_id, 4);
    }
}
