//! Recurring monitors: one timer per resource, rescheduled on success and
//! dropped on failure or stop.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use cape_core::{Method, OcfExitCode, Operation};
use cape_reconciler::{
    AssemblySpec, Confirmation, PlanStep, Planner, ServiceSpec, StatusSnapshot, Topology, Verdict,
};
use common::Harness;

const ANGUS: &str = "rsc_bar_angus";
const MONITOR_KEY: &str = "rsc_bar_angus_monitor_1000";

fn topology() -> Topology {
    Topology::new("shop").with_assembly(
        AssemblySpec::new("bar")
            .with_service(ServiceSpec::new("angus", "httpd").with_monitor_interval(1)),
    )
}

fn monitor(action_id: u32) -> Operation {
    Operation::new("bar", ANGUS, Method::Monitor)
        .with_interval_ms(1_000)
        .with_ids(1, action_id)
}

/// Hands out one batch per pass.
struct BatchPlanner {
    batches: Vec<Vec<Operation>>,
    confirmations: Rc<RefCell<Vec<Confirmation>>>,
}

impl Planner for BatchPlanner {
    fn is_busy(&self) -> bool {
        false
    }

    fn plan(&mut self, _topology: &Topology, _snapshot: &StatusSnapshot) -> PlanStep {
        if self.batches.is_empty() {
            return PlanStep::done(Verdict::Complete);
        }
        PlanStep::new(self.batches.remove(0))
    }

    fn confirm(&mut self, confirmation: Confirmation) -> PlanStep {
        self.confirmations.borrow_mut().push(confirmation);
        PlanStep::default()
    }
}

fn harness(batches: Vec<Vec<Operation>>) -> Result<(Harness, Rc<RefCell<Vec<Confirmation>>>), String> {
    let confirmations = Rc::new(RefCell::new(Vec::new()));
    let planner = BatchPlanner {
        batches,
        confirmations: Rc::clone(&confirmations),
    };
    let mut h = Harness::with_planner(topology(), planner)?;
    h.world.borrow_mut().running.insert(ANGUS.to_string());
    h.engine.start();
    Ok((h, confirmations))
}

#[test]
fn test_second_start_shares_the_running_monitor() -> Result<(), String> {
    let (mut h, confirmations) = harness(vec![vec![monitor(0), monitor(1)]])?;
    h.advance_ms(500);

    assert_eq!(h.executed(MONITOR_KEY), 1);
    {
        let confirmations = confirmations.borrow();
        assert_eq!(confirmations.len(), 2);
        assert!(confirmations.iter().all(Confirmation::matched));
    }

    let resource = h.engine.registry().resource(ANGUS).ok_or("resource missing")?;
    let handle = resource.monitor().ok_or("no monitor")?;
    assert_eq!(handle.action_id, 0);
    assert_eq!(handle.refcount(), 1);
    assert!(resource.monitor_scheduled());
    Ok(())
}

#[test]
fn test_monitor_repeats_without_confirming() -> Result<(), String> {
    let (mut h, confirmations) = harness(vec![vec![monitor(0)]])?;
    h.advance_ms(3_500);

    // First run at 100ms, then one per second.
    assert_eq!(h.executed(MONITOR_KEY), 4);
    assert_eq!(confirmations.borrow().len(), 1);

    let resource = h.engine.registry().resource(ANGUS).ok_or("resource missing")?;
    assert_eq!(resource.monitor().map(|handle| handle.times_executed()), Some(4));
    Ok(())
}

#[test]
fn test_failed_monitor_stops_itself() -> Result<(), String> {
    let (mut h, _confirmations) = harness(vec![vec![monitor(0)]])?;
    h.advance_ms(500);
    h.crash(ANGUS);
    h.advance_ms(3_000);

    assert_eq!(h.executed(MONITOR_KEY), 2);
    let resource = h.engine.registry().resource(ANGUS).ok_or("resource missing")?;
    assert!(resource.monitor().is_none());
    assert!(!resource.monitor_scheduled());

    let entry = h.engine.history().get(MONITOR_KEY).ok_or("no history")?;
    assert_eq!(entry.rc, OcfExitCode::NotRunning);
    Ok(())
}

#[test]
fn test_stop_cancels_the_monitor() -> Result<(), String> {
    let stop = Operation::new("bar", ANGUS, Method::Stop).with_ids(2, 0);
    let (mut h, confirmations) = harness(vec![vec![monitor(0)], vec![stop]])?;
    h.advance_ms(500);
    h.engine.schedule_processing();
    h.advance_ms(3_000);

    assert_eq!(h.executed(MONITOR_KEY), 1);
    assert_eq!(h.executed("rsc_bar_angus_stop_0"), 1);
    assert!(!h.is_running(ANGUS));
    assert_eq!(confirmations.borrow().len(), 2);

    let resource = h.engine.registry().resource(ANGUS).ok_or("resource missing")?;
    assert!(resource.monitor().is_none());
    Ok(())
}
