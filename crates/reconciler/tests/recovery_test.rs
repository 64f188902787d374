//! Failure handling end to end: resource restarts, escalation to the
//! assembly, and the assembly restart that follows.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

mod common;

use cape_core::RecoveryState;
use cape_reconciler::{AssemblySpec, ServiceSpec, Topology};
use common::Harness;

const ANGUS: &str = "rsc_bar_angus";

fn topology() -> Topology {
    Topology::new("shop").with_assembly(
        AssemblySpec::new("bar").with_service(
            ServiceSpec::new("angus", "httpd")
                .with_monitor_interval(1)
                .with_escalation("3", "10"),
        ),
    )
}

#[test]
fn test_start_checks_then_starts_and_monitors() -> Result<(), String> {
    let h = Harness::started(topology())?;

    assert_eq!(h.assembly_state("bar")?, RecoveryState::Running);
    assert_eq!(h.resource_state(ANGUS)?, RecoveryState::Running);
    assert!(h.is_running(ANGUS));
    assert_eq!(h.executed("rsc_bar_angus_monitor_0"), 1);
    assert_eq!(h.executed("rsc_bar_angus_start_0"), 1);
    assert_eq!(h.executed("rsc_bar_angus_monitor_1000"), 1);

    let resource = h
        .engine
        .registry()
        .resource(ANGUS)
        .ok_or("resource missing")?;
    assert!(resource.monitor_scheduled());
    Ok(())
}

#[test]
fn test_crashed_resource_is_restarted() -> Result<(), String> {
    let mut h = Harness::started(topology())?;

    h.crash(ANGUS);
    h.advance_ms(1_500);

    assert!(h.is_running(ANGUS));
    assert_eq!(h.resource_state(ANGUS)?, RecoveryState::Running);
    assert_eq!(h.executed("rsc_bar_angus_stop_0"), 1);
    assert_eq!(h.executed("rsc_bar_angus_start_0"), 2);
    assert_eq!(h.provider.instances.borrow().created.len(), 1);

    let failed = h
        .events
        .events()
        .iter()
        .filter(|event| event.resource.as_deref() == Some(ANGUS))
        .filter(|event| event.state == RecoveryState::Failed)
        .count();
    assert_eq!(failed, 1);
    Ok(())
}

#[test]
fn test_repeated_crashes_escalate_to_assembly_restart() -> Result<(), String> {
    let mut h = Harness::started(topology())?;

    for _ in 0..2 {
        h.crash(ANGUS);
        h.advance_ms(1_500);
        assert!(h.is_running(ANGUS));
    }
    assert_eq!(h.provider.instances.borrow().created.len(), 1);

    h.crash(ANGUS);
    h.advance_ms(1_500);

    {
        let instances = h.provider.instances.borrow();
        assert_eq!(instances.created, vec!["bar".to_string(), "bar".to_string()]);
        assert_eq!(instances.destroyed, vec!["i-1".to_string()]);
    }
    assert_eq!(h.world.borrow().connects, 2);

    let escalated = h.events.events().into_iter().any(|event| {
        event.assembly.as_deref() == Some("bar")
            && event.resource.is_none()
            && event.state == RecoveryState::Failed
            && event.reason.contains("escalated")
    });
    assert!(escalated);

    // The fresh instance is checked and the service started again.
    assert_eq!(h.assembly_state("bar")?, RecoveryState::Running);
    assert_eq!(h.resource_state(ANGUS)?, RecoveryState::Running);
    assert!(h.is_running(ANGUS));
    Ok(())
}

#[test]
fn test_failures_spread_out_never_escalate() -> Result<(), String> {
    let mut h = Harness::started(topology())?;

    for _ in 0..3 {
        h.crash(ANGUS);
        h.advance_ms(6_000);
    }

    assert_eq!(h.provider.instances.borrow().created.len(), 1);
    assert_eq!(h.executed("rsc_bar_angus_stop_0"), 3);
    assert!(h.is_running(ANGUS));
    Ok(())
}

#[test]
fn test_assembly_escalation_gives_up() -> Result<(), String> {
    let topology = Topology::new("shop").with_assembly(
        AssemblySpec::new("bar").with_escalation("1", "60").with_service(
            ServiceSpec::new("angus", "httpd")
                .with_monitor_interval(1)
                .with_escalation("1", "60"),
        ),
    );
    let mut h = Harness::started(topology)?;

    h.crash(ANGUS);
    h.advance_ms(2_000);

    assert_eq!(h.assembly_state("bar")?, RecoveryState::Unrecoverable);
    assert_eq!(h.provider.instances.borrow().created.len(), 1);
    let bar = h.engine.registry().assembly("bar").ok_or("assembly missing")?;
    assert!(!bar.has_transport());

    // Nothing is planned on a node given up on.
    let executed = h.world.borrow().executed.len();
    h.advance_ms(5_000);
    assert_eq!(h.world.borrow().executed.len(), executed);
    Ok(())
}
