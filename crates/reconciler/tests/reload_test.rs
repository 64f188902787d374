//! Topology reloads: added and removed assemblies, orphaned resources.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

mod common;

use cape_core::RecoveryState;
use cape_reconciler::{AssemblySpec, ServiceSpec, Topology};
use common::Harness;

fn bar() -> AssemblySpec {
    AssemblySpec::new("bar")
        .with_service(ServiceSpec::new("angus", "httpd").with_monitor_interval(1))
        .with_service(ServiceSpec::new("db", "pgsql"))
}

fn topology() -> Topology {
    Topology::new("shop").with_assembly(bar())
}

#[test]
fn test_removed_service_is_stopped_and_deleted() -> Result<(), String> {
    let mut h = Harness::started(topology())?;
    assert!(h.is_running("rsc_bar_db"));

    let reduced = Topology::new("shop").with_assembly(
        AssemblySpec::new("bar")
            .with_service(ServiceSpec::new("angus", "httpd").with_monitor_interval(1)),
    );
    h.engine.reload(reduced).map_err(|e| e.to_string())?;
    assert!(
        h.engine
            .registry()
            .resource("rsc_bar_db")
            .is_some_and(|resource| resource.orphaned)
    );

    h.advance_ms(1_000);

    assert!(!h.is_running("rsc_bar_db"));
    assert_eq!(h.executed("rsc_bar_db_stop_0"), 1);
    // Deleting history never reaches the node.
    assert_eq!(h.executed("rsc_bar_db_delete_0"), 0);
    assert!(h.engine.registry().resource("rsc_bar_db").is_none());
    assert!(h.engine.history().for_resource("rsc_bar_db").is_empty());
    assert_eq!(h.engine.registry().resource_names_of("bar"), vec!["rsc_bar_angus".to_string()]);

    // The remaining service is untouched.
    assert!(h.is_running("rsc_bar_angus"));
    assert_eq!(h.executed("rsc_bar_angus_start_0"), 1);
    Ok(())
}

#[test]
fn test_added_assembly_is_provisioned() -> Result<(), String> {
    let mut h = Harness::started(topology())?;

    let grown = topology()
        .with_assembly(AssemblySpec::new("baz").with_service(ServiceSpec::new("cache", "redis")));
    h.engine.reload(grown).map_err(|e| e.to_string())?;
    h.advance_ms(1_000);

    assert_eq!(
        h.provider.instances.borrow().created,
        vec!["bar".to_string(), "baz".to_string()]
    );
    assert_eq!(h.assembly_state("baz")?, RecoveryState::Running);
    assert!(h.is_running("rsc_baz_cache"));
    assert_eq!(h.executed("rsc_bar_angus_start_0"), 1);
    Ok(())
}

#[test]
fn test_removed_assembly_is_torn_down() -> Result<(), String> {
    let mut h = Harness::started(topology())?;

    h.engine
        .reload(Topology::new("shop"))
        .map_err(|e| e.to_string())?;
    h.advance_ms(2_000);

    assert!(h.engine.registry().assembly("bar").is_none());
    assert_eq!(h.engine.registry().resource_count(), 0);
    assert!(h.engine.history().is_empty());
    assert_eq!(h.provider.instances.borrow().destroyed, vec!["i-1".to_string()]);
    assert_eq!(h.world.borrow().disconnects, 1);

    let stopped = h.events.events().into_iter().any(|event| {
        event.assembly.as_deref() == Some("bar")
            && event.resource.is_none()
            && event.state == RecoveryState::Stopped
    });
    assert!(stopped);
    Ok(())
}

#[test]
fn test_changed_service_keeps_its_state() -> Result<(), String> {
    let mut h = Harness::started(topology())?;

    let tuned = Topology::new("shop").with_assembly(
        AssemblySpec::new("bar")
            .with_service(
                ServiceSpec::new("angus", "httpd")
                    .with_monitor_interval(1)
                    .with_parameter("port", "8080"),
            )
            .with_service(ServiceSpec::new("db", "pgsql")),
    );
    h.engine.reload(tuned).map_err(|e| e.to_string())?;

    let angus = h
        .engine
        .registry()
        .resource("rsc_bar_angus")
        .ok_or("resource missing")?;
    assert_eq!(angus.state(), RecoveryState::Running);
    assert_eq!(angus.params.get("port").map(String::as_str), Some("8080"));
    assert!(!angus.orphaned);
    Ok(())
}

#[test]
fn test_invalid_reload_changes_nothing() -> Result<(), String> {
    let mut h = Harness::started(topology())?;

    let broken = topology().with_assembly(AssemblySpec::new("qux").with_transport("carrier-pigeon"));
    assert!(h.engine.reload(broken).is_err());

    assert!(h.engine.registry().assembly("qux").is_none());
    assert_eq!(h.engine.topology().assemblies.len(), 1);
    assert_eq!(h.provider.instances.borrow().created.len(), 1);
    Ok(())
}
