//! The live model of the application: assemblies, their resources, and the
//! recovery state of each.

use std::collections::{BTreeMap, BTreeSet};

use cape_core::{OpHandle, Recovery, RecoveryState};
use cape_mainloop::{Stopwatch, TimerId};
use cape_transport::{NodeInfo, Transport};
use uuid::Uuid;

use crate::topology::{AssemblySpec, ServiceSpec, Topology, resource_name};

/// The application every assembly belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Application {
    pub name: String,
    pub uuid: String,
}

impl Application {
    /// Take name and uuid from the topology, inventing a uuid when absent.
    #[must_use]
    pub fn from_topology(topology: &Topology) -> Self {
        Self {
            name: topology.name.clone(),
            uuid: topology
                .uuid
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        }
    }
}

/// A node hosting resources.
pub struct Assembly {
    pub name: String,
    pub uuid: String,
    pub image: String,
    pub transport_kind: String,
    /// Address from the topology, for pre-provisioned nodes.
    pub static_address: Option<String>,
    /// Set once the instance runs.
    pub address: Option<String>,
    pub instance_id: Option<String>,
    pub resources: BTreeSet<String>,
    pub recovery: Recovery,
    pub(crate) transport: Option<Box<dyn Transport>>,
    /// Bumped whenever a transport is created, so wakeups meant for a
    /// dropped transport are recognised.
    pub(crate) generation: u64,
    pub(crate) poll_timer: Option<TimerId>,
    pub provisioning: Stopwatch,
    pub connecting: Stopwatch,
}

impl Assembly {
    /// Build an assembly from its topology entry. Without an explicit uuid
    /// one is derived from the application and assembly names, so reloads
    /// keep the same identity.
    #[must_use]
    pub fn from_spec(application: &Application, spec: &AssemblySpec, default_transport: &str) -> Self {
        let uuid = spec.uuid.clone().unwrap_or_else(|| {
            let seed = format!("{}/{}", application.uuid, spec.name);
            Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()).to_string()
        });
        Self {
            name: spec.name.clone(),
            uuid,
            image: spec.image.clone(),
            transport_kind: spec.transport_kind(default_transport).to_string(),
            static_address: spec.address.clone(),
            address: None,
            instance_id: None,
            resources: BTreeSet::new(),
            recovery: Recovery::new(spec.policy()),
            transport: None,
            generation: 0,
            poll_timer: None,
            provisioning: Stopwatch::default(),
            connecting: Stopwatch::default(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> RecoveryState {
        self.recovery.state()
    }

    /// Check if resource actions may run here.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.recovery.state().is_running()
    }

    #[must_use]
    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    /// What a transport needs to know about this node.
    #[must_use]
    pub fn node_info(&self) -> NodeInfo {
        NodeInfo::new(
            self.name.clone(),
            self.uuid.clone(),
            self.address.clone().unwrap_or_default(),
        )
    }
}

/// A service instance on an assembly.
#[derive(Debug)]
pub struct Resource {
    /// `rsc_{assembly}_{service}`.
    pub name: String,
    pub service: String,
    pub assembly: String,
    pub kind: String,
    pub class: String,
    pub provider: Option<String>,
    pub params: BTreeMap<String, String>,
    pub monitor_interval_ms: u64,
    pub timeout_ms: u64,
    pub recovery: Recovery,
    /// Gone from the topology; removed once deleted.
    pub orphaned: bool,
    pub(crate) monitor: Option<OpHandle>,
    pub(crate) monitor_timer: Option<TimerId>,
}

impl Resource {
    #[must_use]
    pub fn from_spec(assembly: &str, spec: &ServiceSpec) -> Self {
        Self {
            name: resource_name(assembly, &spec.name),
            service: spec.name.clone(),
            assembly: assembly.to_string(),
            kind: spec.kind.clone(),
            class: spec.class.clone(),
            provider: spec.provider.clone(),
            params: spec.params(),
            monitor_interval_ms: spec.monitor_interval_ms(),
            timeout_ms: spec.timeout_ms(),
            recovery: Recovery::new(spec.policy()),
            orphaned: false,
            monitor: None,
            monitor_timer: None,
        }
    }

    /// Take the agent definition from a reloaded topology entry. Recovery
    /// and monitor state carry over.
    pub fn update(&mut self, spec: &ServiceSpec) {
        self.kind.clone_from(&spec.kind);
        self.class.clone_from(&spec.class);
        self.provider.clone_from(&spec.provider);
        self.params = spec.params();
        self.monitor_interval_ms = spec.monitor_interval_ms();
        self.timeout_ms = spec.timeout_ms();
        self.orphaned = false;
    }

    #[must_use]
    pub const fn state(&self) -> RecoveryState {
        self.recovery.state()
    }

    /// The recurring monitor, while one runs.
    #[must_use]
    pub const fn monitor(&self) -> Option<&OpHandle> {
        self.monitor.as_ref()
    }

    /// Check if the recurring monitor waits for its next run.
    #[must_use]
    pub const fn monitor_scheduled(&self) -> bool {
        self.monitor_timer.is_some()
    }
}

/// All assemblies and resources, by name.
pub struct Registry {
    pub application: Application,
    assemblies: BTreeMap<String, Assembly>,
    resources: BTreeMap<String, Resource>,
}

impl Registry {
    #[must_use]
    pub fn from_topology(topology: &Topology, default_transport: &str) -> Self {
        let mut registry = Self {
            application: Application::from_topology(topology),
            assemblies: BTreeMap::new(),
            resources: BTreeMap::new(),
        };
        for spec in &topology.assemblies {
            registry.add_assembly(spec, default_transport);
        }
        registry
    }

    /// Register an assembly and its services.
    pub fn add_assembly(&mut self, spec: &AssemblySpec, default_transport: &str) {
        let assembly = Assembly::from_spec(&self.application, spec, default_transport);
        self.assemblies.insert(spec.name.clone(), assembly);
        for service in &spec.services {
            self.add_resource(&spec.name, service);
        }
    }

    /// Register a resource on an existing assembly.
    pub fn add_resource(&mut self, assembly: &str, service: &ServiceSpec) {
        let resource = Resource::from_spec(assembly, service);
        if let Some(owner) = self.assemblies.get_mut(assembly) {
            owner.resources.insert(resource.name.clone());
        }
        self.resources.insert(resource.name.clone(), resource);
    }

    /// Unregister an assembly together with its resources.
    pub fn remove_assembly(&mut self, name: &str) -> Option<Assembly> {
        let assembly = self.assemblies.remove(name)?;
        for resource in &assembly.resources {
            self.resources.remove(resource);
        }
        Some(assembly)
    }

    pub fn remove_resource(&mut self, name: &str) -> Option<Resource> {
        let resource = self.resources.remove(name)?;
        if let Some(owner) = self.assemblies.get_mut(&resource.assembly) {
            owner.resources.remove(name);
        }
        Some(resource)
    }

    #[must_use]
    pub fn assembly(&self, name: &str) -> Option<&Assembly> {
        self.assemblies.get(name)
    }

    pub fn assembly_mut(&mut self, name: &str) -> Option<&mut Assembly> {
        self.assemblies.get_mut(name)
    }

    #[must_use]
    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.resources.get(name)
    }

    pub fn resource_mut(&mut self, name: &str) -> Option<&mut Resource> {
        self.resources.get_mut(name)
    }

    pub fn assemblies(&self) -> impl Iterator<Item = &Assembly> {
        self.assemblies.values()
    }

    pub fn assembly_names(&self) -> Vec<String> {
        self.assemblies.keys().cloned().collect()
    }

    /// Resources of one assembly, by name.
    pub fn resources_of<'a>(&'a self, assembly: &str) -> impl Iterator<Item = &'a Resource> + 'a {
        let names = self
            .assemblies
            .get(assembly)
            .map(|owner| owner.resources.iter().collect::<Vec<_>>())
            .unwrap_or_default();
        names.into_iter().filter_map(move |name| self.resources.get(name))
    }

    /// Names of the resources of one assembly.
    #[must_use]
    pub fn resource_names_of(&self, assembly: &str) -> Vec<String> {
        self.assemblies
            .get(assembly)
            .map(|owner| owner.resources.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Check if `resource` is owned by `assembly`.
    #[must_use]
    pub fn owns(&self, assembly: &str, resource: &str) -> bool {
        self.resources
            .get(resource)
            .is_some_and(|r| r.assembly == assembly)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::topology::ServiceSpec;

    fn topology() -> Topology {
        Topology::new("shop").with_assembly(
            AssemblySpec::new("bar")
                .with_address("10.0.0.2")
                .with_service(ServiceSpec::new("angus", "httpd").with_monitor_interval(1))
                .with_service(ServiceSpec::new("db", "pgsql")),
        )
    }

    #[test]
    fn test_from_topology() {
        let registry = Registry::from_topology(&topology(), "ssh");
        let bar = registry.assembly("bar").unwrap();
        assert_eq!(bar.transport_kind, "ssh");
        assert_eq!(bar.static_address.as_deref(), Some("10.0.0.2"));
        assert!(bar.address.is_none());
        assert_eq!(bar.state(), RecoveryState::Unknown);
        assert_eq!(
            registry.resource_names_of("bar"),
            vec!["rsc_bar_angus".to_string(), "rsc_bar_db".to_string()]
        );

        let angus = registry.resource("rsc_bar_angus").unwrap();
        assert_eq!(angus.monitor_interval_ms, 1000);
        assert!(registry.owns("bar", "rsc_bar_angus"));
        assert!(!registry.owns("baz", "rsc_bar_angus"));
    }

    #[test]
    fn test_assembly_uuid_is_stable() {
        let mut topology = topology();
        topology.uuid = Some("app-uuid".to_string());
        let first = Registry::from_topology(&topology, "ssh");
        let second = Registry::from_topology(&topology, "ssh");
        assert_eq!(
            first.assembly("bar").unwrap().uuid,
            second.assembly("bar").unwrap().uuid
        );
    }

    #[test]
    fn test_remove() {
        let mut registry = Registry::from_topology(&topology(), "ssh");
        registry.remove_resource("rsc_bar_db").unwrap();
        assert_eq!(registry.resources_of("bar").count(), 1);

        registry.remove_assembly("bar").unwrap();
        assert_eq!(registry.resource_count(), 0);
        assert!(registry.remove_assembly("bar").is_none());
    }

    #[test]
    fn test_update_keeps_recovery() {
        let mut registry = Registry::from_topology(&topology(), "ssh");
        let angus = registry.resource_mut("rsc_bar_angus").unwrap();
        angus.recovery.set_state(RecoveryState::Running, std::time::Duration::ZERO);
        angus.orphaned = true;

        angus.update(&ServiceSpec::new("angus", "nginx"));
        assert_eq!(angus.kind, "nginx");
        assert_eq!(angus.monitor_interval_ms, 0);
        assert!(!angus.orphaned);
        assert_eq!(angus.state(), RecoveryState::Running);
    }
}
