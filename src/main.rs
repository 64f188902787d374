//! # caped - cape daemon
//!
//! Loads a topology and keeps it converged until interrupted.
//!
//! ## Initialization Sequence
//!
//! 1. **Configuration** - TOML file, then command line overrides
//! 2. **Topology** - parsed and validated against the transports
//! 3. **Events** - logged, and broadcast to the event socket forwarder
//! 4. **Transports** - remote shell and message bus factories
//! 5. **Engine** - every assembly provisioned, first pass scheduled
//! 6. **Mainloop** - runs until Ctrl+C
//!
//! ## Signals
//!
//! - SIGINT disconnects every assembly and exits
//! - SIGHUP reloads the topology file

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

mod cli;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use cape_events::{EventBus, EventSink, EventSubscription, FanoutSink, LogSink, UnixSocketSink};
use cape_reconciler::{EngineBuilder, EngineConfig, EngineHandle, Topology};
use cape_transport::bus::{self, BusFactory, BusRequest};
use cape_transport::ssh::SshFactory;

use crate::cli::Cli;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();

    init_tracing(cli.verbose);

    let config = load_config(&cli)?;
    let topology = Topology::load(&cli.topology)
        .with_context(|| format!("Failed to load topology {}", cli.topology.display()))?;
    info!(
        application = %topology.name,
        assemblies = topology.assemblies.len(),
        "topology loaded"
    );
    warn_unattached_bus(&topology, &config.default_transport);

    let events = EventBus::new();
    if let Some(path) = config.event_socket.clone() {
        info!(socket = %path.display(), "publishing recovery events");
        tokio::spawn(forward_events(events.subscribe(), UnixSocketSink::new(path)));
    }

    let (bus_sender, bus_requests) = mpsc::unbounded_channel();
    tokio::spawn(drain_bus(bus_requests));

    let mut engine = EngineBuilder::new()
        .with_sink(FanoutSink::new().with(LogSink).with(events))
        .with_transport(ssh_factory(&config)?)
        .with_transport(BusFactory::new(bus_sender, config.heartbeat_timeout()))
        .with_config(config)
        .build(topology)
        .context("Engine setup failed")?;

    let (handle, mut commands) = EngineHandle::channel();
    tokio::spawn(wait_for_shutdown(handle.clone()));
    #[cfg(unix)]
    tokio::spawn(reload_on_hangup(
        handle,
        cli.topology.clone(),
        engine.config().default_transport.clone(),
    ));

    engine.start();
    info!(
        crmd = engine.crmd_uuid(),
        "caped started in {:?}",
        start_time.elapsed()
    );

    cape_mainloop::run(&mut engine, &mut commands).await;

    info!("caped stopped");
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?,
        None => EngineConfig::default(),
    };
    Ok(match &cli.event_socket {
        Some(path) => config.with_event_socket(path.clone()),
        None => config,
    })
}

/// Writes broadcast events to the admin socket, off the engine loop.
async fn forward_events(mut events: EventSubscription, socket: UnixSocketSink) {
    loop {
        match events.recv().await {
            Ok(event) => socket.emit(&event),
            Err(cape_events::Error::Lagged { skipped }) => {
                warn!(socket = %socket.path().display(), skipped, "event socket fell behind");
            }
            Err(_) => return,
        }
    }
}

/// Assemblies using the bus transport whose calls go nowhere.
fn unattached_bus_assemblies<'a>(topology: &'a Topology, default_transport: &str) -> Vec<&'a str> {
    topology
        .assemblies
        .iter()
        .filter(|assembly| assembly.transport_kind(default_transport) == bus::KIND)
        .map(|assembly| assembly.name.as_str())
        .collect()
}

fn warn_unattached_bus(topology: &Topology, default_transport: &str) {
    for name in unattached_bus_assemblies(topology, default_transport) {
        warn!(
            assembly = name,
            "assembly uses the bus transport but no bus is attached; it will never come up"
        );
    }
}

#[cfg(not(feature = "libssh2"))]
fn ssh_factory(config: &EngineConfig) -> Result<SshFactory<cape_transport::ssh::ProcessConnector>> {
    let connector = cape_transport::ssh::ProcessConnector::new(config.ssh_user.clone());
    let connector = match &config.ssh_identity {
        Some(identity) => connector.with_identity(identity.clone()),
        None => connector,
    };
    Ok(SshFactory::new(connector, config.ssh_config()))
}

#[cfg(feature = "libssh2")]
fn ssh_factory(config: &EngineConfig) -> Result<SshFactory<cape_transport::ssh::libssh2::Ssh2Connector>> {
    let identity = config
        .ssh_identity
        .clone()
        .context("ssh_identity is required by the libssh2 backend")?;
    let connector = cape_transport::ssh::libssh2::Ssh2Connector::new(config.ssh_user.clone(), identity);
    Ok(SshFactory::new(connector, config.ssh_config()))
}

/// No bus is attached to the daemon yet; calls are logged and dropped, so
/// bus transports report their nodes lost once heartbeats time out.
async fn drain_bus(mut requests: mpsc::UnboundedReceiver<BusRequest>) {
    while let Some(request) = requests.recv().await {
        warn!(
            node = %request.node,
            method = %request.method,
            correlation = ?request.correlation,
            "no bus attached, call dropped"
        );
    }
}

async fn wait_for_shutdown(handle: EngineHandle) {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(err) => {
            error!("Failed to listen for shutdown signal: {}", err);
            return;
        }
    }
    if let Err(err) = handle.shutdown() {
        warn!(error = %err, "engine already stopped");
    }
}

#[cfg(unix)]
async fn reload_on_hangup(handle: EngineHandle, path: PathBuf, default_transport: String) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(hangups) => hangups,
        Err(err) => {
            error!("Failed to listen for SIGHUP: {}", err);
            return;
        }
    };
    while hangups.recv().await.is_some() {
        info!(topology = %path.display(), "SIGHUP received, reloading topology");
        match Topology::load(&path) {
            Ok(topology) => {
                warn_unattached_bus(&topology, &default_transport);
                if handle.reload(topology).is_err() {
                    return;
                }
            }
            Err(err) => error!(error = %err, "topology reload failed, keeping the current one"),
        }
    }
}
