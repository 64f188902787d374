//! CLI definition using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::Parser;

/// caped - cloud application policy engine
#[derive(Parser, Debug)]
#[command(name = "caped")]
#[command(version)]
#[command(about = "Keeps an application's assemblies and services converged on its topology")]
#[command(
    long_about = "caped provisions the assemblies named in a topology document, starts and monitors their services, and restarts whatever fails. SIGHUP reloads the topology."
)]
pub struct Cli {
    /// Topology document (YAML, or JSON with a .json extension)
    #[arg(short, long)]
    pub topology: PathBuf,

    /// Engine configuration (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Unix socket to publish recovery events on; overrides the configuration
    #[arg(long)]
    pub event_socket: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}
