//! Command-line argument parsing.

use clap::Parser;

/// kestrel cell - per-host KVM agent
#[derive(Parser, Debug)]
#[command(name = "kestrel-cell")]
#[command(about = "kestrel cell - per-host KVM agent")]
#[command(version)]
pub struct Args {
    /// Path to the domain configuration file
    #[arg(short, long, default_value = "/etc/kestrel/domain.cfg")]
    pub config: String,

    /// Data directory for pool and allocation state
    #[arg(long, default_value = "/var/lib/kestrel")]
    pub data_path: String,

    /// Storage pool path for guest volumes
    #[arg(long, default_value = "/var/lib/kestrel/volumes")]
    pub pool_path: String,

    /// Name of the host bridge guests attach to
    #[arg(long, default_value = "br0")]
    pub bridge: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Development mode (in-memory hypervisor backend)
    #[arg(long)]
    pub dev: bool,
}
