use std::path::PathBuf;

use clap::Parser;
use policy_engine::BusKind;

#[derive(Parser, Debug)]
#[command(name = "dbus-proxy", version, about = "Policy-filtering proxy between a contained peer and a D-Bus bus")]
pub struct Cli {
    /// Socket path the contained peer connects to
    pub inside_socket: PathBuf,

    /// Bus to proxy: session or system
    pub bus: BusKind,

    /// Outside bus address (defaults to the environment or the system socket)
    #[arg(long)]
    pub outside: Option<String>,

    /// Initial policy file, applied before the first connection is accepted
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Named pipe carrying policy updates (defaults to stdin)
    #[arg(long)]
    pub control: Option<PathBuf>,

    /// Path to the settings file
    #[arg(short, long, default_value = "dbus-proxy.yaml")]
    pub settings: PathBuf,

    /// Audit log path (overrides settings file)
    #[arg(long)]
    pub audit_log: Option<PathBuf>,

    /// Log level (overrides settings file; RUST_LOG wins over both)
    #[arg(long)]
    pub log_level: Option<String>,
}
