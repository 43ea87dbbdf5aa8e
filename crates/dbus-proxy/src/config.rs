use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use bus_relay::session::{DEFAULT_AUTH_TIMEOUT, DEFAULT_MAX_PENDING_REPLIES};
use bus_relay::{BusAddress, SessionConfig};
use policy_engine::BusKind;
use serde::Deserialize;

use crate::cli::Cli;

/// Well-known system bus socket, used when nothing else names one.
pub const SYSTEM_BUS_SOCKET: &str = "/var/run/dbus/system_bus_socket";

/// Process settings. The access policy itself is not configured here.
#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub outside_address: Option<String>,
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,
    #[serde(default = "default_max_pending_replies")]
    pub max_pending_replies: usize,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            outside_address: None,
            auth_timeout_secs: default_auth_timeout(),
            max_pending_replies: default_max_pending_replies(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub audit_log_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            audit_log_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

fn default_auth_timeout() -> u64 {
    DEFAULT_AUTH_TIMEOUT.as_secs()
}

fn default_max_pending_replies() -> usize {
    DEFAULT_MAX_PENDING_REPLIES
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Command-line values win over the settings file.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(outside) = &cli.outside {
            self.outside_address = Some(outside.clone());
        }
        if let Some(level) = &cli.log_level {
            self.logging.level = level.clone();
        }
        if let Some(path) = &cli.audit_log {
            self.logging.audit_log_path = Some(path.clone());
        }
    }

    pub fn session_config(&self, bus: BusKind) -> SessionConfig {
        let mut config = SessionConfig::new(bus);
        config.auth_timeout = Duration::from_secs(self.auth_timeout_secs);
        config.max_pending_replies = self.max_pending_replies;
        config
    }
}

/// Load settings from a YAML file. Returns `None` when the file does not
/// exist so the caller can fall back to defaults.
pub fn load(path: &Path) -> Result<Option<Settings>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file {}", path.display()))?;
    let settings = serde_yml::from_str(&contents)
        .with_context(|| format!("failed to parse settings file {}", path.display()))?;
    Ok(Some(settings))
}

/// Work out which bus to connect to: an explicit address if given,
/// otherwise the environment, otherwise the well-known system socket.
pub fn resolve_outside(
    explicit: Option<&str>,
    bus: BusKind,
    env: impl Fn(&str) -> Option<String>,
) -> Result<BusAddress> {
    if let Some(address) = explicit {
        return BusAddress::parse(address).with_context(|| format!("invalid outside address '{address}'"));
    }

    match bus {
        BusKind::Session => {
            let address = env("DBUS_SESSION_BUS_ADDRESS")
                .context("DBUS_SESSION_BUS_ADDRESS is not set; pass --outside")?;
            BusAddress::parse(&address)
                .with_context(|| format!("invalid DBUS_SESSION_BUS_ADDRESS '{address}'"))
        }
        BusKind::System => match env("DBUS_SYSTEM_BUS_ADDRESS") {
            Some(address) => BusAddress::parse(&address)
                .with_context(|| format!("invalid DBUS_SYSTEM_BUS_ADDRESS '{address}'")),
            None => Ok(BusAddress::from_path(SYSTEM_BUS_SOCKET)),
        },
    }
}
