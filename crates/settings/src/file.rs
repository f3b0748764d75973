//! TOML config file support.
//!
//! Config location: `~/.config/fleetcast/config.toml`, or the file named by
//! `$FLEETCAST_CONFIG`.

use anyhow::{bail, Context, Result};
use ipnetwork::IpNetwork;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants;

/// Hosts and ports to try.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct TargetSettings {
    /// Addresses or CIDR networks (`"10.0.0.5"`, `"10.0.0.0/24"`).
    pub hosts: Vec<String>,
    /// Ports tried on every host.
    pub ports: Vec<u16>,
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            ports: vec![constants::targets::DEFAULT_PORT],
        }
    }
}

impl TargetSettings {
    /// Expand every host entry into individual addresses.
    ///
    /// Duplicates are dropped, first occurrence wins. Networks include their
    /// network and broadcast addresses.
    pub fn expand_hosts(&self) -> Result<Vec<IpAddr>> {
        let mut seen = HashSet::new();
        let mut hosts = Vec::new();

        for entry in &self.hosts {
            let network: IpNetwork = entry
                .trim()
                .parse()
                .with_context(|| format!("Invalid host or network: {:?}", entry))?;

            let addresses: Box<dyn Iterator<Item = IpAddr>> = match network {
                IpNetwork::V4(net) => Box::new(net.iter().map(IpAddr::V4)),
                IpNetwork::V6(net) => Box::new(net.iter().map(IpAddr::V6)),
            };

            for address in addresses {
                if seen.insert(address) {
                    hosts.push(address);
                }
                if hosts.len() > constants::targets::MAX_EXPANDED_HOSTS {
                    bail!(
                        "Host list expands past {} addresses (at {:?})",
                        constants::targets::MAX_EXPANDED_HOSTS,
                        entry
                    );
                }
            }
        }

        Ok(hosts)
    }
}

/// Users and secrets, cartesian-producted with the targets.
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default, rename_all = "kebab-case")]
pub struct CredentialSettings {
    pub users: Vec<String>,
    pub secrets: Vec<String>,
}

/// Credential worker pool tuning.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct PoolSettings {
    /// Concurrent authentication workers.
    pub workers: usize,
    /// Bounded wait on an empty queue, in milliseconds.
    pub pull_timeout_ms: u64,
    /// Upper bound of the random delay before a worker's first pull.
    pub start_jitter_ms: u64,
    /// Put successful attempts back on the queue.
    pub retry_on_success: bool,
    /// Commands run once against every freshly authenticated session.
    pub init_commands: Vec<String>,
    /// `$NAME` substitutions applied to `init_commands`.
    pub init_command_vars: BTreeMap<String, String>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            workers: constants::pool::DEFAULT_WORKERS,
            pull_timeout_ms: constants::pool::PULL_TIMEOUT.as_millis() as u64,
            start_jitter_ms: constants::pool::START_JITTER.as_millis() as u64,
            retry_on_success: false,
            init_commands: Vec::new(),
            init_command_vars: BTreeMap::new(),
        }
    }
}

impl PoolSettings {
    /// Worker count clamped to `1..=MAX_WORKERS`.
    pub fn worker_count(&self) -> usize {
        self.workers.clamp(1, constants::pool::MAX_WORKERS)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_millis(self.pull_timeout_ms)
    }

    pub fn start_jitter(&self) -> Duration {
        Duration::from_millis(self.start_jitter_ms)
    }

    /// Init commands with `init_command_vars` substituted. Blank lines are
    /// skipped.
    pub fn expanded_init_commands(&self) -> Vec<String> {
        self.init_commands
            .iter()
            .map(|command| {
                util::expand_vars(
                    command,
                    self.init_command_vars
                        .iter()
                        .map(|(name, value)| (name.as_str(), value.as_str())),
                )
            })
            .filter(|command| !command.trim().is_empty())
            .collect()
    }
}

/// What a broadcast worker does once its reconnect attempts are spent.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TransportLoss {
    /// Mark the worker dead and drop it from later rounds.
    #[default]
    Abandon,
    /// Keep the worker in the group and try to reconnect next round.
    Linger,
}

/// Broadcast group tuning.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct BroadcastSettings {
    pub reconnect_attempts: u32,
    pub on_transport_loss: TransportLoss,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            reconnect_attempts: constants::broadcast::RECONNECT_ATTEMPTS,
            on_transport_loss: TransportLoss::default(),
        }
    }
}

/// One account accepted by the loopback connector.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Account {
    pub user: String,
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default, rename_all = "kebab-case")]
pub struct LoopbackSettings {
    pub accounts: Vec<Account>,
}

/// User-facing config parsed from TOML.
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub targets: TargetSettings,
    pub credentials: CredentialSettings,
    pub pool: PoolSettings,
    pub broadcast: BroadcastSettings,
    pub loopback: LoopbackSettings,
}

/// Default config file content with comments (written on first launch).
const DEFAULT_CONFIG: &str = r#"# fleetcast configuration

[targets]
# Addresses or CIDR networks.
hosts = ["127.0.0.1"]
ports = [22]

[credentials]
users = []
secrets = []

[pool]
# Concurrent authentication workers.
workers = 8
# Milliseconds a worker waits on an empty queue before re-checking.
pull-timeout-ms = 5000
# Upper bound of the random delay before each worker's first pull.
start-jitter-ms = 1000
# Put successful attempts back on the queue (keeps re-validating them).
retry-on-success = false
# Commands run once on every freshly authenticated session.
# $NAME placeholders are filled from init-command-vars.
init-commands = []

# [pool.init-command-vars]
# MARKER = "/tmp/fleetcast-seen"

[broadcast]
# Reconnect attempts after a session drops mid-command.
reconnect-attempts = 1
# "abandon" drops the worker, "linger" keeps retrying on later rounds.
on-transport-loss = "abandon"

# Accounts accepted by the bundled loopback connector.
# [[loopback.accounts]]
# user = "operator"
# secret = "change-me"
"#;

/// Return the config file path.
pub fn config_path() -> PathBuf {
    fleetcast_paths::config_file()
}

/// Ensure the config file exists, creating a default if missing.
/// Returns the path to the config file.
pub fn ensure_config_file() -> Option<PathBuf> {
    let path = config_path();
    if !path.exists() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok()?;
        }
        std::fs::write(&path, DEFAULT_CONFIG).ok()?;
        tracing::info!("Created default config at {:?}", path);
    }
    Some(path)
}

/// Parse config text, failing on malformed TOML.
pub fn parse_config(content: &str) -> Result<Config> {
    if content.len() as u64 > constants::settings::MAX_FILE_SIZE {
        bail!("Config is too large ({} bytes)", content.len());
    }
    toml::from_str(content).context("Failed to parse config")
}

/// Load and parse the config file. Returns default on any error.
pub fn load_config(path: &Path) -> Config {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to read config {:?}: {}", path, e);
            }
            return Config::default();
        }
    };

    match parse_config(&content) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!("{:#}, using defaults", e);
            Config::default()
        }
    }
}
