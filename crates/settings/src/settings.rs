//! Configuration system for fleetcast.
//!
//! Provides compile-time defaults and TOML config file support.

pub mod constants;
pub mod file;

pub use file::{
    config_path, ensure_config_file, load_config, parse_config, Account, BroadcastSettings,
    Config, CredentialSettings, LoopbackSettings, PoolSettings, TargetSettings, TransportLoss,
};
