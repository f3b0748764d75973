//! Path resolution for fleetcast.
//!
//! Directories are resolved once and cached. Call `set_config_dir` before
//! the first access to redirect them (tests, portable installs).

use std::path::PathBuf;
use std::sync::OnceLock;

static CONFIG_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Environment variable that points at an explicit config file.
pub const CONFIG_ENV: &str = "FLEETCAST_CONFIG";

/// ~/.config/fleetcast (or platform equivalent)
pub fn config_dir() -> &'static PathBuf {
    CONFIG_DIR.get_or_init(|| {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fleetcast")
    })
}

/// Override config dir (must be called before first access).
pub fn set_config_dir(path: PathBuf) {
    let _ = CONFIG_DIR.set(path);
}

/// Default config file path: config_dir()/config.toml
pub fn default_config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Config file to load: `$FLEETCAST_CONFIG` if set and non-empty, the
/// default location otherwise.
pub fn config_file() -> PathBuf {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => default_config_file(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn config_dir_ends_with_fleetcast() {
        let dir = config_dir();
        assert!(
            dir.ends_with("fleetcast"),
            "config_dir should end with 'fleetcast': {:?}",
            dir
        );
    }

    #[test]
    fn default_config_file_is_toml() {
        let path = default_config_file();
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("toml"));
    }

    #[test]
    #[serial]
    fn env_override_wins() {
        std::env::set_var(CONFIG_ENV, "/tmp/fleetcast-test.toml");
        assert_eq!(config_file(), PathBuf::from("/tmp/fleetcast-test.toml"));
        std::env::remove_var(CONFIG_ENV);
    }

    #[test]
    #[serial]
    fn empty_env_falls_back_to_default() {
        std::env::set_var(CONFIG_ENV, "");
        assert_eq!(config_file(), default_config_file());
        std::env::remove_var(CONFIG_ENV);
    }
}
