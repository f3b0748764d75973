//! Compile-time defaults for fleetcast.
//!
//! Grouped by the component that consumes them.

/// Credential worker pool defaults.
pub mod pool {
    use std::time::Duration;

    /// Number of concurrent authentication workers.
    pub const DEFAULT_WORKERS: usize = 8;
    /// Upper bound on the worker count accepted from config.
    pub const MAX_WORKERS: usize = 1024;
    /// How long a worker blocks on an empty queue before re-checking.
    pub const PULL_TIMEOUT: Duration = Duration::from_secs(5);
    /// Upper bound of the random delay before a worker's first pull.
    pub const START_JITTER: Duration = Duration::from_secs(1);
}

/// Broadcast group defaults.
pub mod broadcast {
    /// Reconnect attempts after a transport failure mid-command.
    pub const RECONNECT_ATTEMPTS: u32 = 1;
}

/// Target list defaults.
pub mod targets {
    /// Port used when the config names none.
    pub const DEFAULT_PORT: u16 = 22;
    /// Largest host list a config may expand to.
    pub const MAX_EXPANDED_HOSTS: usize = 65_536;
}

/// Settings file validation limits.
pub mod settings {
    /// Maximum config file size in bytes (256 KB).
    pub const MAX_FILE_SIZE: u64 = 256 * 1024;
}
