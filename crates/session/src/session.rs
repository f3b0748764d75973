//! Remote session capability.
//!
//! fleetcast never speaks a wire protocol itself. Everything that touches a
//! remote host goes through the [`Connector`] and [`Session`] traits defined
//! here, so the coordination engine can be driven by any transport (or by
//! [`fake::FakeNetwork`] in tests).

use std::fmt;
use std::net::IpAddr;
use std::path::Path;

#[cfg(any(test, feature = "test-support"))]
pub mod fake;

/// One candidate `(host, port, user, secret)` tuple.
///
/// Identity is the full tuple. Never mutated once built.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Attempt {
    pub host: IpAddr,
    pub port: u16,
    pub user: String,
    pub secret: String,
}

impl Attempt {
    pub fn new(host: IpAddr, port: u16, user: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            host,
            port,
            user: user.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host {
            IpAddr::V4(host) => write!(f, "{}@{}:{}", self.user, host, self.port),
            IpAddr::V6(host) => write!(f, "{}@[{}]:{}", self.user, host, self.port),
        }
    }
}

// Secrets stay out of logs.
impl fmt::Debug for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attempt")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Captured streams of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn new(stdout: impl Into<Vec<u8>>, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Failure taxonomy shared by every transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The credentials were rejected. Terminal for the attempt.
    #[error("authentication failed")]
    AuthFailed,
    /// Connection-level failure: refused, reset, timed out.
    #[error("transport failed: {0}")]
    TransportFailed(String),
    /// The session is up but an operation on it failed (e.g. file transfer I/O).
    #[error("protocol failure: {0}")]
    ProtocolFailure(String),
}

impl SessionError {
    pub fn transport(reason: impl fmt::Display) -> Self {
        Self::TransportFailed(reason.to_string())
    }

    pub fn protocol(reason: impl fmt::Display) -> Self {
        Self::ProtocolFailure(reason.to_string())
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::TransportFailed(_))
    }
}

/// An authenticated, stateful remote-execution handle for one host.
///
/// A session is owned by exactly one worker at a time, so methods take
/// `&mut self` and implementations need no internal locking.
#[cfg_attr(any(test, feature = "test-support"), mockall::automock)]
pub trait Session: Send {
    /// Run `command` and collect its output streams.
    fn run(&mut self, command: &str) -> Result<CommandOutput, SessionError>;

    /// Copy `local` to `remote` over the session.
    fn upload(&mut self, local: &Path, remote: &str) -> Result<(), SessionError>;

    /// Tear the session down. Must be idempotent.
    fn close(&mut self);
}

/// Opens sessions. Shared by every worker, hence `Sync`.
#[cfg_attr(any(test, feature = "test-support"), mockall::automock)]
pub trait Connector: Send + Sync {
    fn open(&self, attempt: &Attempt) -> Result<Box<dyn Session>, SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn attempt() -> Attempt {
        Attempt::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 22, "root", "hunter2")
    }

    #[test]
    fn display_omits_secret() {
        assert_eq!(attempt().to_string(), "root@10.0.0.1:22");
    }

    #[test]
    fn display_brackets_ipv6() {
        let a = Attempt::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 2222, "ops", "pw");
        assert_eq!(a.to_string(), "ops@[::1]:2222");
    }

    #[test]
    fn debug_redacts_secret() {
        let debug = format!("{:?}", attempt());
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn identity_is_the_full_tuple() {
        let mut other = attempt();
        assert_eq!(other, attempt());
        other.secret = "different".into();
        assert_ne!(other, attempt());
    }

    #[test]
    fn only_transport_errors_are_transport() {
        assert!(SessionError::transport("reset").is_transport());
        assert!(!SessionError::AuthFailed.is_transport());
        assert!(!SessionError::protocol("eof").is_transport());
    }

    #[test]
    fn lossy_output_decodes_utf8() {
        let out = CommandOutput::new("hi\n", vec![0xff]);
        assert_eq!(out.stdout_lossy(), "hi\n");
        assert_eq!(out.stderr_lossy(), "\u{fffd}");
    }
}
