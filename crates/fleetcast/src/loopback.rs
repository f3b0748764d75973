//! Loopback transport.
//!
//! Authenticates against the accounts listed under `[loopback]` and runs
//! everything on the local machine. Only loopback addresses are reachable,
//! which makes it useful for trying a configuration end to end without
//! touching other hosts.

use session::{Attempt, CommandOutput, Connector, Session, SessionError};
use settings::{Account, LoopbackSettings};
use std::path::Path;
use std::process::Command;
use tracing::trace;

pub struct LoopbackConnector {
    accounts: Vec<Account>,
}

impl LoopbackConnector {
    pub fn new(settings: &LoopbackSettings) -> Self {
        Self {
            accounts: settings.accounts.clone(),
        }
    }
}

impl Connector for LoopbackConnector {
    fn open(&self, attempt: &Attempt) -> Result<Box<dyn Session>, SessionError> {
        if !attempt.host.is_loopback() {
            return Err(SessionError::transport(format!(
                "{} is not a loopback address",
                attempt.host
            )));
        }

        let accepted = self
            .accounts
            .iter()
            .any(|account| account.user == attempt.user && account.secret == attempt.secret);
        if !accepted {
            return Err(SessionError::AuthFailed);
        }

        trace!(attempt = %attempt, "Loopback session opened");
        Ok(Box::new(LoopbackSession { closed: false }))
    }
}

struct LoopbackSession {
    closed: bool,
}

impl LoopbackSession {
    fn check_open(&self) -> Result<(), SessionError> {
        if self.closed {
            Err(SessionError::transport("session is closed"))
        } else {
            Ok(())
        }
    }
}

impl Session for LoopbackSession {
    fn run(&mut self, command: &str) -> Result<CommandOutput, SessionError> {
        self.check_open()?;
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .map_err(SessionError::protocol)?;
        Ok(CommandOutput::new(output.stdout, output.stderr))
    }

    fn upload(&mut self, local: &Path, remote: &str) -> Result<(), SessionError> {
        self.check_open()?;
        std::fs::copy(local, remote)
            .map(|_| ())
            .map_err(SessionError::protocol)
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    fn connector() -> LoopbackConnector {
        LoopbackConnector::new(&LoopbackSettings {
            accounts: vec![Account {
                user: "ops".into(),
                secret: "letmein".into(),
            }],
        })
    }

    fn local(secret: &str) -> Attempt {
        Attempt::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 22, "ops", secret)
    }

    #[test]
    fn only_loopback_hosts_are_reachable() {
        let remote = Attempt::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 22, "ops", "letmein");
        let err = connector().open(&remote).err().unwrap();
        assert!(err.is_transport());

        let v6 = Attempt::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 22, "ops", "letmein");
        assert!(connector().open(&v6).is_ok());
    }

    #[test]
    fn unknown_accounts_fail_authentication() {
        assert_eq!(
            connector().open(&local("wrong")).err(),
            Some(SessionError::AuthFailed)
        );
    }

    #[cfg(unix)]
    #[test]
    fn runs_commands_through_the_shell() {
        let mut session = connector().open(&local("letmein")).unwrap();
        let output = session.run("echo hi; echo oops >&2").unwrap();
        assert_eq!(output.stdout_lossy(), "hi\n");
        assert_eq!(output.stderr_lossy(), "oops\n");
    }

    #[test]
    fn upload_copies_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.txt");
        let target = dir.path().join("target.txt");
        std::fs::write(&source, "payload").unwrap();

        let mut session = connector().open(&local("letmein")).unwrap();
        session
            .upload(&source, target.to_str().unwrap())
            .unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "payload");

        let missing = dir.path().join("missing");
        assert!(matches!(
            session.upload(&missing, target.to_str().unwrap()),
            Err(SessionError::ProtocolFailure(_))
        ));
    }

    #[test]
    fn closed_session_refuses_work() {
        let mut session = connector().open(&local("letmein")).unwrap();
        session.close();
        assert!(session.run("true").unwrap_err().is_transport());
    }
}
