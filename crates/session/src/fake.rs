//! In-memory network for tests.
//!
//! `FakeNetwork` is a scriptable [`Connector`]: tests decide which
//! credentials each host accepts, when sessions drop, and whether uploads
//! fail, then inspect the recorded calls afterwards.

use crate::{Attempt, CommandOutput, Connector, Session, SessionError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What a recorded call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallKind {
    Open { user: String },
    Run(String),
    Upload { local: PathBuf, remote: String },
}

/// One call observed by the fake network.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub host: IpAddr,
    pub kind: CallKind,
    pub started: Instant,
    pub finished: Instant,
    pub ok: bool,
}

#[derive(Default)]
struct FakeHost {
    accounts: Vec<(String, String)>,
    unreachable: bool,
    drops_pending: u32,
    fail_uploads: bool,
    opens: usize,
    open_sessions: usize,
}

#[derive(Default)]
struct NetworkState {
    hosts: HashMap<IpAddr, FakeHost>,
    calls: Vec<CallRecord>,
    command_delay: Duration,
    open_delay: Duration,
}

impl NetworkState {
    fn host(&mut self, host: IpAddr) -> &mut FakeHost {
        self.hosts.entry(host).or_default()
    }
}

/// Scriptable in-memory connector. Clones share state.
#[derive(Clone, Default)]
pub struct FakeNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `host` accept `user`/`secret`.
    pub fn accept(&self, host: IpAddr, user: &str, secret: &str) -> &Self {
        self.state
            .lock()
            .host(host)
            .accounts
            .push((user.to_string(), secret.to_string()));
        self
    }

    /// Forget every account on `host`, as if its credentials were rotated.
    pub fn revoke(&self, host: IpAddr) {
        self.state.lock().host(host).accounts.clear();
    }

    /// Refuse connections to `host` at the transport level.
    pub fn set_unreachable(&self, host: IpAddr, unreachable: bool) {
        self.state.lock().host(host).unreachable = unreachable;
    }

    /// The next `count` commands on `host` fail with a dropped connection.
    pub fn drop_next_commands(&self, host: IpAddr, count: u32) {
        self.state.lock().host(host).drops_pending += count;
    }

    /// Every upload to `host` fails with a protocol error.
    pub fn fail_uploads(&self, host: IpAddr) {
        self.state.lock().host(host).fail_uploads = true;
    }

    /// Make every command take at least `delay`.
    pub fn set_command_delay(&self, delay: Duration) {
        self.state.lock().command_delay = delay;
    }

    /// Make every connection attempt take at least `delay`.
    pub fn set_open_delay(&self, delay: Duration) {
        self.state.lock().open_delay = delay;
    }

    /// Connection attempts made against `host`, successful or not.
    pub fn opens(&self, host: IpAddr) -> usize {
        self.state.lock().hosts.get(&host).map_or(0, |h| h.opens)
    }

    /// Sessions to `host` that have not been closed yet.
    pub fn open_sessions(&self, host: IpAddr) -> usize {
        self.state.lock().hosts.get(&host).map_or(0, |h| h.open_sessions)
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.state.lock().calls.clone()
    }

    /// Recorded command executions, in completion order.
    pub fn runs(&self) -> Vec<CallRecord> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call.kind, CallKind::Run(_)))
            .collect()
    }
}

impl Connector for FakeNetwork {
    fn open(&self, attempt: &Attempt) -> Result<Box<dyn Session>, SessionError> {
        let started = Instant::now();
        let delay = self.state.lock().open_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut state = self.state.lock();
        let host = state.host(attempt.host);
        host.opens += 1;

        let result = if host.unreachable {
            Err(SessionError::transport("connection refused"))
        } else if host
            .accounts
            .iter()
            .any(|(user, secret)| *user == attempt.user && *secret == attempt.secret)
        {
            host.open_sessions += 1;
            Ok(())
        } else {
            Err(SessionError::AuthFailed)
        };

        state.calls.push(CallRecord {
            host: attempt.host,
            kind: CallKind::Open {
                user: attempt.user.clone(),
            },
            started,
            finished: Instant::now(),
            ok: result.is_ok(),
        });
        tracing::trace!(attempt = %attempt, ok = result.is_ok(), "fake open");

        result.map(|()| {
            Box::new(FakeSession {
                host: attempt.host,
                state: Arc::clone(&self.state),
                broken: false,
                closed: false,
            }) as Box<dyn Session>
        })
    }
}

struct FakeSession {
    host: IpAddr,
    state: Arc<Mutex<NetworkState>>,
    broken: bool,
    closed: bool,
}

impl FakeSession {
    fn exec(&self, command: &str) -> CommandOutput {
        if let Some(text) = command.strip_prefix("echo ") {
            CommandOutput::new(format!("{text}\n"), "")
        } else if command == "hostname" {
            CommandOutput::new(format!("{}\n", self.host), "")
        } else {
            CommandOutput::new("", format!("sh: {command}: command not found\n"))
        }
    }

    fn record(&self, kind: CallKind, started: Instant, ok: bool) {
        self.state.lock().calls.push(CallRecord {
            host: self.host,
            kind,
            started,
            finished: Instant::now(),
            ok,
        });
    }
}

impl Session for FakeSession {
    fn run(&mut self, command: &str) -> Result<CommandOutput, SessionError> {
        let started = Instant::now();
        let delay = self.state.lock().command_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let result = {
            let mut state = self.state.lock();
            let host = state.host(self.host);
            if self.closed || self.broken {
                Err(SessionError::transport("session is closed"))
            } else if host.drops_pending > 0 {
                host.drops_pending -= 1;
                self.broken = true;
                Err(SessionError::transport("connection reset by peer"))
            } else {
                Ok(self.exec(command))
            }
        };

        self.record(CallKind::Run(command.to_string()), started, result.is_ok());
        result
    }

    fn upload(&mut self, local: &Path, remote: &str) -> Result<(), SessionError> {
        let started = Instant::now();
        let result = {
            let mut state = self.state.lock();
            if self.closed || self.broken {
                Err(SessionError::transport("session is closed"))
            } else if state.host(self.host).fail_uploads {
                Err(SessionError::protocol("permission denied"))
            } else {
                Ok(())
            }
        };

        self.record(
            CallKind::Upload {
                local: local.to_path_buf(),
                remote: remote.to_string(),
            },
            started,
            result.is_ok(),
        );
        result
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.state.lock();
        let host = state.host(self.host);
        host.open_sessions = host.open_sessions.saturating_sub(1);
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    fn host(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn accepts_only_configured_credentials() {
        let net = FakeNetwork::new();
        net.accept(host(1), "root", "correct");

        assert!(net.open(&Attempt::new(host(1), 22, "root", "correct")).is_ok());
        assert_eq!(
            net.open(&Attempt::new(host(1), 22, "root", "wrong")).err(),
            Some(SessionError::AuthFailed)
        );
        assert_eq!(
            net.open(&Attempt::new(host(2), 22, "root", "correct")).err(),
            Some(SessionError::AuthFailed)
        );
        assert_eq!(net.opens(host(1)), 2);
    }

    #[test]
    fn unreachable_host_is_a_transport_failure() {
        let net = FakeNetwork::new();
        net.accept(host(1), "root", "pw");
        net.set_unreachable(host(1), true);
        let err = net.open(&Attempt::new(host(1), 22, "root", "pw")).err();
        assert!(err.is_some_and(|e| e.is_transport()));
    }

    #[test]
    fn echo_returns_its_argument() {
        let net = FakeNetwork::new();
        net.accept(host(1), "root", "pw");
        let mut session = net.open(&Attempt::new(host(1), 22, "root", "pw")).unwrap();
        let out = session.run("echo hi").unwrap();
        assert_eq!(out.stdout, b"hi\n");
        assert!(out.stderr.is_empty());
    }

    #[test]
    fn dropped_session_stays_broken() {
        let net = FakeNetwork::new();
        net.accept(host(1), "root", "pw");
        net.drop_next_commands(host(1), 1);
        let mut session = net.open(&Attempt::new(host(1), 22, "root", "pw")).unwrap();

        assert!(session.run("echo a").unwrap_err().is_transport());
        assert!(session.run("echo b").unwrap_err().is_transport());

        let mut fresh = net.open(&Attempt::new(host(1), 22, "root", "pw")).unwrap();
        assert!(fresh.run("echo c").is_ok());
    }

    #[test]
    fn close_and_drop_release_the_session_once() {
        let net = FakeNetwork::new();
        net.accept(host(1), "root", "pw");
        let mut a = net.open(&Attempt::new(host(1), 22, "root", "pw")).unwrap();
        let b = net.open(&Attempt::new(host(1), 22, "root", "pw")).unwrap();
        assert_eq!(net.open_sessions(host(1)), 2);

        a.close();
        a.close();
        assert_eq!(net.open_sessions(host(1)), 1);

        drop(b);
        assert_eq!(net.open_sessions(host(1)), 0);
    }

    #[test]
    fn failing_uploads_are_protocol_errors() {
        let net = FakeNetwork::new();
        net.accept(host(1), "root", "pw");
        net.fail_uploads(host(1));
        let mut session = net.open(&Attempt::new(host(1), 22, "root", "pw")).unwrap();
        assert_eq!(
            session.upload(Path::new("/tmp/a"), "/tmp/b"),
            Err(SessionError::protocol("permission denied"))
        );
    }
}
