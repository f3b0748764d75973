//! Per-session broadcast worker.
//!
//! Owns exactly one session for the lifetime of the group. Between rounds it
//! waits at the rendezvous; once released it runs the published directive,
//! reports one result, and arrives again.

use crate::directive::{DirectiveBoard, DirectiveKind, RoundOrder};
use crate::rendezvous::Rendezvous;
use crate::result::{Liveness, Outcome, RoundResult};
use session::{Attempt, Connector, Session, SessionError};
use settings::{BroadcastSettings, TransportLoss};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Shared plumbing between the controller and its workers.
#[derive(Clone)]
pub(crate) struct WorkerLinks {
    pub rendezvous: Arc<Rendezvous>,
    pub board: Arc<DirectiveBoard>,
    pub results: Sender<RoundResult>,
}

pub(crate) struct BroadcastWorker {
    attempt: Attempt,
    session: Option<Box<dyn Session>>,
    connector: Arc<dyn Connector>,
    reconnect_attempts: u32,
    on_transport_loss: TransportLoss,
    liveness: Liveness,
}

impl BroadcastWorker {
    pub fn new(
        attempt: Attempt,
        session: Box<dyn Session>,
        connector: Arc<dyn Connector>,
        settings: &BroadcastSettings,
    ) -> Self {
        Self {
            attempt,
            session: Some(session),
            connector,
            reconnect_attempts: settings.reconnect_attempts,
            on_transport_loss: settings.on_transport_loss,
            liveness: Liveness::Active,
        }
    }

    /// Serve rounds until told to terminate, the worker dies, or the
    /// rendezvous is closed.
    pub fn run(mut self, links: WorkerLinks) {
        debug!(attempt = %self.attempt, "Broadcast worker started");

        loop {
            if let Err(e) = links.rendezvous.arrive_and_wait() {
                debug!(attempt = %self.attempt, error = %e, "Leaving before round start");
                break;
            }

            let order = links.board.current();
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.execute(&order))) {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(attempt = %self.attempt, round = order.round, "Broadcast worker panicked");
                    self.liveness = Liveness::Dead;
                    Outcome::Failure("worker panicked".into())
                }
            };

            let leaving = order.terminate || self.liveness() == Liveness::Dead;
            let result = RoundResult {
                round: order.round,
                attempt: self.attempt.clone(),
                outcome,
                liveness: self.liveness,
            };

            // The result has to be in the channel before the second arrival,
            // that is what lets the controller drain without waiting.
            let delivered = links.results.send(result).is_ok();
            if leaving || !delivered {
                links.rendezvous.arrive_and_deregister();
                break;
            }
            if let Err(e) = links.rendezvous.arrive_and_wait() {
                debug!(attempt = %self.attempt, error = %e, "Leaving after round end");
                break;
            }
        }

        self.close_session();
        debug!(attempt = %self.attempt, liveness = %self.liveness, "Broadcast worker exited");
    }

    pub fn execute(&mut self, order: &RoundOrder) -> Outcome {
        let Some(directive) = &order.directive else {
            return Outcome::Skipped;
        };
        if !order.filter.matches(self.attempt.host) {
            return Outcome::Skipped;
        }

        match &directive.kind {
            DirectiveKind::RunCommand(command) => self.run_command(command),
            DirectiveKind::UploadFile { local, remote } => self.upload(local, remote),
        }
    }

    fn run_command(&mut self, command: &str) -> Outcome {
        if let Err(outcome) = self.ensure_connected() {
            return outcome;
        }

        match self.call(|session| session.run(command)) {
            Ok(output) => Outcome::Output(output),
            Err(e) if e.is_transport() => {
                warn!(attempt = %self.attempt, error = %e, "Session lost mid-command, reconnecting");
                self.close_session();
                if let Err(outcome) = self.reconnect(e) {
                    return outcome;
                }
                match self.call(|session| session.run(command)) {
                    Ok(output) => {
                        info!(attempt = %self.attempt, "Command succeeded after reconnect");
                        Outcome::Output(output)
                    }
                    Err(e) => {
                        self.close_session();
                        self.lose(e)
                    }
                }
            }
            Err(e) => {
                warn!(attempt = %self.attempt, error = %e, "Command failed");
                Outcome::Failure(e.to_string())
            }
        }
    }

    /// Transfers are never retried: a partial write is not safe to repeat.
    fn upload(&mut self, local: &Path, remote: &str) -> Outcome {
        if let Err(outcome) = self.ensure_connected() {
            return outcome;
        }

        match self.call(|session| session.upload(local, remote)) {
            Ok(()) => Outcome::UploadAck,
            Err(e) => {
                warn!(attempt = %self.attempt, error = %e, "Upload failed");
                Outcome::Failure(e.to_string())
            }
        }
    }

    /// A lingering worker has no session; get one before doing anything.
    fn ensure_connected(&mut self) -> Result<(), Outcome> {
        if self.session.is_some() {
            return Ok(());
        }
        self.reconnect(SessionError::transport("not connected"))
    }

    /// Reopen the session with the original credentials. Rejected
    /// credentials kill the worker immediately; transport failures are
    /// retried up to the configured number of attempts.
    fn reconnect(&mut self, cause: SessionError) -> Result<(), Outcome> {
        let mut last_error = cause;
        for attempt_number in 1..=self.reconnect_attempts {
            self.liveness = Liveness::Reconnecting;
            match self.connector.open(&self.attempt) {
                Ok(session) => {
                    self.session = Some(session);
                    self.liveness = Liveness::Active;
                    info!(attempt = %self.attempt, attempt_number, "Reconnected");
                    return Ok(());
                }
                Err(SessionError::AuthFailed) => {
                    warn!(attempt = %self.attempt, "Reconnect rejected, credentials no longer valid");
                    self.liveness = Liveness::Dead;
                    return Err(Outcome::Failure(format!(
                        "reconnect failed: {}",
                        SessionError::AuthFailed
                    )));
                }
                Err(e) => {
                    debug!(attempt = %self.attempt, attempt_number, error = %e, "Reconnect failed");
                    last_error = e;
                }
            }
        }
        Err(self.lose(last_error))
    }

    fn lose(&mut self, error: SessionError) -> Outcome {
        match self.on_transport_loss {
            TransportLoss::Abandon => {
                warn!(attempt = %self.attempt, error = %error, "Session lost, worker is dead");
                self.liveness = Liveness::Dead;
            }
            TransportLoss::Linger => {
                warn!(attempt = %self.attempt, error = %error, "Session lost, retrying next round");
                self.liveness = Liveness::Reconnecting;
            }
        }
        Outcome::Failure(error.to_string())
    }

    fn call<T>(
        &mut self,
        op: impl FnOnce(&mut dyn Session) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        match self.session.as_deref_mut() {
            Some(session) => op(session),
            None => Err(SessionError::transport("not connected")),
        }
    }

    fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness
    }
}

impl Drop for BroadcastWorker {
    fn drop(&mut self) {
        self.close_session();
    }
}
