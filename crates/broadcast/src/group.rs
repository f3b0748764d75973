//! Broadcast group controller.
//!
//! Owns the member workers and drives rounds. Membership only changes while
//! the controller is between rounds: new members are registered before the
//! controller arrives at the first point, and dead members leave through the
//! second point and are dropped once their results are collected.

use crate::directive::{Directive, DirectiveBoard, DirectiveKind, HostFilter, RoundOrder};
use crate::rendezvous::Rendezvous;
use crate::result::{BroadcastError, Liveness, RoundReport, RoundResult};
use crate::worker::{BroadcastWorker, WorkerLinks};
use credentials::CredentialRegistry;
use indexmap::IndexMap;
use session::{Attempt, Connector, Session};
use settings::BroadcastSettings;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupState {
    Open,
    /// A round went wrong. No further rounds are started.
    Poisoned,
    ShutDown,
}

struct Member {
    liveness: Liveness,
    handle: Option<thread::JoinHandle<()>>,
}

impl Member {
    fn join(&mut self, attempt: &Attempt) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(attempt = %attempt, "Broadcast worker thread panicked");
            }
        }
    }
}

pub struct BroadcastGroup {
    members: IndexMap<Attempt, Member>,
    links: WorkerLinks,
    results: Receiver<RoundResult>,
    registry: Arc<CredentialRegistry>,
    connector: Arc<dyn Connector>,
    settings: BroadcastSettings,
    filter: HostFilter,
    round: u64,
    state: GroupState,
}

impl BroadcastGroup {
    /// Spawn one worker per session in `registry`. The sessions move into
    /// their workers; the registry keeps the entries as claimed.
    pub fn form(
        registry: Arc<CredentialRegistry>,
        connector: Arc<dyn Connector>,
        settings: &BroadcastSettings,
    ) -> Result<Self, BroadcastError> {
        let (results_tx, results) = mpsc::channel();
        let mut group = Self {
            members: IndexMap::new(),
            links: WorkerLinks {
                // The controller is always a party.
                rendezvous: Arc::new(Rendezvous::new(1)),
                board: Arc::new(DirectiveBoard::new()),
                results: results_tx,
            },
            results,
            registry,
            connector,
            settings: settings.clone(),
            filter: HostFilter::All,
            round: 0,
            state: GroupState::Open,
        };
        let admitted = group.admit_registered()?;
        info!(members = admitted, "Broadcast group formed");
        Ok(group)
    }

    /// Spawn workers for sessions registered since the group was formed.
    /// They take part starting with the next round.
    pub fn admit_registered(&mut self) -> Result<usize, BroadcastError> {
        self.ensure_open()?;
        let mut admitted = 0;
        for (attempt, mut session) in self.registry.claim_unclaimed() {
            if self.members.contains_key(&attempt) {
                util::debug_panic!("registry handed out a claimed attempt twice: {attempt}");
                session.close();
                continue;
            }
            self.spawn_member(attempt, session)?;
            admitted += 1;
        }
        if admitted > 0 {
            debug!(admitted, members = self.members.len(), "Admitted registered sessions");
        }
        Ok(admitted)
    }

    fn spawn_member(
        &mut self,
        attempt: Attempt,
        session: Box<dyn Session>,
    ) -> Result<(), BroadcastError> {
        // Registered before the thread exists so the worker can never arrive
        // at a rendezvous that does not count it.
        self.links.rendezvous.register(1)?;

        let worker = BroadcastWorker::new(
            attempt.clone(),
            session,
            Arc::clone(&self.connector),
            &self.settings,
        );
        let links = self.links.clone();
        let spawned = thread::Builder::new()
            .name(format!("bcast-{}", attempt.host))
            .spawn(move || worker.run(links));

        match spawned {
            Ok(handle) => {
                self.members.insert(
                    attempt,
                    Member {
                        liveness: Liveness::Active,
                        handle: Some(handle),
                    },
                );
                Ok(())
            }
            Err(e) => {
                // The worker, and its session, were dropped with the closure.
                self.links.rendezvous.deregister();
                self.registry.release(&attempt);
                error!(attempt = %attempt, error = %e, "Failed to spawn broadcast worker");
                Err(BroadcastError::WorkerSpawn(e))
            }
        }
    }

    /// Restrict later rounds to hosts matching `filter`.
    pub fn set_host_filter(&mut self, filter: HostFilter) {
        debug!(filter = %filter, "Host filter set");
        self.filter = filter;
    }

    pub fn host_filter(&self) -> HostFilter {
        self.filter
    }

    /// Attempts of every current member, in admission order.
    pub fn list_active(&self) -> Vec<Attempt> {
        self.members.keys().cloned().collect()
    }

    pub fn members(&self) -> Vec<(Attempt, Liveness)> {
        self.members
            .iter()
            .map(|(attempt, member)| (attempt.clone(), member.liveness))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Rounds started so far.
    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn is_shut_down(&self) -> bool {
        self.state == GroupState::ShutDown
    }

    /// Run `kind` on every member and block until each has reported.
    ///
    /// Members that die during the round report a failure and are removed
    /// before this returns.
    pub fn broadcast(&mut self, kind: DirectiveKind) -> Result<RoundReport, BroadcastError> {
        self.ensure_open()?;
        info!(directive = %kind, filter = %self.filter, members = self.members.len(), "Broadcasting");
        let report = self.run_round(Some(kind), self.filter, false)?;
        self.settle(&report);
        Ok(report)
    }

    /// Release every worker with an empty round, let them exit, and join
    /// them. Idempotent.
    pub fn shutdown(&mut self) -> Result<(), BroadcastError> {
        let outcome = match self.state {
            GroupState::ShutDown => return Ok(()),
            GroupState::Poisoned => Ok(()),
            GroupState::Open => self.run_round(None, HostFilter::Nothing, true).map(|report| {
                debug!(round = report.round, released = report.len(), "Final round collected");
            }),
        };

        self.state = GroupState::ShutDown;
        self.links.rendezvous.close();
        for (attempt, mut member) in self.members.drain(..) {
            member.join(&attempt);
            self.registry.release(&attempt);
        }
        info!("Broadcast group shut down");
        outcome
    }

    fn run_round(
        &mut self,
        directive: Option<DirectiveKind>,
        filter: HostFilter,
        terminate: bool,
    ) -> Result<RoundReport, BroadcastError> {
        let expected = self.members.len();
        let parties = self.links.rendezvous.parties();
        if parties != expected + 1 {
            return Err(self.poison(BroadcastError::GroupDesync { expected, parties }));
        }

        self.round += 1;
        let round = self.round;
        self.links.board.publish(RoundOrder {
            round,
            directive: directive.map(|kind| Directive { round, kind }),
            filter,
            terminate,
        });

        // First arrival releases the workers, the second one returns once
        // every member has reported or left.
        if let Err(e) = self
            .links
            .rendezvous
            .arrive_and_wait()
            .and_then(|_| self.links.rendezvous.arrive_and_wait())
        {
            return Err(self.poison(e.into()));
        }

        let results: Vec<RoundResult> = self.results.try_iter().collect();
        if results.len() != expected || results.iter().any(|r| r.round != round) {
            return Err(self.poison(BroadcastError::MissingResults {
                round,
                expected,
                received: results.iter().filter(|r| r.round == round).count(),
            }));
        }
        Ok(RoundReport::new(round, results))
    }

    /// Apply the liveness each member reported. Dead members already left
    /// the rendezvous, so they only need joining and forgetting.
    fn settle(&mut self, report: &RoundReport) {
        for result in &report.results {
            if result.liveness == Liveness::Dead {
                if let Some(mut member) = self.members.shift_remove(&result.attempt) {
                    member.join(&result.attempt);
                }
                self.registry.release(&result.attempt);
                warn!(attempt = %result.attempt, round = report.round, "Worker dead, removed from group");
            } else if let Some(member) = self.members.get_mut(&result.attempt) {
                member.liveness = result.liveness;
            }
        }
    }

    fn poison(&mut self, error: BroadcastError) -> BroadcastError {
        error!(round = self.round, error = %error, "Broadcast group poisoned");
        self.state = GroupState::Poisoned;
        self.links.rendezvous.close();
        error
    }

    fn ensure_open(&self) -> Result<(), BroadcastError> {
        match self.state {
            GroupState::Open => Ok(()),
            GroupState::Poisoned | GroupState::ShutDown => Err(BroadcastError::ShutDown),
        }
    }
}

impl Drop for BroadcastGroup {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "Broadcast group shutdown failed");
        }
    }
}

impl std::fmt::Debug for BroadcastGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastGroup")
            .field("members", &self.members.len())
            .field("round", &self.round)
            .field("filter", &self.filter)
            .field("state", &self.state)
            .finish()
    }
}
