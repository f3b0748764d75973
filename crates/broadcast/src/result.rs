//! Round results and the errors a broadcast can end with.

use crate::rendezvous::RendezvousError;
use session::{Attempt, CommandOutput};
use std::fmt;
use std::io;

/// Where a broadcast worker stands after its latest round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Active,
    /// Lost its session and kept its place in the group. It reconnects at
    /// the start of its next targeted round.
    Reconnecting,
    /// Permanently failed. Removed from the group before the next round.
    Dead,
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Reconnecting => "reconnecting",
            Self::Dead => "dead",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Output(CommandOutput),
    UploadAck,
    /// Host excluded by the round's filter, or the round carried no directive.
    Skipped,
    Failure(String),
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

/// One worker's answer for one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundResult {
    pub round: u64,
    pub attempt: Attempt,
    pub outcome: Outcome,
    pub liveness: Liveness,
}

/// Every result of a round, ordered by attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundReport {
    pub round: u64,
    pub results: Vec<RoundResult>,
}

impl RoundReport {
    pub(crate) fn new(round: u64, mut results: Vec<RoundResult>) -> Self {
        results.sort_by(|a, b| a.attempt.cmp(&b.attempt));
        Self { round, results }
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &RoundResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Output(_) | Outcome::UploadAck))
    }

    pub fn failed(&self) -> impl Iterator<Item = &RoundResult> {
        self.results.iter().filter(|r| r.outcome.is_failure())
    }

    pub fn skipped(&self) -> impl Iterator<Item = &RoundResult> {
        self.results.iter().filter(|r| r.outcome.is_skipped())
    }

    /// Workers that died during this round.
    pub fn dead(&self) -> impl Iterator<Item = &RoundResult> {
        self.results
            .iter()
            .filter(|r| r.liveness == Liveness::Dead)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("broadcast group is shut down")]
    ShutDown,
    /// Membership and rendezvous disagree. The group is poisoned.
    #[error("broadcast group out of sync: {expected} members but {parties} rendezvous parties")]
    GroupDesync { expected: usize, parties: usize },
    /// A round ended without a result from every member. The group is poisoned.
    #[error("round {round} collected {received} of {expected} results")]
    MissingResults {
        round: u64,
        expected: usize,
        received: usize,
    },
    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),
    #[error("failed to spawn broadcast worker")]
    WorkerSpawn(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::{IpAddr, Ipv4Addr};

    fn result(last: u8, outcome: Outcome, liveness: Liveness) -> RoundResult {
        RoundResult {
            round: 1,
            attempt: Attempt::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), 22, "root", "pw"),
            outcome,
            liveness,
        }
    }

    #[test]
    fn report_sorts_and_classifies() {
        let report = RoundReport::new(
            1,
            vec![
                result(3, Outcome::Skipped, Liveness::Active),
                result(1, Outcome::Output(CommandOutput::new("hi\n", "")), Liveness::Active),
                result(2, Outcome::Failure("reset".into()), Liveness::Dead),
                result(4, Outcome::UploadAck, Liveness::Active),
            ],
        );

        let order: Vec<_> = report.results.iter().map(|r| r.attempt.host).collect();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted);

        assert_eq!(report.succeeded().count(), 2);
        assert_eq!(report.failed().count(), 1);
        assert_eq!(report.skipped().count(), 1);
        assert_eq!(report.dead().count(), 1);
        assert_eq!(report.len(), 4);
    }
}
