//! Shared fixtures for broadcast integration tests.

// Not every test binary uses every helper.
#![allow(dead_code)]

use broadcast::{BroadcastGroup, DirectiveKind, Outcome, RoundReport};
use credentials::{attempt_matrix, AttemptQueue, CredentialPool, CredentialRegistry};
use session::fake::FakeNetwork;
use settings::{BroadcastSettings, PoolSettings};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

pub const USER: &str = "root";
pub const SECRET: &str = "correct";

// ============================================================================
// Hosts and credentials
// ============================================================================

pub fn host(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(192, 168, 56, last))
}

pub fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// A network where each of `accepting` takes `root`/`correct`.
pub fn network(accepting: &[u8]) -> FakeNetwork {
    let net = FakeNetwork::new();
    for last in accepting {
        net.accept(host(*last), USER, SECRET);
    }
    net
}

// ============================================================================
// Phase one
// ============================================================================

/// Drain every combination of `hosts` and `secrets` through a pool of
/// `workers` and return the filled registry.
pub fn discover(
    net: &FakeNetwork,
    hosts: &[u8],
    secrets: &[&str],
    workers: usize,
) -> Arc<CredentialRegistry> {
    let hosts: Vec<IpAddr> = hosts.iter().map(|last| host(*last)).collect();
    let attempts = attempt_matrix(&hosts, &[22], &strings(&[USER]), &strings(secrets));
    let queue = Arc::new(AttemptQueue::seeded(attempts));
    let registry = Arc::new(CredentialRegistry::new());
    let settings = PoolSettings {
        workers,
        pull_timeout_ms: 10,
        start_jitter_ms: 2,
        ..PoolSettings::default()
    };

    CredentialPool::spawn(
        Arc::clone(&queue),
        Arc::clone(&registry),
        Arc::new(net.clone()),
        &settings,
        None,
    )
    .expect("pool spawns")
    .join();
    assert!(queue.is_drained());
    registry
}

// ============================================================================
// Phase two
// ============================================================================

pub fn form(net: &FakeNetwork, registry: &Arc<CredentialRegistry>) -> BroadcastGroup {
    form_with(net, registry, &BroadcastSettings::default())
}

pub fn form_with(
    net: &FakeNetwork,
    registry: &Arc<CredentialRegistry>,
    settings: &BroadcastSettings,
) -> BroadcastGroup {
    BroadcastGroup::form(Arc::clone(registry), Arc::new(net.clone()), settings)
        .expect("group forms")
}

/// Hosts `accepting` discovered and formed into a group in one step.
pub fn fleet(accepting: &[u8]) -> (FakeNetwork, Arc<CredentialRegistry>, BroadcastGroup) {
    let net = network(accepting);
    let registry = discover(&net, accepting, &[SECRET], 2);
    let group = form(&net, &registry);
    (net, registry, group)
}

pub fn run(command: &str) -> DirectiveKind {
    DirectiveKind::RunCommand(command.to_string())
}

/// Stdout reported by `host` in `report`, if it produced output.
pub fn stdout_of(report: &RoundReport, host: IpAddr) -> Option<String> {
    report
        .results
        .iter()
        .find(|r| r.attempt.host == host)
        .and_then(|r| match &r.outcome {
            Outcome::Output(output) => Some(output.stdout_lossy()),
            _ => None,
        })
}

pub fn result_hosts(report: &RoundReport) -> Vec<IpAddr> {
    report.results.iter().map(|r| r.attempt.host).collect()
}
