//! Directives and the board the controller publishes them on.

use ipnetwork::IpNetwork;
use parking_lot::RwLock;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// What every targeted worker does in one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectiveKind {
    RunCommand(String),
    UploadFile { local: PathBuf, remote: String },
}

impl fmt::Display for DirectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunCommand(command) => write!(f, "run {command:?}"),
            Self::UploadFile { local, remote } => {
                write!(f, "upload {} -> {remote}", local.display())
            }
        }
    }
}

/// A directive stamped with the round it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub round: u64,
    pub kind: DirectiveKind,
}

/// Which hosts take part in a round. Hosts outside the filter report
/// `Skipped` without touching their session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostFilter {
    #[default]
    All,
    Network(IpNetwork),
    Nothing,
}

impl HostFilter {
    pub fn matches(&self, host: IpAddr) -> bool {
        match self {
            Self::All => true,
            Self::Network(network) => network.contains(host),
            Self::Nothing => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid host filter {input:?}: expected \"all\", \"none\", an address or a network")]
pub struct HostFilterError {
    input: String,
}

impl FromStr for HostFilter {
    type Err = HostFilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        match input {
            "all" | "*" => return Ok(Self::All),
            "none" => return Ok(Self::Nothing),
            _ => {}
        }

        let network = match input.parse::<IpAddr>() {
            Ok(IpAddr::V4(host)) => IpNetwork::new(IpAddr::V4(host), 32),
            Ok(IpAddr::V6(host)) => IpNetwork::new(IpAddr::V6(host), 128),
            Err(_) => input.parse::<IpNetwork>(),
        };
        network.map(Self::Network).map_err(|_| HostFilterError {
            input: input.to_string(),
        })
    }
}

impl fmt::Display for HostFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Network(network) => write!(f, "{network}"),
            Self::Nothing => f.write_str("none"),
        }
    }
}

/// Everything a worker needs to know about the round it was released into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RoundOrder {
    pub round: u64,
    /// `None` for the closing round, which only releases workers.
    pub directive: Option<Directive>,
    pub filter: HostFilter,
    /// Leave the group after reporting instead of waiting for another round.
    pub terminate: bool,
}

impl RoundOrder {
    pub fn idle() -> Self {
        Self {
            round: 0,
            directive: None,
            filter: HostFilter::Nothing,
            terminate: false,
        }
    }
}

/// Single writer, many readers. The controller publishes before releasing a
/// round and workers read after release, so no reader sees a half-applied
/// update.
#[derive(Debug)]
pub(crate) struct DirectiveBoard {
    current: RwLock<RoundOrder>,
}

impl DirectiveBoard {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(RoundOrder::idle()),
        }
    }

    pub fn publish(&self, order: RoundOrder) {
        *self.current.write() = order;
    }

    pub fn current(&self) -> RoundOrder {
        self.current.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use test_case::test_case;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test_case("all", v4(8, 8, 8, 8), true ; "all matches anything")]
    #[test_case("none", v4(10, 0, 0, 1), false ; "none matches nothing")]
    #[test_case("10.0.0.0/24", v4(10, 0, 0, 77), true ; "inside network")]
    #[test_case("10.0.0.0/24", v4(10, 0, 1, 1), false ; "outside network")]
    #[test_case("10.0.0.5", v4(10, 0, 0, 5), true ; "single address")]
    #[test_case("10.0.0.5", v4(10, 0, 0, 6), false ; "neighbour of single address")]
    #[test_case("::1", IpAddr::V6(Ipv6Addr::LOCALHOST), true ; "ipv6 address")]
    fn filter_matching(filter: &str, host: IpAddr, expected: bool) {
        let filter: HostFilter = filter.parse().unwrap();
        assert_eq!(filter.matches(host), expected);
    }

    #[test_case("" ; "empty")]
    #[test_case("10.0.0.0/40" ; "prefix too long")]
    #[test_case("somewhere" ; "hostname")]
    fn rejects_garbage(input: &str) {
        assert!(input.parse::<HostFilter>().is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        for text in ["all", "none", "192.168.1.0/24"] {
            let filter: HostFilter = text.parse().unwrap();
            assert_eq!(filter.to_string(), text);
        }
    }

    #[test]
    fn board_hands_out_the_latest_order() {
        let board = DirectiveBoard::new();
        assert_eq!(board.current(), RoundOrder::idle());

        let order = RoundOrder {
            round: 4,
            directive: Some(Directive {
                round: 4,
                kind: DirectiveKind::RunCommand("uptime".into()),
            }),
            filter: HostFilter::All,
            terminate: false,
        };
        board.publish(order.clone());
        assert_eq!(board.current(), order);
    }
}
