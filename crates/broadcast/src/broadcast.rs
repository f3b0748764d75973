//! Lock-step broadcast over authenticated sessions.
//!
//! Phase two of a fleetcast run. A [`BroadcastGroup`] runs one worker per
//! registered session; each call to [`BroadcastGroup::broadcast`] is a round
//! made of two rendezvous points, so every member finishes a directive
//! before anyone sees the next one.

mod directive;
mod group;
mod rendezvous;
mod result;
mod worker;

pub use directive::{Directive, DirectiveKind, HostFilter, HostFilterError};
pub use group::BroadcastGroup;
pub use rendezvous::{Rendezvous, RendezvousError};
pub use result::{BroadcastError, Liveness, Outcome, RoundReport, RoundResult};
