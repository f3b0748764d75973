//! Credential discovery.
//!
//! Phase one of a fleetcast run: seed an [`AttemptQueue`] with every
//! host/port/user/secret combination, let a [`CredentialPool`] drain it, and
//! collect the sessions that authenticated in a [`CredentialRegistry`].

pub mod pool;
pub mod queue;
pub mod registry;

pub use pool::{
    AttemptEvent, AttemptOutcome, CredentialPool, PoolReport, PoolStopper, StopSignal,
};
pub use queue::{attempt_matrix, AttemptQueue, Lease, PullOutcome};
pub use registry::{CredentialRegistry, Registration};
