//! Credential registry.
//!
//! Maps every attempt that authenticated to the session it produced. Pool
//! workers write to it concurrently; the broadcast group later claims the
//! sessions and becomes their sole owner.

use indexmap::map::Entry;
use indexmap::IndexMap;
use parking_lot::Mutex;
use session::{Attempt, Session};

enum Slot {
    /// Authenticated, waiting for a broadcast worker.
    Unclaimed(Box<dyn Session>),
    /// Handed to a broadcast worker that now owns the session.
    Claimed,
}

/// What happened to a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First success for this tuple.
    New,
    /// Replaced an unclaimed session for the same tuple (the old one is closed).
    Replaced,
    /// A worker already owns a session for this tuple; the new one was closed.
    AlreadyClaimed,
}

/// Concurrent map of successful attempts. Iteration follows first
/// registration order.
#[derive(Default)]
pub struct CredentialRegistry {
    entries: Mutex<IndexMap<Attempt, Slot>>,
}

impl CredentialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful authentication. Last write wins for a tuple that
    /// has not been claimed yet.
    pub fn register(&self, attempt: Attempt, session: Box<dyn Session>) -> Registration {
        let (registration, stale) = match self.entries.lock().entry(attempt) {
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Unclaimed(session));
                (Registration::New, None)
            }
            Entry::Occupied(occupied) if matches!(occupied.get(), Slot::Claimed) => {
                (Registration::AlreadyClaimed, Some(session))
            }
            Entry::Occupied(mut occupied) => match occupied.insert(Slot::Unclaimed(session)) {
                Slot::Unclaimed(previous) => (Registration::Replaced, Some(previous)),
                Slot::Claimed => (Registration::Replaced, None),
            },
        };

        if let Some(mut stale) = stale {
            stale.close();
        }
        registration
    }

    /// Take every unclaimed session. The entries stay in the registry,
    /// marked as owned by the caller.
    pub fn claim_unclaimed(&self) -> Vec<(Attempt, Box<dyn Session>)> {
        let mut entries = self.entries.lock();
        let mut claimed = Vec::new();
        for (attempt, slot) in entries.iter_mut() {
            if let Slot::Unclaimed(session) = std::mem::replace(slot, Slot::Claimed) {
                claimed.push((attempt.clone(), session));
            }
        }
        claimed
    }

    /// Run `f` against the unclaimed session for `attempt` while holding the
    /// registry lock. `None` when there is no such entry or a broadcast
    /// worker already owns it.
    pub fn with_unclaimed<R>(
        &self,
        attempt: &Attempt,
        f: impl FnOnce(&mut Box<dyn Session>) -> R,
    ) -> Option<R> {
        match self.entries.lock().get_mut(attempt) {
            Some(Slot::Unclaimed(session)) => Some(f(session)),
            _ => None,
        }
    }

    /// Drop the entry for `attempt`. An unclaimed session is closed.
    pub fn release(&self, attempt: &Attempt) -> bool {
        let removed = self.entries.lock().shift_remove(attempt);
        match removed {
            Some(Slot::Unclaimed(mut session)) => {
                session.close();
                true
            }
            Some(Slot::Claimed) => true,
            None => false,
        }
    }

    /// Close every unclaimed session and forget all entries.
    pub fn clear(&self) {
        let drained: Vec<Slot> = self.entries.lock().drain(..).map(|(_, slot)| slot).collect();
        for slot in drained {
            if let Slot::Unclaimed(mut session) = slot {
                session.close();
            }
        }
    }

    pub fn contains(&self, attempt: &Attempt) -> bool {
        self.entries.lock().contains_key(attempt)
    }

    pub fn attempts(&self) -> Vec<Attempt> {
        self.entries.lock().keys().cloned().collect()
    }

    pub fn unclaimed_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Unclaimed(_)))
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for CredentialRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRegistry")
            .field("entries", &self.len())
            .finish()
    }
}
