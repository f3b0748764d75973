//! Resizable rendezvous point.
//!
//! Every registered party must arrive before a phase completes. Parties can
//! join or leave between phases, and a party can leave as its way of
//! arriving, so a dying worker never holds the others back.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RendezvousError {
    #[error("rendezvous is closed")]
    Closed,
    #[error("more parties arrived than are registered")]
    Oversubscribed,
}

#[derive(Debug, Default)]
struct PhaseState {
    parties: usize,
    arrived: usize,
    generation: u64,
    closed: bool,
}

impl PhaseState {
    fn advance(&mut self) -> u64 {
        self.arrived = 0;
        self.generation += 1;
        self.generation
    }
}

#[derive(Debug, Default)]
pub struct Rendezvous {
    state: Mutex<PhaseState>,
    released: Condvar,
}

impl Rendezvous {
    pub fn new(parties: usize) -> Self {
        Self {
            state: Mutex::new(PhaseState {
                parties,
                ..PhaseState::default()
            }),
            released: Condvar::new(),
        }
    }

    /// Add `count` parties. They take part starting with the phase in
    /// progress, so the caller must make sure that phase cannot complete
    /// without them (the broadcast controller registers before it arrives).
    pub fn register(&self, count: usize) -> Result<(), RendezvousError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(RendezvousError::Closed);
        }
        state.parties += count;
        Ok(())
    }

    /// Remove a party that has not arrived in the current phase.
    pub fn deregister(&self) {
        let mut state = self.state.lock();
        self.leave(&mut state);
    }

    /// Arrive and block until every party has arrived. Returns the
    /// generation that the completed phase advanced to.
    pub fn arrive_and_wait(&self) -> Result<u64, RendezvousError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(RendezvousError::Closed);
        }
        if state.arrived >= state.parties {
            return Err(RendezvousError::Oversubscribed);
        }

        state.arrived += 1;
        if state.arrived == state.parties {
            let generation = state.advance();
            drop(state);
            self.released.notify_all();
            return Ok(generation);
        }

        let waiting_on = state.generation;
        while state.generation == waiting_on {
            if state.closed {
                return Err(RendezvousError::Closed);
            }
            self.released.wait(&mut state);
        }
        Ok(waiting_on + 1)
    }

    /// Arrive for the current phase and leave for good, without waiting.
    pub fn arrive_and_deregister(&self) {
        let mut state = self.state.lock();
        self.leave(&mut state);
    }

    /// Fail every current and future wait with [`RendezvousError::Closed`].
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.released.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn parties(&self) -> usize {
        self.state.lock().parties
    }

    /// Completed phases so far.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    fn leave(&self, state: &mut PhaseState) {
        if state.parties == 0 {
            util::debug_panic!("rendezvous party left with no parties registered");
            return;
        }
        state.parties -= 1;
        if state.arrived > 0 && state.arrived == state.parties {
            state.advance();
            self.released.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn spawn_waiter(rendezvous: &Arc<Rendezvous>) -> thread::JoinHandle<Result<u64, RendezvousError>> {
        let rendezvous = Arc::clone(rendezvous);
        thread::spawn(move || rendezvous.arrive_and_wait())
    }

    fn wait_for_arrivals(rendezvous: &Rendezvous, count: usize) {
        for _ in 0..500 {
            if rendezvous.state.lock().arrived == count {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("parties never arrived");
    }

    #[test]
    fn single_party_never_blocks() {
        let rendezvous = Rendezvous::new(1);
        assert_eq!(rendezvous.arrive_and_wait(), Ok(1));
        assert_eq!(rendezvous.arrive_and_wait(), Ok(2));
        assert_eq!(rendezvous.generation(), 2);
    }

    #[test]
    fn phase_completes_when_everyone_arrives() {
        let rendezvous = Arc::new(Rendezvous::new(3));
        let a = spawn_waiter(&rendezvous);
        let b = spawn_waiter(&rendezvous);
        wait_for_arrivals(&rendezvous, 2);
        assert_eq!(rendezvous.generation(), 0);

        assert_eq!(rendezvous.arrive_and_wait(), Ok(1));
        assert_eq!(a.join().unwrap(), Ok(1));
        assert_eq!(b.join().unwrap(), Ok(1));
    }

    #[test]
    fn leaving_party_counts_as_arrival() {
        let rendezvous = Arc::new(Rendezvous::new(3));
        let waiter = spawn_waiter(&rendezvous);
        wait_for_arrivals(&rendezvous, 1);

        rendezvous.arrive_and_deregister();
        assert_eq!(rendezvous.parties(), 2);
        assert_eq!(rendezvous.arrive_and_wait(), Ok(1));
        assert_eq!(waiter.join().unwrap(), Ok(1));
    }

    #[test]
    fn last_party_leaving_releases_the_rest() {
        let rendezvous = Arc::new(Rendezvous::new(2));
        let waiter = spawn_waiter(&rendezvous);
        wait_for_arrivals(&rendezvous, 1);

        rendezvous.arrive_and_deregister();
        assert_eq!(waiter.join().unwrap(), Ok(1));
        assert_eq!(rendezvous.parties(), 1);
    }

    #[test]
    fn registered_party_is_waited_for() {
        let rendezvous = Arc::new(Rendezvous::new(1));
        rendezvous.register(1).unwrap();

        let late = spawn_waiter(&rendezvous);
        wait_for_arrivals(&rendezvous, 1);
        assert!(!late.is_finished());

        assert_eq!(rendezvous.arrive_and_wait(), Ok(1));
        assert_eq!(late.join().unwrap(), Ok(1));
    }

    #[test]
    fn close_wakes_waiters() {
        let rendezvous = Arc::new(Rendezvous::new(2));
        let waiter = spawn_waiter(&rendezvous);
        wait_for_arrivals(&rendezvous, 1);

        rendezvous.close();
        assert_eq!(waiter.join().unwrap(), Err(RendezvousError::Closed));
        assert_eq!(rendezvous.arrive_and_wait(), Err(RendezvousError::Closed));
        assert_eq!(rendezvous.register(1), Err(RendezvousError::Closed));
    }

    #[test]
    fn arrivals_beyond_parties_are_refused() {
        let rendezvous = Rendezvous::new(0);
        assert_eq!(
            rendezvous.arrive_and_wait(),
            Err(RendezvousError::Oversubscribed)
        );
    }
}
