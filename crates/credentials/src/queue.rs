//! Attempt queue.
//!
//! A FIFO of untried attempts shared by every pool worker. The queue also
//! tracks how many attempts are leased out, which is what lets workers tell
//! "nothing left to do" apart from "nothing to do right now".

use parking_lot::{Condvar, Mutex};
use rand::seq::SliceRandom;
use session::Attempt;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Build the cartesian product of hosts, ports, users and secrets.
pub fn attempt_matrix(
    hosts: &[IpAddr],
    ports: &[u16],
    users: &[String],
    secrets: &[String],
) -> Vec<Attempt> {
    let mut attempts =
        Vec::with_capacity(hosts.len() * ports.len() * users.len() * secrets.len());
    for host in hosts {
        for port in ports {
            for user in users {
                for secret in secrets {
                    attempts.push(Attempt::new(*host, *port, user.as_str(), secret.as_str()));
                }
            }
        }
    }
    attempts
}

/// Result of pulling from the queue.
#[derive(Debug)]
pub enum PullOutcome<'a> {
    /// An attempt to process. The lease must be dropped (or requeued) once
    /// the attempt is finished.
    Attempt(Lease<'a>),
    /// The queue was empty for the whole wait, but leased attempts may still
    /// push work back. Try again.
    TimedOut,
    /// The queue is empty and nothing is leased, or the queue was closed.
    Exhausted,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Attempt>,
    in_flight: usize,
    enqueued: usize,
    completed: usize,
    closed: bool,
}

/// Thread-safe FIFO of untried attempts.
#[derive(Default)]
pub struct AttemptQueue {
    state: Mutex<QueueState>,
    changed: Condvar,
}

impl AttemptQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a queue holding `attempts` in random order, so consecutive
    /// pulls are spread across hosts instead of hammering one host with
    /// every credential in turn.
    pub fn seeded(mut attempts: Vec<Attempt>) -> Self {
        attempts.shuffle(&mut rand::rng());
        let enqueued = attempts.len();
        Self {
            state: Mutex::new(QueueState {
                pending: attempts.into(),
                enqueued,
                ..QueueState::default()
            }),
            changed: Condvar::new(),
        }
    }

    /// Append an attempt. Returns `false` if the queue has been closed.
    ///
    /// Duplicates are accepted; the registry makes re-registration idempotent.
    pub fn push(&self, attempt: Attempt) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.pending.push_back(attempt);
        state.enqueued += 1;
        drop(state);
        self.changed.notify_one();
        true
    }

    /// Wait up to `timeout` for an attempt.
    ///
    /// The returned lease counts as in flight until it is dropped, so other
    /// workers never see the queue as exhausted while an attempt that might
    /// be requeued is still being processed.
    pub fn pull(&self, timeout: Duration) -> PullOutcome<'_> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return PullOutcome::Exhausted;
            }
            if let Some(attempt) = state.pending.pop_front() {
                state.in_flight += 1;
                return PullOutcome::Attempt(Lease {
                    queue: self,
                    attempt,
                    settled: false,
                });
            }
            if state.in_flight == 0 {
                return PullOutcome::Exhausted;
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return PullOutcome::TimedOut;
            }
        }
    }

    /// Non-blocking pull.
    pub fn try_pull(&self) -> PullOutcome<'_> {
        self.pull(Duration::ZERO)
    }

    /// Close the queue and discard everything still pending. Leased attempts
    /// finish normally but cannot be requeued. Returns how many were dropped.
    pub fn close(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.pending.len();
        state.pending.clear();
        state.closed = true;
        drop(state);
        self.changed.notify_all();
        dropped
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Pending attempts, not counting leased ones.
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// Empty with nothing leased.
    pub fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_empty() && state.in_flight == 0
    }

    /// `(completed, enqueued)` over the queue's lifetime.
    pub fn progress(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.completed, state.enqueued)
    }

    fn finish(&self, requeue: Option<Attempt>) -> bool {
        let mut state = self.state.lock();
        let mut requeued = false;
        if let Some(attempt) = requeue {
            if !state.closed {
                state.pending.push_back(attempt);
                state.enqueued += 1;
                requeued = true;
            }
        }
        state.in_flight -= 1;
        state.completed += 1;
        drop(state);
        self.changed.notify_all();
        requeued
    }
}

/// An attempt checked out of the queue.
#[derive(Debug)]
pub struct Lease<'a> {
    queue: &'a AttemptQueue,
    attempt: Attempt,
    settled: bool,
}

impl Lease<'_> {
    pub fn attempt(&self) -> &Attempt {
        &self.attempt
    }

    /// Finish this attempt and put it back at the tail of the queue.
    /// Returns `false` if the queue was closed in the meantime.
    pub fn requeue(mut self) -> bool {
        self.settled = true;
        self.queue.finish(Some(self.attempt.clone()))
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.settled = true;
            self.queue.finish(None);
        }
    }
}

impl std::fmt::Debug for AttemptQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AttemptQueue")
            .field("pending", &state.pending.len())
            .field("in_flight", &state.in_flight)
            .field("closed", &state.closed)
            .finish()
    }
}
