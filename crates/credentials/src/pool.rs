//! Credential worker pool.
//!
//! A fixed set of threads drains the attempt queue. Each attempt opens a
//! fresh session; successes land in the registry, wrong credentials are
//! discarded, and transport failures are logged and dropped. One bad host
//! never stops the other workers.

use crate::queue::{AttemptQueue, Lease, PullOutcome};
use crate::registry::{CredentialRegistry, Registration};
use session::{Attempt, Connector, SessionError};
use settings::PoolSettings;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Shared stop flag for operator interrupts and early cutoff.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-attempt notification sent to whoever drives the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptEvent {
    /// First success for this tuple.
    Registered(Attempt),
    /// A tuple that had already succeeded authenticated again (retry mode).
    Revalidated(Attempt),
    AuthFailed(Attempt),
    Dropped { attempt: Attempt, reason: String },
}

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Registered(Registration),
    AuthFailed,
    Dropped(String),
}

/// Totals over a pool's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub attempted: usize,
    pub registered: usize,
    pub auth_failed: usize,
    pub dropped: usize,
    /// Attempts discarded unprocessed by a stop signal.
    pub cancelled: usize,
}

#[derive(Default)]
struct PoolStats {
    attempted: AtomicUsize,
    registered: AtomicUsize,
    auth_failed: AtomicUsize,
    dropped: AtomicUsize,
    cancelled: AtomicUsize,
}

impl PoolStats {
    fn snapshot(&self) -> PoolReport {
        PoolReport {
            attempted: self.attempted.load(Ordering::SeqCst),
            registered: self.registered.load(Ordering::SeqCst),
            auth_failed: self.auth_failed.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
        }
    }
}

/// Cloneable handle that stops a running pool from another thread, for
/// example an interrupt handler.
#[derive(Clone)]
pub struct PoolStopper {
    stop: StopSignal,
    queue: Arc<AttemptQueue>,
    stats: Arc<PoolStats>,
}

impl PoolStopper {
    /// Stop pulling and discard whatever is still queued. Attempts already
    /// in progress run to completion and retry mode ends with them.
    pub fn stop(&self) {
        self.stop.stop();
        let cancelled = self.queue.close();
        if cancelled > 0 {
            self.stats.cancelled.fetch_add(cancelled, Ordering::SeqCst);
            info!(cancelled, "Credential pool stopped, queue drained");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }
}

/// Running pool. Call [`CredentialPool::join`] to wait for the queue to
/// drain.
pub struct CredentialPool {
    workers: Vec<thread::JoinHandle<()>>,
    queue: Arc<AttemptQueue>,
    stop: StopSignal,
    stats: Arc<PoolStats>,
}

impl CredentialPool {
    /// Start `settings.worker_count()` workers against `queue`.
    ///
    /// With `retry_on_success` set, successful attempts go back on the queue
    /// and the pool only finishes once stopped.
    pub fn spawn(
        queue: Arc<AttemptQueue>,
        registry: Arc<CredentialRegistry>,
        connector: Arc<dyn Connector>,
        settings: &PoolSettings,
        events: Option<Sender<AttemptEvent>>,
    ) -> io::Result<Self> {
        let stop = StopSignal::new();
        let stats = Arc::new(PoolStats::default());
        let init_commands: Arc<[String]> = settings.expanded_init_commands().into();
        let worker_count = settings.worker_count();

        let mut pool = Self {
            workers: Vec::with_capacity(worker_count),
            queue: Arc::clone(&queue),
            stop: stop.clone(),
            stats: Arc::clone(&stats),
        };

        for id in 0..worker_count {
            let worker = PoolWorker {
                id,
                queue: Arc::clone(&queue),
                registry: Arc::clone(&registry),
                connector: Arc::clone(&connector),
                stop: stop.clone(),
                stats: Arc::clone(&stats),
                events: events.clone(),
                init_commands: Arc::clone(&init_commands),
                retry_on_success: settings.retry_on_success,
                pull_timeout: settings.pull_timeout(),
                start_jitter: settings.start_jitter(),
            };
            let handle = thread::Builder::new()
                .name(format!("cred-worker-{id}"))
                .spawn(move || worker.run());
            match handle {
                Ok(handle) => pool.workers.push(handle),
                Err(e) => {
                    // Workers already running exit once the queue closes.
                    pool.stop();
                    pool.join_workers();
                    return Err(e);
                }
            }
        }

        info!(
            workers = worker_count,
            queued = queue.len(),
            "Credential pool started"
        );
        Ok(pool)
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn stopper(&self) -> PoolStopper {
        PoolStopper {
            stop: self.stop.clone(),
            queue: Arc::clone(&self.queue),
            stats: Arc::clone(&self.stats),
        }
    }

    /// See [`PoolStopper::stop`].
    pub fn stop(&self) {
        self.stopper().stop();
    }

    /// Snapshot of the totals so far.
    pub fn report(&self) -> PoolReport {
        self.stats.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.workers.iter().all(|handle| handle.is_finished())
    }

    /// Wait until every worker has exited.
    pub fn join(mut self) -> PoolReport {
        self.join_workers();
        let report = self.stats.snapshot();
        info!(
            attempted = report.attempted,
            registered = report.registered,
            auth_failed = report.auth_failed,
            dropped = report.dropped,
            cancelled = report.cancelled,
            "Credential pool finished"
        );
        report
    }

    fn join_workers(&mut self) {
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("Credential worker panicked");
            }
        }
    }
}

struct PoolWorker {
    id: usize,
    queue: Arc<AttemptQueue>,
    registry: Arc<CredentialRegistry>,
    connector: Arc<dyn Connector>,
    stop: StopSignal,
    stats: Arc<PoolStats>,
    events: Option<Sender<AttemptEvent>>,
    init_commands: Arc<[String]>,
    retry_on_success: bool,
    pull_timeout: Duration,
    start_jitter: Duration,
}

impl PoolWorker {
    fn run(self) {
        thread::sleep(util::start_jitter(self.start_jitter));

        loop {
            if self.stop.is_stopped() {
                let cancelled = self.queue.close();
                self.stats.cancelled.fetch_add(cancelled, Ordering::SeqCst);
                break;
            }

            match self.queue.pull(self.pull_timeout) {
                PullOutcome::Attempt(lease) => self.process(lease),
                PullOutcome::TimedOut => continue,
                PullOutcome::Exhausted => break,
            }
        }

        debug!(worker = self.id, "Credential worker exiting");
    }

    fn process(&self, lease: Lease<'_>) {
        let attempt = lease.attempt().clone();
        let outcome = self.try_attempt(&attempt);

        match &outcome {
            AttemptOutcome::Registered(registration) => {
                self.stats.registered.fetch_add(1, Ordering::SeqCst);
                if *registration == Registration::New {
                    self.emit(AttemptEvent::Registered(attempt.clone()));
                } else {
                    self.emit(AttemptEvent::Revalidated(attempt.clone()));
                }
                if self.retry_on_success && !self.stop.is_stopped() {
                    lease.requeue();
                }
            }
            AttemptOutcome::AuthFailed => {
                self.stats.auth_failed.fetch_add(1, Ordering::SeqCst);
                self.emit(AttemptEvent::AuthFailed(attempt));
            }
            AttemptOutcome::Dropped(reason) => {
                self.stats.dropped.fetch_add(1, Ordering::SeqCst);
                self.emit(AttemptEvent::Dropped {
                    attempt,
                    reason: reason.clone(),
                });
            }
        }
    }

    /// Authenticate once and register the session on success.
    fn try_attempt(&self, attempt: &Attempt) -> AttemptOutcome {
        self.stats.attempted.fetch_add(1, Ordering::SeqCst);

        let session = match self.connector.open(attempt) {
            Ok(session) => session,
            Err(SessionError::AuthFailed) => {
                debug!(attempt = %attempt, "Login failed");
                return AttemptOutcome::AuthFailed;
            }
            Err(e) => {
                warn!(attempt = %attempt, error = %e, "Dropping attempt");
                return AttemptOutcome::Dropped(e.to_string());
            }
        };

        let registration = self.registry.register(attempt.clone(), session);
        match registration {
            Registration::New => info!(attempt = %attempt, "Login succeeded"),
            Registration::Replaced => {
                debug!(attempt = %attempt, "Login succeeded again, replaced earlier session");
            }
            Registration::AlreadyClaimed => {
                debug!(
                    attempt = %attempt,
                    "Login succeeded again, already owned by a broadcast worker"
                );
                return AttemptOutcome::Registered(registration);
            }
        }

        if !self.init_commands.is_empty() {
            self.registry.with_unclaimed(attempt, |session| {
                for command in self.init_commands.iter() {
                    if let Err(e) = session.run(command) {
                        warn!(attempt = %attempt, command = %command, error = %e, "Init command failed");
                    }
                }
            });
        }
        AttemptOutcome::Registered(registration)
    }

    fn emit(&self, event: AttemptEvent) {
        if let Some(events) = &self.events {
            // The receiver going away only means nobody is listening.
            let _ = events.send(event);
        }
    }
}
