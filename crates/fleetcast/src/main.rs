//! fleetcast - credential discovery and lock-step command broadcast
//!
//! Main entry point: load the config, drain every host/credential
//! combination through the credential pool, then hand the authenticated
//! sessions to a broadcast group driven from the console.

mod console;
mod interrupt;
mod loopback;

use anyhow::{bail, Context, Result};
use broadcast::BroadcastGroup;
use console::ConsoleInput;
use credentials::{
    attempt_matrix, AttemptEvent, AttemptQueue, CredentialPool, CredentialRegistry, PoolReport,
};
use interrupt::Interrupts;
use loopback::LoopbackConnector;
use session::{Attempt, Connector};
use settings::{BroadcastSettings, Config, PoolSettings};
use std::io::{self, BufRead, Write};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How often phase-one progress is logged.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

/// Check if debug mode is enabled via environment variable.
fn is_debug_mode() -> bool {
    std::env::var("FLEETCAST_DEBUG").is_ok()
}

/// Initialize the logging system.
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default_filter = if is_debug_mode() {
        "fleetcast=trace,credentials=trace,broadcast=trace,info"
    } else {
        "fleetcast=info,credentials=info,broadcast=info,warn"
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(io::stderr)
                .with_target(true)
                .with_line_number(true),
        )
        .with(filter)
        .init();

    if is_debug_mode() {
        info!(
            "fleetcast v{} starting up (DEBUG MODE ENABLED)",
            env!("CARGO_PKG_VERSION")
        );
        info!("Set RUST_LOG for custom log levels, e.g. RUST_LOG=broadcast=trace");
    } else {
        info!("fleetcast v{} starting up", env!("CARGO_PKG_VERSION"));
    }
}

fn load() -> Config {
    let path = settings::ensure_config_file().unwrap_or_else(settings::config_path);
    info!(path = %path.display(), "Loading config");
    settings::load_config(&path)
}

/// Print every attempt as it finishes and log progress now and then.
/// Returns once every pool worker has exited.
fn follow_pool(events: Receiver<AttemptEvent>, queue: &AttemptQueue) {
    let mut last_progress = Instant::now();
    for event in events {
        match event {
            AttemptEvent::Registered(attempt) => println!("[+] {attempt}"),
            AttemptEvent::Revalidated(attempt) => debug!(attempt = %attempt, "Still valid"),
            AttemptEvent::AuthFailed(attempt) => println!("[-] {attempt}"),
            AttemptEvent::Dropped { attempt, reason } => println!("[!] {attempt}: {reason}"),
        }
        if last_progress.elapsed() >= PROGRESS_INTERVAL {
            let (completed, total) = queue.progress();
            info!(completed, total, "Credential discovery progress");
            last_progress = Instant::now();
        }
    }
}

/// Phase one: drain every attempt through the pool. An interrupt stops the
/// pool early; whatever registered by then goes on to phase two.
fn discover(
    attempts: Vec<Attempt>,
    registry: &Arc<CredentialRegistry>,
    connector: &Arc<dyn Connector>,
    settings: &PoolSettings,
    interrupts: &Interrupts,
) -> Result<PoolReport> {
    let queue = Arc::new(AttemptQueue::seeded(attempts));
    let (events_tx, events) = mpsc::channel();

    let pool = CredentialPool::spawn(
        Arc::clone(&queue),
        Arc::clone(registry),
        Arc::clone(connector),
        settings,
        Some(events_tx),
    )
    .context("Failed to start credential pool")?;

    let stopper = pool.stopper();
    interrupts.on_interrupt(move || {
        if !stopper.is_stopped() {
            info!("Stopping credential discovery");
        }
        stopper.stop();
    });
    if settings.retry_on_success {
        info!("Retry on success is on, interrupt to stop discovery and start broadcasting");
    }

    follow_pool(events, &queue);
    interrupts.clear();
    Ok(pool.join())
}

/// Phase two: form the group from the registry and serve console commands
/// until exit, end of input, or an interrupt. Shutdown always runs the
/// final round.
fn serve(
    registry: Arc<CredentialRegistry>,
    connector: Arc<dyn Connector>,
    settings: &BroadcastSettings,
    interrupts: &Interrupts,
    input: impl BufRead + Send + 'static,
    out: &mut impl Write,
) -> Result<()> {
    let mut group = BroadcastGroup::form(registry, connector, settings)
        .context("Failed to form broadcast group")?;

    let (input_tx, lines) = mpsc::channel();
    let interrupt_tx = input_tx.clone();
    interrupts.on_interrupt(move || {
        let _ = interrupt_tx.send(ConsoleInput::Interrupted);
    });
    console::spawn_reader(input, input_tx).context("Failed to start console reader")?;

    let served = console::run(&mut group, &lines, out);
    interrupts.on_interrupt(|| info!("Already shutting down"));
    let shutdown = group.shutdown().context("Failed to shut down broadcast group");
    interrupts.clear();
    served.and(shutdown)
}

fn run() -> Result<()> {
    let config = load();
    let interrupts = Interrupts::install().context("Failed to listen for interrupts")?;

    let hosts = config
        .targets
        .expand_hosts()
        .context("Failed to expand target hosts")?;
    let users = &config.credentials.users;
    let secrets = &config.credentials.secrets;
    if hosts.is_empty() || config.targets.ports.is_empty() {
        bail!("No targets configured, add hosts and ports under [targets]");
    }
    if users.is_empty() || secrets.is_empty() {
        bail!("No credentials configured, add users and secrets under [credentials]");
    }

    let attempts = attempt_matrix(&hosts, &config.targets.ports, users, secrets);
    info!(
        hosts = hosts.len(),
        ports = config.targets.ports.len(),
        attempts = attempts.len(),
        "Seeding attempt queue"
    );

    let connector: Arc<dyn Connector> = Arc::new(LoopbackConnector::new(&config.loopback));
    let registry = Arc::new(CredentialRegistry::new());

    let report = discover(attempts, &registry, &connector, &config.pool, &interrupts)?;
    if registry.is_empty() {
        warn!(attempted = report.attempted, "No credentials worked");
        return Ok(());
    }

    serve(
        registry,
        connector,
        &config.broadcast,
        &interrupts,
        io::BufReader::new(io::stdin()),
        &mut io::stdout(),
    )
}

fn main() {
    init_logging();

    if let Err(e) = run() {
        error!("{e:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use session::fake::FakeNetwork;
    use std::io::Cursor;
    use std::net::{IpAddr, Ipv4Addr};
    use std::thread;

    const HOST: IpAddr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));

    /// Input that never yields a line, like an idle terminal.
    struct IdleInput(Receiver<()>);

    impl io::Read for IdleInput {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            let _ = self.0.recv();
            Ok(0)
        }
    }

    fn retrying_pool() -> PoolSettings {
        PoolSettings {
            workers: 2,
            pull_timeout_ms: 20,
            start_jitter_ms: 5,
            retry_on_success: true,
            ..PoolSettings::default()
        }
    }

    #[test]
    fn interrupt_ends_retry_mode_and_hands_registry_to_the_group() {
        let net = FakeNetwork::new();
        net.accept(HOST, "ops", "letmein");
        let connector: Arc<dyn Connector> = Arc::new(net.clone());
        let registry = Arc::new(CredentialRegistry::new());
        let interrupts = Interrupts::default();

        let operator = {
            let interrupts = interrupts.clone();
            let net = net.clone();
            thread::spawn(move || {
                let deadline = Instant::now() + Duration::from_secs(5);
                while Instant::now() < deadline {
                    if net.opens(HOST) >= 3 && interrupts.fire() {
                        return true;
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                false
            })
        };

        let attempts = vec![
            Attempt::new(HOST, 22, "ops", "letmein"),
            Attempt::new(HOST, 22, "ops", "wrong"),
        ];
        let report = discover(attempts, &registry, &connector, &retrying_pool(), &interrupts)
            .unwrap();
        assert!(operator.join().unwrap());
        assert!(report.registered >= 3);
        assert_eq!(registry.attempts(), vec![Attempt::new(HOST, 22, "ops", "letmein")]);
        // Discovery is over, a late interrupt has nobody to stop.
        assert!(!interrupts.fire());

        let mut out = Vec::new();
        serve(
            Arc::clone(&registry),
            connector,
            &BroadcastSettings::default(),
            &interrupts,
            Cursor::new("run echo phase2\nexit\n"),
            &mut out,
        )
        .unwrap();
        let output = String::from_utf8(out).unwrap();
        assert!(output.contains("1 sessions ready"));
        assert!(output.contains("--- ops@127.0.0.1:22\nphase2\n"));
        assert!(registry.is_empty());
        assert_eq!(net.open_sessions(HOST), 0);
    }

    #[test]
    fn interrupt_during_the_console_still_runs_the_final_round() {
        let net = FakeNetwork::new();
        net.accept(HOST, "ops", "letmein");
        let connector: Arc<dyn Connector> = Arc::new(net.clone());
        let registry = Arc::new(CredentialRegistry::new());
        let attempt = Attempt::new(HOST, 22, "ops", "letmein");
        registry.register(attempt.clone(), connector.open(&attempt).unwrap());

        let interrupts = Interrupts::default();
        let operator = {
            let interrupts = interrupts.clone();
            thread::spawn(move || {
                let deadline = Instant::now() + Duration::from_secs(5);
                while Instant::now() < deadline {
                    if interrupts.fire() {
                        return true;
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                false
            })
        };

        let (_keep_open, idle) = mpsc::channel();
        let mut out = Vec::new();
        serve(
            Arc::clone(&registry),
            connector,
            &BroadcastSettings::default(),
            &interrupts,
            io::BufReader::new(IdleInput(idle)),
            &mut out,
        )
        .unwrap();

        assert!(operator.join().unwrap());
        assert!(String::from_utf8(out).unwrap().contains("interrupted"));
        assert!(registry.is_empty());
        assert_eq!(net.open_sessions(HOST), 0);
    }
}
