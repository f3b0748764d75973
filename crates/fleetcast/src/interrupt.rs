//! Operator interrupts.
//!
//! Ctrl+C is caught on a dedicated thread and handed to whatever the current
//! phase registered: a pool stop while credentials drain, the end of the
//! console once the group is up. With nothing registered the process exits
//! the way it would without a listener.

use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

/// Exit status for a process ended by SIGINT.
const INTERRUPTED_EXIT_CODE: i32 = 130;

type Handler = Box<dyn Fn() + Send>;

#[derive(Clone, Default)]
pub struct Interrupts {
    handler: Arc<Mutex<Option<Handler>>>,
}

impl Interrupts {
    /// Start listening for Ctrl+C.
    pub fn install() -> io::Result<Self> {
        let interrupts = Self::default();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let listener = interrupts.clone();
        thread::Builder::new()
            .name("interrupts".into())
            .spawn(move || {
                runtime.block_on(async {
                    loop {
                        if let Err(e) = tokio::signal::ctrl_c().await {
                            warn!(error = %e, "Interrupt listener failed");
                            return;
                        }
                        if !listener.fire() {
                            std::process::exit(INTERRUPTED_EXIT_CODE);
                        }
                    }
                })
            })?;
        Ok(interrupts)
    }

    /// Replace the current handler.
    pub fn on_interrupt(&self, handler: impl Fn() + Send + 'static) {
        *self.handler.lock() = Some(Box::new(handler));
    }

    pub fn clear(&self) {
        *self.handler.lock() = None;
    }

    /// Run the current handler. Returns false when none is registered.
    pub fn fire(&self) -> bool {
        match self.handler.lock().as_ref() {
            Some(handler) => {
                info!("Interrupt received");
                handler();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fires_the_latest_handler_only() {
        let interrupts = Interrupts::default();
        assert!(!interrupts.fire());

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&first);
        interrupts.on_interrupt(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(interrupts.fire());

        let counter = Arc::clone(&second);
        interrupts.on_interrupt(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(interrupts.clone().fire());
        assert!(interrupts.fire());

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);

        interrupts.clear();
        assert!(!interrupts.fire());
    }
}
