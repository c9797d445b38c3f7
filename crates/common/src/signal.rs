//! A gate which defers SIGINT / SIGTERM around critical sections.
//!
//! Rust signal dispositions are process-global, so the scoped handler
//! swapping a dynamic runtime would do is expressed here as a latch: the gate
//! owns the signal subscription and a shutdown [`CancellationToken`]. While
//! at least one [`BlockingContext`] is open, arriving termination signals are
//! latched instead of cancelling the token; the latched signal is re-raised
//! (the token cancelled) exactly once when the outermost context exits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Termination signals respected by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
        }
    }
}

pub struct SignalGate {
    depth: AtomicUsize,
    pending: Mutex<Option<Signal>>,
    shutdown: CancellationToken,
}

impl SignalGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            depth: AtomicUsize::new(0),
            pending: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Subscribe the gate to the process SIGINT and SIGTERM streams.
    /// Typically called once by the composing daemon.
    pub fn install(self: &Arc<Self>) -> std::io::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let gate = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = interrupt.recv() => gate.deliver(Signal::Interrupt),
                    _ = terminate.recv() => gate.deliver(Signal::Terminate),
                }
            }
        });
        Ok(())
    }

    /// The token cancelled when a termination signal takes effect.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Route a signal through the gate. Signal listener tasks call this; it
    /// also doubles as a seam for tests and synthetic shutdown requests.
    pub fn deliver(&self, signal: Signal) {
        if self.depth.load(Ordering::SeqCst) > 0 {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_none() {
                *pending = Some(signal);
            }
            tracing::debug!(
                signal = signal.name(),
                "termination signal deferred by blocking context"
            );
        } else {
            tracing::debug!(signal = signal.name(), "termination signal received");
            self.shutdown.cancel();
        }
    }

    /// Open a blocking context. Signals delivered while any context is open
    /// are held back until the outermost one drops.
    pub fn enter(self: &Arc<Self>) -> BlockingContext {
        self.depth.fetch_add(1, Ordering::SeqCst);
        BlockingContext { gate: self.clone() }
    }
}

/// Scoped guard returned by [`SignalGate::enter`].
pub struct BlockingContext {
    gate: Arc<SignalGate>,
}

impl Drop for BlockingContext {
    fn drop(&mut self) {
        if self.gate.depth.fetch_sub(1, Ordering::SeqCst) == 1 {
            let latched = self.gate.pending.lock().unwrap().take();
            if let Some(signal) = latched {
                tracing::debug!(signal = signal.name(), "resuming deferred termination signal");
                self.gate.shutdown.cancel();
            }
        }
    }
}
